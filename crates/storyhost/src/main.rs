mod config;
mod error;
mod launcher;
mod serve;
mod worker;

use std::future::Future;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use config::Overrides;
use error::CliError;

#[derive(Parser)]
#[command(name = "storyhost", version, about = "Run and watch a Storybook dev server from the terminal")]
struct Cli {
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
	/// Start the dev server and stream its output (default command)
	Serve {
		#[command(flatten)]
		overrides: Overrides,
		/// Keep streaming output after the server is listening
		#[arg(long, short)]
		follow: bool,
	},
	/// Print the effective configuration as TOML
	Config {
		#[command(flatten)]
		overrides: Overrides,
	},
	/// Worker process started by `serve`; not meant to be run by hand
	#[command(hide = true)]
	Worker,
}

fn main() {
	init_tracing();
	let cli = Cli::parse();

	let result = match cli.command {
		None => block_on(serve::run(Overrides::default(), false)),
		Some(Command::Serve { overrides, follow }) => block_on(serve::run(overrides, follow)),
		Some(Command::Config { overrides }) => cmd_config(&overrides),
		Some(Command::Worker) => block_on(worker::run()),
	};

	if let Err(e) = result {
		eprintln!("{} {}", "error:".red().bold(), e);
		std::process::exit(1);
	}
}

/// Diagnostics go to stderr so they never mix with the transcript on stdout.
fn init_tracing() {
	let filter = EnvFilter::try_from_env("STORYHOST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();
}

fn block_on<F: Future<Output = Result<(), CliError>>>(fut: F) -> Result<(), CliError> {
	tokio::runtime::Runtime::new()?.block_on(fut)
}

fn cmd_config(overrides: &Overrides) -> Result<(), CliError> {
	let settings = config::load(overrides)?;
	eprintln!("{} {}", "#".dimmed(), config::global_config_path().display().dimmed());
	eprintln!(
		"{} {}",
		"#".dimmed(),
		settings.root.join(config::PROJECT_FILE).display().dimmed()
	);
	print!("{}", toml::to_string(&settings)?);
	Ok(())
}
