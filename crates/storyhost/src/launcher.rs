use std::path::PathBuf;
use std::time::Duration;

use tamayo::{LaunchError, Launcher, OutputMarkers, ProcessLauncher, StartConfig, Worker, WorkerCommand, WorkerProtocol};

use crate::config::{Protocol, Settings};

/// Picks how a worker runs for each start: this binary as `storyhost worker`,
/// or the build-tool command itself with lifecycle read off its output.
pub struct StoryLauncher {
	exe: PathBuf,
	protocol: Protocol,
	command: String,
	markers: OutputMarkers,
	kill_grace: Option<Duration>,
}

impl StoryLauncher {
	pub fn new(settings: &Settings, exe: PathBuf) -> Self {
		Self {
			exe,
			protocol: settings.worker.protocol,
			command: settings.worker.command.clone(),
			markers: settings.worker.markers.clone(),
			kill_grace: settings.kill_grace(),
		}
	}
}

impl Launcher for StoryLauncher {
	fn launch(&self, config: &StartConfig) -> Result<Worker, LaunchError> {
		let launcher = match self.protocol {
			Protocol::Ipc => ProcessLauncher::new(WorkerCommand::new(&self.exe).arg("worker")),
			Protocol::Markers => ProcessLauncher::new(WorkerCommand::shell(expand(&self.command, config)))
				.protocol(WorkerProtocol::Markers(self.markers.clone())),
		};
		launcher.kill_grace(self.kill_grace).launch(config)
	}
}

/// Fill `{port}`, `{config_dir}`, `{root}` and `{static_dirs}` (comma
/// separated) into a command template, shell-quoted.
pub fn expand(template: &str, config: &StartConfig) -> String {
	template
		.replace("{port}", &config.port.to_string())
		.replace("{config_dir}", &shell_quote(&config.config_dir))
		.replace("{root}", &shell_quote(&config.root_path.to_string_lossy()))
		.replace("{static_dirs}", &shell_quote(&config.static_dirs.join(",")))
}

pub fn shell_quote(s: &str) -> String {
	let plain = !s.is_empty()
		&& s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:,=@%+".contains(c));
	if plain {
		s.to_string()
	} else {
		format!("'{}'", s.replace('\'', "'\\''"))
	}
}
