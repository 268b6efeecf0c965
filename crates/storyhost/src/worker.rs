//! `storyhost worker`: the process a supervisor spawns.
//!
//! Receives the start configuration over the control socket, runs the build
//! tool under `sh -c`, passes its output through untouched and reports
//! lifecycle changes read off that output. After reporting `ERROR` the worker
//! stays up until it is told to stop, so the report is never overtaken by its
//! own exit.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tamayo::markers::MarkerSniffer;
use tamayo::state::Transition;
use tamayo::supervisor::Utf8Decoder;
use tamayo::{LifecycleMessage, ServerState, StartConfig, WorkerChannel};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::{self, Overrides};
use crate::error::CliError;
use crate::launcher::expand;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub async fn run() -> Result<(), CliError> {
	let mut sigterm = signal(SignalKind::terminate())?;
	let (mut channel, config) = WorkerChannel::connect_from_env().await?;
	tracing::debug!(port = config.port, root = %config.root_path.display(), "worker got start config");

	if let Err(cause) = check_dirs(&config) {
		return fail(&mut channel, &mut sigterm, cause).await;
	}
	let settings = match config::load(&Overrides::for_root(&config.root_path)) {
		Ok(settings) => settings,
		Err(e) => return fail(&mut channel, &mut sigterm, e.to_string()).await,
	};
	channel.report(&LifecycleMessage::new(ServerState::Starting)).await?;

	let script = expand(&settings.worker.command, &config);
	let spawned = Command::new("sh")
		.arg("-c")
		.arg(&script)
		.current_dir(&config.root_path)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn();
	let mut tool = match spawned {
		Ok(child) => child,
		Err(e) => return fail(&mut channel, &mut sigterm, format!("failed to run `{}`: {}", script, e)).await,
	};
	tracing::debug!(pid = ?tool.id(), "running {}", script);

	let (tx, mut reports) = mpsc::unbounded_channel();
	let mut forwarders = Vec::new();
	if let Some(out) = tool.stdout.take() {
		let sniffer = MarkerSniffer::new(settings.worker.markers.clone());
		forwarders.push(tokio::spawn(forward(out, tokio::io::stdout(), sniffer, tx.clone())));
	}
	if let Some(err) = tool.stderr.take() {
		let sniffer = MarkerSniffer::new(settings.worker.markers.clone());
		forwarders.push(tokio::spawn(forward(err, tokio::io::stderr(), sniffer, tx.clone())));
	}
	drop(tx);

	let mut state = ServerState::Starting;
	let status = loop {
		tokio::select! {
			Some(msg) = reports.recv() => relay(&mut channel, &mut state, msg).await?,
			status = tool.wait() => break status?,
			_ = sigterm.recv() => {
				let _ = tool.start_kill();
				let _ = tool.wait().await;
				return Ok(());
			}
		}
	};

	let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
		for forwarder in forwarders.iter_mut() {
			let _ = forwarder.await;
		}
	})
	.await;
	while let Ok(msg) = reports.try_recv() {
		relay(&mut channel, &mut state, msg).await?;
	}

	match state {
		ServerState::Listening => Err(CliError::ToolExited(status)),
		ServerState::Error => linger(&mut channel, &mut sigterm).await,
		_ => fail(&mut channel, &mut sigterm, exited_early(status)).await,
	}
}

/// Root, config dir and every static dir must exist. Static dirs may be
/// given as `from:to`; only `from` is checked.
pub fn check_dirs(config: &StartConfig) -> Result<(), String> {
	if !config.root_path.is_dir() {
		return Err(format!("project root {} does not exist", config.root_path.display()));
	}
	let config_dir = config.root_path.join(&config.config_dir);
	if !config_dir.is_dir() {
		return Err(format!("config directory {} does not exist", config_dir.display()));
	}
	for dir in &config.static_dirs {
		let from = dir.split(':').next().unwrap_or(dir);
		let path = config.root_path.join(from);
		if !path.is_dir() {
			return Err(format!("static directory {} does not exist", path.display()));
		}
	}
	Ok(())
}

fn exited_early(status: ExitStatus) -> String {
	format!("build tool exited with {} before the server was listening", status)
}

async fn relay(
	channel: &mut WorkerChannel,
	state: &mut ServerState,
	msg: LifecycleMessage,
) -> Result<(), CliError> {
	if let Transition::To(next) = state.on_report(msg.state) {
		*state = next;
		channel.report(&msg).await?;
	}
	Ok(())
}

async fn fail(channel: &mut WorkerChannel, sigterm: &mut Signal, cause: String) -> Result<(), CliError> {
	tracing::debug!("reporting failure: {}", cause);
	channel.report(&LifecycleMessage::error(cause)).await?;
	linger(channel, sigterm).await
}

async fn linger(channel: &mut WorkerChannel, sigterm: &mut Signal) -> Result<(), CliError> {
	tokio::select! {
		_ = channel.closed() => {}
		_ = sigterm.recv() => {}
	}
	Ok(())
}

async fn forward<R, W>(
	mut reader: R,
	mut out: W,
	mut sniffer: MarkerSniffer,
	reports: mpsc::UnboundedSender<LifecycleMessage>,
) where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = [0u8; 4096];
	let mut decoder = Utf8Decoder::default();
	loop {
		let n = match reader.read(&mut buf).await {
			Ok(0) | Err(_) => break,
			Ok(n) => n,
		};
		if out.write_all(&buf[..n]).await.is_err() {
			break;
		}
		let _ = out.flush().await;
		for msg in sniffer.feed(&decoder.decode(&buf[..n])) {
			let _ = reports.send(msg);
		}
	}
	for msg in sniffer.feed(&decoder.finish()) {
		let _ = reports.send(msg);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

	fn temp_dir(name: &str) -> std::path::PathBuf {
		let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir().join(format!("storyhost-worker-{}-{}-{}", std::process::id(), n, name));
		let _ = std::fs::create_dir_all(&dir);
		dir
	}

	fn config(root: std::path::PathBuf, static_dirs: &[&str]) -> StartConfig {
		StartConfig {
			root_path: root,
			port: 6006,
			static_dirs: static_dirs.iter().map(|s| s.to_string()).collect(),
			config_dir: ".storybook".into(),
		}
	}

	#[test]
	fn missing_config_dir() {
		let root = temp_dir("no-config");
		let err = check_dirs(&config(root, &[])).unwrap_err();
		assert!(err.starts_with("config directory"), "{}", err);
		assert!(err.ends_with(".storybook does not exist"), "{}", err);
	}

	#[test]
	fn static_dirs_checked_by_source_path() {
		let root = temp_dir("static");
		std::fs::create_dir_all(root.join(".storybook")).unwrap();
		std::fs::create_dir_all(root.join("public")).unwrap();

		assert!(check_dirs(&config(root.clone(), &["public", "public:/assets"])).is_ok());
		let err = check_dirs(&config(root, &["public", "fonts"])).unwrap_err();
		assert!(err.contains("static directory"), "{}", err);
		assert!(err.contains("fonts"), "{}", err);
	}

	#[tokio::test]
	async fn forward_passes_bytes_and_sniffs_lines() {
		let input: &[u8] = b"webpack building\nLocal: http://localhost:6006/\n";
		let mut out = Vec::new();
		let (tx, mut rx) = mpsc::unbounded_channel();
		forward(input, &mut out, MarkerSniffer::new(Default::default()), tx).await;

		assert_eq!(out, input);
		assert_eq!(rx.recv().await, Some(LifecycleMessage::new(ServerState::Building)));
		assert_eq!(rx.recv().await, Some(LifecycleMessage::new(ServerState::Listening)));
		assert_eq!(rx.recv().await, None);
	}
}
