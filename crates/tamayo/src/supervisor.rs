use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::LaunchError;
use crate::ipc::{ControlSocket, IPC_ENV};
use crate::markers::{MarkerSniffer, OutputMarkers};
use crate::sanitize::LaunchSanitizer;
use crate::types::{StartConfig, WorkerEvent};

/// How long to keep reading output after the worker exited, for grandchildren
/// that still hold the pipes.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Starts workers. The manager owns exactly one live [`Worker`] at a time.
pub trait Launcher: Send + Sync {
	fn launch(&self, config: &StartConfig) -> Result<Worker, LaunchError>;
}

/// A spawned worker: its ordered event stream plus a way to stop it.
pub struct Worker {
	pub events: mpsc::UnboundedReceiver<WorkerEvent>,
	pub control: Box<dyn WorkerControl>,
}

pub trait WorkerControl: Send {
	/// Ask the worker to stop and return without waiting for it to exit.
	fn terminate(self: Box<Self>);
	fn pid(&self) -> Option<u32>;
}

/// Program and arguments used to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
	pub program: PathBuf,
	pub args: Vec<String>,
}

impl WorkerCommand {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
		}
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	/// `sh -c <script>`.
	pub fn shell(script: impl Into<String>) -> Self {
		Self::new("sh").arg("-c").arg(script)
	}
}

/// How lifecycle information travels from worker to supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerProtocol {
	/// Structured frames over the control socket named by `TAMAYO_IPC_PATH`.
	Ipc,
	/// Start config as one JSON line on stdin; lifecycle inferred from output.
	Markers(OutputMarkers),
}

/// Launches workers as OS processes in their own process group.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
	pub command: WorkerCommand,
	pub protocol: WorkerProtocol,
	pub sanitizer: LaunchSanitizer,
	/// Escalate to SIGKILL if the worker outlives SIGTERM by this long.
	pub kill_grace: Option<Duration>,
}

impl ProcessLauncher {
	pub fn new(command: WorkerCommand) -> Self {
		Self {
			command,
			protocol: WorkerProtocol::Ipc,
			sanitizer: LaunchSanitizer::default(),
			kill_grace: Some(Duration::from_secs(3)),
		}
	}

	pub fn protocol(mut self, protocol: WorkerProtocol) -> Self {
		self.protocol = protocol;
		self
	}

	pub fn kill_grace(mut self, grace: Option<Duration>) -> Self {
		self.kill_grace = grace;
		self
	}
}

impl Launcher for ProcessLauncher {
	fn launch(&self, config: &StartConfig) -> Result<Worker, LaunchError> {
		let socket = match self.protocol {
			WorkerProtocol::Ipc => Some(ControlSocket::bind()?),
			WorkerProtocol::Markers(_) => None,
		};

		let mut cmd = Command::new(&self.command.program);
		cmd.args(self.sanitizer.args(&self.command.args))
			.current_dir(&config.root_path)
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);
		self.sanitizer.apply(&mut cmd);

		match &socket {
			Some(socket) => {
				cmd.env(IPC_ENV, socket.path()).stdin(Stdio::null());
			}
			None => {
				cmd.env_remove(IPC_ENV).stdin(Stdio::piped());
			}
		}

		let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
			program: self.command.program.display().to_string(),
			source,
		})?;
		let pid = child.id();
		tracing::info!(pid = ?pid, port = config.port, "spawned worker {}", self.command.program.display());

		let (tx, rx) = mpsc::unbounded_channel();

		let markers = match &self.protocol {
			WorkerProtocol::Markers(markers) => Some(markers.clone()),
			WorkerProtocol::Ipc => None,
		};
		let sniffer = || markers.clone().map(MarkerSniffer::new);

		let mut readers = Vec::new();
		if let Some(stdout) = child.stdout.take() {
			readers.push(tokio::spawn(pipe_output(stdout, tx.clone(), WorkerEvent::Stdout, sniffer())));
		}
		if let Some(stderr) = child.stderr.take() {
			readers.push(tokio::spawn(pipe_output(stderr, tx.clone(), WorkerEvent::Stderr, sniffer())));
		}

		let control_task = match socket {
			Some(socket) => tokio::spawn(socket.serve(config.clone(), tx.clone())),
			None => {
				let stdin = child.stdin.take();
				tokio::spawn(send_config_line(stdin, config.clone()))
			}
		};

		let (cancel_tx, cancel_rx) = watch::channel(false);
		tokio::spawn(wait_for_exit(child, readers, control_task, tx, cancel_rx, self.kill_grace));

		Ok(Worker {
			events: rx,
			control: Box::new(ProcessControl { pid, cancel: cancel_tx }),
		})
	}
}

struct ProcessControl {
	pid: Option<u32>,
	cancel: watch::Sender<bool>,
}

impl WorkerControl for ProcessControl {
	fn terminate(self: Box<Self>) {
		if let Some(pid) = self.pid {
			tracing::info!(pid, "stopping worker");
			signal_group(pid, nix::sys::signal::Signal::SIGTERM);
		}
		let _ = self.cancel.send(true);
	}

	fn pid(&self) -> Option<u32> {
		self.pid
	}
}

fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
	use nix::sys::signal::killpg;
	use nix::unistd::Pid;
	if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
		tracing::debug!(pid, "killpg {:?} failed: {}", signal, e);
	}
}

async fn wait_for_exit(
	mut child: Child,
	mut readers: Vec<JoinHandle<()>>,
	control_task: JoinHandle<()>,
	events: mpsc::UnboundedSender<WorkerEvent>,
	mut cancel: watch::Receiver<bool>,
	kill_grace: Option<Duration>,
) {
	let pid = child.id();
	let status = tokio::select! {
		status = child.wait() => status,
		_ = cancel.changed() => {
			// Stop was requested; SIGTERM already went out. Reap, escalating if needed.
			match kill_grace {
				Some(grace) => {
					if tokio::time::timeout(grace, child.wait()).await.is_err() {
						if let Some(pid) = pid {
							tracing::warn!(pid, "worker ignored SIGTERM for {:?}, killing", grace);
							signal_group(pid, nix::sys::signal::Signal::SIGKILL);
						}
						let _ = child.wait().await;
					}
				}
				None => {
					let _ = child.wait().await;
				}
			}
			control_task.abort();
			for reader in readers {
				reader.abort();
			}
			return;
		}
	};

	let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
		for reader in readers.iter_mut() {
			let _ = reader.await;
		}
	})
	.await;
	for reader in &readers {
		reader.abort();
	}
	control_task.abort();

	let code = match status {
		Ok(status) => status.code(),
		Err(e) => {
			tracing::warn!("failed to wait for worker: {}", e);
			None
		}
	};
	tracing::info!(pid = ?pid, code = ?code, "worker exited");
	let _ = events.send(WorkerEvent::Exited(code));
}

async fn send_config_line(stdin: Option<ChildStdin>, config: StartConfig) {
	let Some(mut stdin) = stdin else {
		return;
	};
	let mut data = match serde_json::to_vec(&config) {
		Ok(d) => d,
		Err(e) => {
			tracing::error!("failed to serialize start config: {}", e);
			return;
		}
	};
	data.push(b'\n');
	if let Err(e) = stdin.write_all(&data).await {
		tracing::debug!("worker stdin closed before start config was written: {}", e);
	}
}

async fn pipe_output<R: AsyncRead + Unpin>(
	mut reader: R,
	events: mpsc::UnboundedSender<WorkerEvent>,
	wrap: fn(String) -> WorkerEvent,
	mut sniffer: Option<MarkerSniffer>,
) {
	let mut buf = [0u8; 4096];
	let mut decoder = Utf8Decoder::default();
	loop {
		let n = match reader.read(&mut buf).await {
			Ok(0) | Err(_) => break,
			Ok(n) => n,
		};
		let text = decoder.decode(&buf[..n]);
		if text.is_empty() {
			continue;
		}
		let lifecycle = sniffer.as_mut().map(|s| s.feed(&text)).unwrap_or_default();
		if events.send(wrap(text)).is_err() {
			return;
		}
		for msg in lifecycle {
			if events.send(WorkerEvent::Lifecycle(msg)).is_err() {
				return;
			}
		}
	}
	let rest = decoder.finish();
	if !rest.is_empty() {
		let _ = events.send(wrap(rest));
	}
}

/// Incremental UTF-8 decoding that holds back a character split across reads.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
	pending: Vec<u8>,
}

impl Utf8Decoder {
	pub fn decode(&mut self, bytes: &[u8]) -> String {
		self.pending.extend_from_slice(bytes);
		let mut out = String::new();
		loop {
			match std::str::from_utf8(&self.pending) {
				Ok(s) => {
					out.push_str(s);
					self.pending.clear();
					return out;
				}
				Err(e) => {
					let valid = e.valid_up_to();
					out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
					match e.error_len() {
						Some(bad) => {
							out.push(char::REPLACEMENT_CHARACTER);
							self.pending.drain(..valid + bad);
						}
						None => {
							self.pending.drain(..valid);
							return out;
						}
					}
				}
			}
		}
	}

	/// Flush whatever is left, lossily.
	pub fn finish(&mut self) -> String {
		let rest = String::from_utf8_lossy(&self.pending).into_owned();
		self.pending.clear();
		rest
	}
}
