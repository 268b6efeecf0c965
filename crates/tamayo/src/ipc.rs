//! Control channel between supervisor and worker: a Unix socket carrying JSON
//! lines. The supervisor writes one [`StartConfig`] frame, the worker answers
//! with any number of [`LifecycleMessage`] frames.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::error::{IpcError, LaunchError};
use crate::types::{LifecycleMessage, StartConfig, WorkerEvent};

/// Env var through which a worker learns where to connect.
pub const IPC_ENV: &str = "TAMAYO_IPC_PATH";

static SOCKET_COUNTER: AtomicU32 = AtomicU32::new(0);

fn next_socket_path() -> PathBuf {
	let n = SOCKET_COUNTER.fetch_add(1, Ordering::SeqCst);
	std::env::temp_dir().join(format!("tamayo-{}-{}.sock", std::process::id(), n))
}

/// Removes the socket file when dropped.
#[derive(Debug)]
struct SocketFile(PathBuf);

impl Drop for SocketFile {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.0);
	}
}

/// Supervisor end of the channel, bound before the worker is spawned.
#[derive(Debug)]
pub struct ControlSocket {
	listener: UnixListener,
	file: SocketFile,
}

impl ControlSocket {
	pub fn bind() -> Result<Self, LaunchError> {
		let path = next_socket_path();
		if path.exists() {
			let _ = std::fs::remove_file(&path);
		}
		let listener = UnixListener::bind(&path).map_err(|source| LaunchError::Socket {
			path: path.display().to_string(),
			source,
		})?;
		Ok(Self {
			listener,
			file: SocketFile(path),
		})
	}

	pub fn path(&self) -> &Path {
		&self.file.0
	}

	/// Wait for the worker, hand it `config`, then forward its lifecycle frames
	/// until it hangs up or nobody listens anymore.
	pub async fn serve(self, config: StartConfig, events: mpsc::UnboundedSender<WorkerEvent>) {
		let ControlSocket { listener, file } = self;
		let accepted = listener.accept().await;
		drop(file);
		let stream = match accepted {
			Ok((stream, _)) => stream,
			Err(e) => {
				tracing::warn!("control socket accept failed: {}", e);
				return;
			}
		};

		let (reader, mut writer) = stream.into_split();
		if let Err(e) = write_frame(&mut writer, &config).await {
			tracing::warn!("failed to send start config to worker: {}", e);
			return;
		}
		tracing::debug!(port = config.port, "start config sent to worker");

		let mut lines = BufReader::new(reader).lines();
		while let Ok(Some(line)) = lines.next_line().await {
			if line.trim().is_empty() {
				continue;
			}
			match serde_json::from_str::<LifecycleMessage>(&line) {
				Ok(msg) => {
					if events.send(WorkerEvent::Lifecycle(msg)).is_err() {
						break;
					}
				}
				Err(e) => tracing::warn!("invalid lifecycle frame from worker: {}", e),
			}
		}
	}
}

async fn write_frame<T: serde::Serialize>(writer: &mut OwnedWriteHalf, frame: &T) -> Result<(), IpcError> {
	let mut data = serde_json::to_vec(frame)?;
	data.push(b'\n');
	writer.write_all(&data).await?;
	writer.flush().await?;
	Ok(())
}

/// Worker end of the channel.
#[derive(Debug)]
pub struct WorkerChannel {
	lines: Lines<BufReader<OwnedReadHalf>>,
	writer: OwnedWriteHalf,
}

impl WorkerChannel {
	/// Connect to the socket named by [`IPC_ENV`] and wait for the start config.
	pub async fn connect_from_env() -> Result<(Self, StartConfig), IpcError> {
		let path = std::env::var_os(IPC_ENV).ok_or(IpcError::MissingEnv(IPC_ENV))?;
		Self::connect(PathBuf::from(path)).await
	}

	pub async fn connect(path: impl AsRef<Path>) -> Result<(Self, StartConfig), IpcError> {
		let stream = UnixStream::connect(path.as_ref()).await?;
		let (reader, writer) = stream.into_split();
		let mut lines = BufReader::new(reader).lines();
		let line = lines.next_line().await?.ok_or(IpcError::Closed)?;
		let config: StartConfig = serde_json::from_str(&line)?;
		Ok((Self { lines, writer }, config))
	}

	pub async fn report(&mut self, msg: &LifecycleMessage) -> Result<(), IpcError> {
		write_frame(&mut self.writer, msg).await
	}

	/// Resolves once the supervisor hangs up.
	pub async fn closed(&mut self) {
		while let Ok(Some(_)) = self.lines.next_line().await {}
	}
}
