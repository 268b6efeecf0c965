use std::io;
use std::process::ExitStatus;

use tamayo::{IpcError, ManagerError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("failed to read {path}: {source}")]
	ReadConfig {
		path: String,
		#[source]
		source: io::Error,
	},
	#[error("invalid config {path}: {source}")]
	ParseConfig {
		path: String,
		#[source]
		source: toml::de::Error,
	},
	#[error("failed to render config: {0}")]
	RenderConfig(#[from] toml::ser::Error),
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Ipc(#[from] IpcError),
	#[error(transparent)]
	Manager(#[from] ManagerError),
	#[error("dev server didn't start")]
	ServerFailed,
	#[error("dev server stopped unexpectedly")]
	ServerStopped,
	#[error("build tool exited with {0}")]
	ToolExited(ExitStatus),
}
