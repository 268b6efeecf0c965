use std::io;

use thiserror::Error;

use crate::state::ServerState;

/// Calls a consumer made out of turn. Never fatal; the call is simply refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
	#[error("server is already {state}; stop it before starting again")]
	AlreadyRunning { state: ServerState },
}

/// Failures setting up a worker. The manager turns these into `ERROR` state.
#[derive(Debug, Error)]
pub enum LaunchError {
	#[error("failed to spawn worker `{program}`: {source}")]
	Spawn {
		program: String,
		#[source]
		source: io::Error,
	},
	#[error("failed to open control socket {path}: {source}")]
	Socket {
		path: String,
		#[source]
		source: io::Error,
	},
}

/// Failures on the worker side of the control channel.
#[derive(Debug, Error)]
pub enum IpcError {
	#[error("{0} is not set; this process was not launched by a supervisor")]
	MissingEnv(&'static str),
	#[error("control channel io error: {0}")]
	Io(#[from] io::Error),
	#[error("malformed control frame: {0}")]
	Decode(#[from] serde_json::Error),
	#[error("control channel closed before a start configuration arrived")]
	Closed,
}
