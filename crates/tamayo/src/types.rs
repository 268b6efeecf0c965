use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::state::ServerState;

/// Configuration handed to a worker exactly once, right after it is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConfig {
	pub root_path: PathBuf,
	pub port: u16,
	#[serde(default)]
	pub static_dirs: Vec<String>,
	pub config_dir: String,
}

/// A lifecycle frame sent by a worker on its control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleMessage {
	pub state: ServerState,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

impl LifecycleMessage {
	pub fn new(state: ServerState) -> Self {
		Self { state, message: None }
	}

	pub fn error(message: impl Into<String>) -> Self {
		Self {
			state: ServerState::Error,
			message: Some(message.into()),
		}
	}
}

/// Everything a worker can tell the manager, in per-channel emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
	Stdout(String),
	Stderr(String),
	Lifecycle(LifecycleMessage),
	/// The worker process is gone. `None` when it was killed by a signal.
	Exited(Option<i32>),
}

/// Zero-payload change notification. Re-read state and transcript on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn start_config_wire_keys() {
		let config = StartConfig {
			root_path: "/work/app".into(),
			port: 9009,
			static_dirs: vec!["public".into()],
			config_dir: ".storybook".into(),
		};
		let json = serde_json::to_string(&config).unwrap();
		assert!(json.contains("\"rootPath\":\"/work/app\""));
		assert!(json.contains("\"staticDirs\":[\"public\"]"));
		assert!(json.contains("\"configDir\":\".storybook\""));
		assert!(json.contains("\"port\":9009"));
	}

	#[test]
	fn lifecycle_frame_without_message() {
		let msg: LifecycleMessage = serde_json::from_str(r#"{"state":"LISTENING"}"#).unwrap();
		assert_eq!(msg, LifecycleMessage::new(ServerState::Listening));
		assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"state":"LISTENING"}"#);
	}

	#[test]
	fn lifecycle_error_frame() {
		let msg: LifecycleMessage =
			serde_json::from_str(r#"{"state":"ERROR","message":"port 9009 in use"}"#).unwrap();
		assert_eq!(msg.state, ServerState::Error);
		assert_eq!(msg.message.as_deref(), Some("port 9009 in use"));
	}
}
