use serde::{Deserialize, Serialize};

/// Lifecycle of the dev server as seen by the manager.
///
/// Serialized in upper case on the wire (`"BUILDING"`), which is also what
/// workers send in their lifecycle frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerState {
	Stopped,
	Starting,
	Building,
	Listening,
	Error,
}

/// Outcome of applying a worker-reported state to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
	/// Move to the contained state.
	To(ServerState),
	/// Worker repeated the current state.
	Unchanged,
	/// Not an edge of the state machine; the report is dropped.
	Rejected,
}

impl ServerState {
	/// States from which a fresh start is accepted.
	pub fn accepts_start(self) -> bool {
		matches!(self, ServerState::Stopped | ServerState::Error)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ServerState::Stopped => "STOPPED",
			ServerState::Starting => "STARTING",
			ServerState::Building => "BUILDING",
			ServerState::Listening => "LISTENING",
			ServerState::Error => "ERROR",
		}
	}

	/// Edges a worker is allowed to drive. `STOPPED` is never reachable from a
	/// report; only an explicit stop gets there.
	pub fn on_report(self, reported: ServerState) -> Transition {
		use ServerState::*;

		if self == reported {
			return Transition::Unchanged;
		}
		match (self, reported) {
			(Starting, Building)
			| (Starting, Listening)
			| (Building, Listening)
			| (Starting, Error)
			| (Building, Error) => Transition::To(reported),
			_ => Transition::Rejected,
		}
	}
}

impl std::fmt::Display for ServerState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}
