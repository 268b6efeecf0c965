//! Fallback lifecycle detection for workers that only print text.
//!
//! Workers that speak the control channel never go through here. For the rest,
//! complete output lines are matched against configured substrings and turned
//! into lifecycle messages by [`translate`], the one place this happens.

use serde::{Deserialize, Serialize};

use crate::state::ServerState;
use crate::types::LifecycleMessage;

const MAX_PARTIAL_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMarkers {
	#[serde(default = "default_building")]
	pub building: Vec<String>,
	#[serde(default = "default_listening")]
	pub listening: Vec<String>,
	#[serde(default = "default_error")]
	pub error: Vec<String>,
}

impl Default for OutputMarkers {
	fn default() -> Self {
		Self {
			building: default_building(),
			listening: default_listening(),
			error: default_error(),
		}
	}
}

fn default_building() -> Vec<String> {
	vec!["webpack building".into(), "Compiling".into()]
}
fn default_listening() -> Vec<String> {
	vec!["Storybook started on".into(), "Local:".into()]
}
fn default_error() -> Vec<String> {
	vec!["ERR!".into(), "Failed to compile".into()]
}

/// Map one complete output line to a lifecycle message. Error markers win over
/// listening markers, which win over building markers.
pub fn translate(line: &str, markers: &OutputMarkers) -> Option<LifecycleMessage> {
	let hit = |list: &[String]| list.iter().any(|m| !m.is_empty() && line.contains(m.as_str()));

	if hit(&markers.error) {
		Some(LifecycleMessage::error(line.trim()))
	} else if hit(&markers.listening) {
		Some(LifecycleMessage::new(ServerState::Listening))
	} else if hit(&markers.building) {
		Some(LifecycleMessage::new(ServerState::Building))
	} else {
		None
	}
}

/// Splits a chunked stream into lines and feeds them to [`translate`].
///
/// A line is only examined once its newline arrives, so markers split across
/// reads still match. Consecutive identical states are reported once.
#[derive(Debug, Clone)]
pub struct MarkerSniffer {
	markers: OutputMarkers,
	partial: String,
	last: Option<ServerState>,
}

impl MarkerSniffer {
	pub fn new(markers: OutputMarkers) -> Self {
		Self {
			markers,
			partial: String::new(),
			last: None,
		}
	}

	pub fn feed(&mut self, chunk: &str) -> Vec<LifecycleMessage> {
		self.partial.push_str(chunk);
		let mut found = Vec::new();
		while let Some(pos) = self.partial.find('\n') {
			let line: String = self.partial.drain(..=pos).collect();
			if let Some(msg) = translate(line.trim_end_matches(&['\n', '\r'][..]), &self.markers) {
				if self.last != Some(msg.state) {
					self.last = Some(msg.state);
					found.push(msg);
				}
			}
		}
		if self.partial.len() > MAX_PARTIAL_LINE {
			self.partial.clear();
		}
		found
	}
}
