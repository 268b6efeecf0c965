use std::io::{self, Write};

use owo_colors::OwoColorize;
use tamayo::{ServerManager, ServerState};
use tokio::sync::broadcast::error::RecvError;

use crate::config::{self, FileConfigSource, Overrides};
use crate::error::CliError;
use crate::launcher::StoryLauncher;

/// Start the dev server and stream its transcript to stdout until it is
/// listening (or for as long as it runs, with `follow`). Ctrl-C stops it.
pub async fn run(overrides: Overrides, follow: bool) -> Result<(), CliError> {
	let settings = config::load(&overrides)?;
	let exe = std::env::current_exe()?;
	let launcher = StoryLauncher::new(&settings, exe);
	let source = FileConfigSource::new(overrides, settings.clone());
	let started_with = source.last();
	let manager = ServerManager::new(launcher, source, settings.manager_options());

	let mut changes = manager.subscribe();
	let mut view = TranscriptView::default();
	let mut stdout = io::stdout();
	let ctrl_c = tokio::signal::ctrl_c();
	tokio::pin!(ctrl_c);

	if manager.state() == ServerState::Stopped {
		manager.prepare_start();
		manager.start_server()?;
	}

	let mut listening = false;
	loop {
		tokio::select! {
			change = changes.recv() => match change {
				Ok(_) | Err(RecvError::Lagged(_)) => {}
				Err(RecvError::Closed) => return Err(CliError::ServerStopped),
			},
			_ = &mut ctrl_c => {
				manager.stop_server();
				view.render(&manager.transcript(), &mut stdout)?;
				return Ok(());
			}
		}

		view.render(&manager.transcript(), &mut stdout)?;
		match manager.state() {
			ServerState::Listening if !listening => {
				listening = true;
				eprintln!(
					"{} http://localhost:{}/",
					"storybook ready".green().bold(),
					started_with.lock().port
				);
				if !follow {
					break;
				}
			}
			ServerState::Error => return Err(CliError::ServerFailed),
			ServerState::Stopped => return Err(CliError::ServerStopped),
			_ => {}
		}
	}

	drop(changes);
	eprintln!("{}", "press ctrl-c to stop".dimmed());
	let _ = ctrl_c.await;
	manager.stop_server();
	Ok(())
}

/// Mirrors the transcript on a terminal by writing only what changed.
///
/// Text that collapsing removed since the last render is backspaced over
/// when it sits on the current line; anything bigger (a reset, or the head
/// dropped by the retention cap) starts over on a fresh line.
#[derive(Debug, Default)]
pub struct TranscriptView {
	shown: String,
}

impl TranscriptView {
	pub fn render(&mut self, transcript: &str, out: &mut impl Write) -> io::Result<()> {
		let delta = self.delta(transcript);
		if !delta.is_empty() {
			out.write_all(delta.as_bytes())?;
			out.flush()?;
		}
		Ok(())
	}

	fn delta(&mut self, transcript: &str) -> String {
		let common = common_prefix(&self.shown, transcript);
		let removed = &self.shown[common..];
		let delta = if removed.is_empty() {
			transcript[common..].to_string()
		} else if !removed.contains('\n') {
			let mut delta = "\u{8}".repeat(removed.chars().count());
			delta.push_str(&transcript[common..]);
			delta
		} else {
			format!("\r\n{}", transcript)
		};
		self.shown = transcript.to_string();
		delta
	}
}

/// Length in bytes of the longest common prefix, on a char boundary.
fn common_prefix(a: &str, b: &str) -> usize {
	a.char_indices()
		.zip(b.chars())
		.find(|((_, x), y)| x != y)
		.map(|((i, _), _)| i)
		.unwrap_or_else(|| a.len().min(b.len()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn appends_only_new_text() {
		let mut v = TranscriptView::default();
		assert_eq!(v.delta("Starting\n"), "Starting\n");
		assert_eq!(v.delta("Starting\nwebpack"), "webpack");
		assert_eq!(v.delta("Starting\nwebpack"), "");
	}

	#[test]
	fn backspaces_over_collapsed_text() {
		let mut v = TranscriptView::default();
		v.delta("a\n10%");
		assert_eq!(v.delta("a\n1"), "\u{8}\u{8}");
		assert_eq!(v.delta("a\n100%"), "00%");
	}

	#[test]
	fn reset_starts_fresh_line() {
		let mut v = TranscriptView::default();
		v.delta("Starting\nold run\n");
		assert_eq!(v.delta("Starting\n"), "\r\nStarting\n");
	}

	#[test]
	fn multibyte_prefix() {
		assert_eq!(common_prefix("héllo", "hé"), "hé".len());
		assert_eq!(common_prefix("héllo", "hëllo"), 1);
		assert_eq!(common_prefix("", "abc"), 0);
	}

	#[test]
	fn render_writes_delta() {
		let mut v = TranscriptView::default();
		let mut out = Vec::new();
		v.render("one\n", &mut out).unwrap();
		v.render("one\ntwo\n", &mut out).unwrap();
		assert_eq!(String::from_utf8(out).unwrap(), "one\ntwo\n");
	}
}
