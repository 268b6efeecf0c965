//! Scrub what a worker inherits so it never attaches a second debugger or
//! profiler next to the one already attached to the supervisor.

use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct LaunchSanitizer {
	/// Flags dropped from the worker argv, both bare and in `--flag=value` form.
	pub strip_flags: Vec<String>,
	/// Variables removed from the worker environment.
	pub strip_env: Vec<String>,
}

impl Default for LaunchSanitizer {
	fn default() -> Self {
		Self {
			strip_flags: vec!["--inspect".into(), "--inspect-brk".into(), "--inspect-wait".into()],
			strip_env: vec!["LD_PRELOAD".into(), "DYLD_INSERT_LIBRARIES".into()],
		}
	}
}

impl LaunchSanitizer {
	pub fn is_debug_flag(&self, arg: &str) -> bool {
		self.strip_flags.iter().any(|flag| {
			arg == flag.as_str() || arg.strip_prefix(flag.as_str()).is_some_and(|rest| rest.starts_with('='))
		})
	}

	pub fn args<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
		args.iter()
			.map(|a| a.as_ref())
			.filter(|a| !self.is_debug_flag(a))
			.map(str::to_string)
			.collect()
	}

	/// Filtered `NODE_OPTIONS`, or `None` when nothing is left.
	pub fn node_options(&self, value: &str) -> Option<String> {
		let kept: Vec<&str> = value.split_whitespace().filter(|a| !self.is_debug_flag(a)).collect();
		if kept.is_empty() {
			None
		} else {
			Some(kept.join(" "))
		}
	}

	pub fn apply(&self, cmd: &mut Command) {
		for var in &self.strip_env {
			cmd.env_remove(var);
		}
		if let Ok(value) = std::env::var("NODE_OPTIONS") {
			match self.node_options(&value) {
				Some(filtered) => cmd.env("NODE_OPTIONS", filtered),
				None => cmd.env_remove("NODE_OPTIONS"),
			};
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_inspect_flags() {
		let s = LaunchSanitizer::default();
		let args = [
			"worker",
			"--inspect",
			"--inspect=9229",
			"--inspect-brk=0.0.0.0:9230",
			"--inspector-ui",
			"--port",
			"6006",
		];
		assert_eq!(s.args(&args), vec!["worker", "--inspector-ui", "--port", "6006"]);
	}

	#[test]
	fn node_options_filtering() {
		let s = LaunchSanitizer::default();
		assert_eq!(
			s.node_options("--max-old-space-size=4096 --inspect-brk"),
			Some("--max-old-space-size=4096".to_string())
		);
		assert_eq!(s.node_options("--inspect=9229"), None);
		assert_eq!(s.node_options("   "), None);
	}

	#[test]
	fn custom_flag_list() {
		let s = LaunchSanitizer {
			strip_flags: vec!["--profile".into()],
			strip_env: vec![],
		};
		assert!(s.is_debug_flag("--profile"));
		assert!(s.is_debug_flag("--profile=cpu"));
		assert!(!s.is_debug_flag("--inspect"));
		assert!(!s.is_debug_flag("--profiler"));
	}
}
