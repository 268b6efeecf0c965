use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tamayo::{Launcher, ProcessLauncher, ServerState, StartConfig, WorkerCommand, WorkerEvent};
use tokio::sync::mpsc;

const BIN: &str = env!("CARGO_BIN_EXE_storyhost");

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("storyhost-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

/// A project with a `.storybook` dir and a build command in `.storyhost.toml`.
fn project(name: &str, command: &str) -> PathBuf {
	let root = temp_dir(name);
	std::fs::create_dir_all(root.join(".storybook")).unwrap();
	std::fs::write(
		root.join(".storyhost.toml"),
		format!("[worker]\ncommand = {:?}\n", command),
	)
	.unwrap();
	root
}

fn start_config(root: &Path, port: u16) -> StartConfig {
	StartConfig {
		root_path: root.to_path_buf(),
		port,
		static_dirs: vec![],
		config_dir: ".storybook".into(),
	}
}

fn worker_launcher() -> ProcessLauncher {
	ProcessLauncher::new(WorkerCommand::new(BIN).arg("worker"))
}

async fn collect_until(
	events: &mut mpsc::UnboundedReceiver<WorkerEvent>,
	done: impl Fn(&WorkerEvent) -> bool,
) -> Vec<WorkerEvent> {
	let mut seen = Vec::new();
	let result = tokio::time::timeout(Duration::from_secs(20), async {
		while let Some(event) = events.recv().await {
			let stop = done(&event);
			seen.push(event);
			if stop {
				return;
			}
		}
	})
	.await;
	assert!(result.is_ok(), "timed out; saw {:?}", seen);
	seen
}

fn lifecycle(events: &[WorkerEvent]) -> Vec<ServerState> {
	events
		.iter()
		.filter_map(|e| match e {
			WorkerEvent::Lifecycle(m) => Some(m.state),
			_ => None,
		})
		.collect()
}

fn is_error(e: &WorkerEvent) -> bool {
	matches!(e, WorkerEvent::Lifecycle(m) if m.state == ServerState::Error)
}

async fn wait_closed(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
	let closed = tokio::time::timeout(Duration::from_secs(20), async {
		while events.recv().await.is_some() {}
	})
	.await;
	assert!(closed.is_ok(), "worker did not shut down");
}

#[test]
fn config_prints_effective_settings() {
	let root = temp_dir("config");
	let xdg = temp_dir("config-xdg");
	std::fs::write(root.join(".storyhost.toml"), "config_dir = \".sb\"\n").unwrap();

	let output = std::process::Command::new(BIN)
		.args(["config", "--port", "7007", "--root"])
		.arg(&root)
		.env("XDG_CONFIG_HOME", &xdg)
		.output()
		.unwrap();
	assert!(output.status.success());
	let stdout = String::from_utf8_lossy(&output.stdout);
	assert!(stdout.contains("port = 7007"), "{}", stdout);
	assert!(stdout.contains("config_dir = \".sb\""), "{}", stdout);
	assert!(stdout.contains("[manager]"), "{}", stdout);
}

#[test]
fn invalid_config_exits_nonzero() {
	let root = temp_dir("bad-config");
	let xdg = temp_dir("bad-config-xdg");
	std::fs::write(root.join(".storyhost.toml"), "port = \"not a number\"\n").unwrap();

	let output = std::process::Command::new(BIN)
		.args(["config", "--root"])
		.arg(&root)
		.env("XDG_CONFIG_HOME", &xdg)
		.output()
		.unwrap();
	assert_eq!(output.status.code(), Some(1));
	let stderr = String::from_utf8_lossy(&output.stderr);
	assert!(stderr.contains("invalid config"), "{}", stderr);
}

#[tokio::test]
async fn worker_reports_lifecycle_over_ipc() {
	let root = project(
		"ipc-listening",
		"echo webpack building; echo 'Local: http://localhost:{port}/'; sleep 30",
	);
	let mut worker = worker_launcher().launch(&start_config(&root, 6123)).unwrap();

	let events = collect_until(&mut worker.events, |e| {
		matches!(e, WorkerEvent::Lifecycle(m) if m.state == ServerState::Listening)
	})
	.await;
	assert_eq!(
		lifecycle(&events),
		vec![ServerState::Starting, ServerState::Building, ServerState::Listening]
	);

	worker.control.terminate();
	wait_closed(&mut worker.events).await;
}

#[tokio::test]
async fn worker_output_reaches_supervisor() {
	let root = project("ipc-output", "echo 'Local: http://localhost:{port}/'; sleep 30");
	let mut worker = worker_launcher().launch(&start_config(&root, 6124)).unwrap();

	let events = collect_until(&mut worker.events, |e| {
		matches!(e, WorkerEvent::Stdout(s) if s.contains("Local: http://localhost:6124/"))
	})
	.await;
	assert!(!events.iter().any(is_error), "{:?}", events);

	worker.control.terminate();
	wait_closed(&mut worker.events).await;
}

#[tokio::test]
async fn worker_reports_missing_config_dir() {
	let root = temp_dir("ipc-no-config-dir");
	let mut worker = worker_launcher().launch(&start_config(&root, 6125)).unwrap();

	let events = collect_until(&mut worker.events, is_error).await;
	let Some(WorkerEvent::Lifecycle(msg)) = events.last() else {
		panic!("expected a lifecycle event, got {:?}", events);
	};
	let cause = msg.message.as_deref().unwrap_or_default();
	assert!(cause.contains("config directory"), "{}", cause);
	assert!(!lifecycle(&events).contains(&ServerState::Starting));

	// It stays up after failing, until asked to stop.
	assert!(worker.control.pid().is_some());
	worker.control.terminate();
	wait_closed(&mut worker.events).await;
}

#[tokio::test]
async fn worker_reports_tool_exit_before_listening() {
	let root = project("ipc-tool-exit", "echo 'cannot find storybook' >&2; exit 2");
	let mut worker = worker_launcher().launch(&start_config(&root, 6126)).unwrap();

	let events = collect_until(&mut worker.events, is_error).await;
	let Some(WorkerEvent::Lifecycle(msg)) = events.last() else {
		panic!("expected a lifecycle event, got {:?}", events);
	};
	let cause = msg.message.as_deref().unwrap_or_default();
	assert!(cause.contains("before the server was listening"), "{}", cause);

	worker.control.terminate();
	wait_closed(&mut worker.events).await;
}

#[tokio::test]
async fn serve_exits_nonzero_when_build_fails() {
	let root = project("serve-error", "echo 'ERR! broken build'; exit 1");
	let xdg = temp_dir("serve-error-xdg");

	let child = tokio::process::Command::new(BIN)
		.args(["serve", "--port", "6127", "--root"])
		.arg(&root)
		.env("XDG_CONFIG_HOME", &xdg)
		.stdin(std::process::Stdio::null())
		.stdout(std::process::Stdio::piped())
		.stderr(std::process::Stdio::piped())
		.kill_on_drop(true)
		.spawn()
		.unwrap();
	let output = tokio::time::timeout(Duration::from_secs(30), child.wait_with_output())
		.await
		.expect("serve did not exit")
		.unwrap();

	assert_eq!(output.status.code(), Some(1));
	let stdout = String::from_utf8_lossy(&output.stdout);
	assert!(stdout.contains("Starting Storybook dev server"), "{}", stdout);
	assert!(stdout.contains("ERR! broken build"), "{}", stdout);
	let stderr = String::from_utf8_lossy(&output.stderr);
	assert!(stderr.contains("didn't start"), "{}", stderr);
}
