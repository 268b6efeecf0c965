use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::error::ManagerError;
use crate::state::{ServerState, Transition};
use crate::supervisor::{Launcher, WorkerControl};
use crate::throttle::Throttle;
use crate::transcript::{Transcript, DEFAULT_TRANSCRIPT_LIMIT};
use crate::types::{ChangeEvent, StartConfig, WorkerEvent};

/// Supplies the start configuration. Read once per start, at start time, so
/// edits made after `prepare_start` still apply.
pub trait ConfigSource: Send + Sync {
	fn start_config(&self) -> StartConfig;
}

impl<F> ConfigSource for F
where
	F: Fn() -> StartConfig + Send + Sync,
{
	fn start_config(&self) -> StartConfig {
		self()
	}
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
	/// Transcript content right after `prepare_start`.
	pub banner: String,
	pub stopping_notice: String,
	pub failure_headline: String,
	pub failure_hint: String,
	pub throttle: Duration,
	/// Fail the start if the worker is neither listening nor failed by then.
	pub startup_timeout: Option<Duration>,
	pub transcript_limit: Option<usize>,
}

impl Default for ManagerOptions {
	fn default() -> Self {
		Self {
			banner: "Starting dev server ...\n".into(),
			stopping_notice: "Stopping dev server ...\n".into(),
			failure_headline: "Dev server didn't start.".into(),
			failure_hint: "Please fix any compilation errors and start it again.".into(),
			throttle: Duration::from_millis(100),
			startup_timeout: Some(Duration::from_secs(120)),
			transcript_limit: Some(DEFAULT_TRANSCRIPT_LIMIT),
		}
	}
}

impl ManagerOptions {
	fn failure_notice(&self, cause: Option<&str>) -> String {
		match cause.map(str::trim).filter(|c| !c.is_empty()) {
			Some(cause) => format!("\r\n\r\n{}\r\n{}\r\n{}", self.failure_headline, cause, self.failure_hint),
			None => format!("\r\n\r\n{}\r\n{}", self.failure_headline, self.failure_hint),
		}
	}
}

/// Owns one dev-server worker and everything observed about it.
///
/// State and transcript are read synchronously; changes are announced on a
/// throttled, payload-free broadcast. Must be created inside a tokio runtime.
/// Dropping the manager stops its worker.
pub struct ServerManager {
	shared: Arc<Shared>,
	launcher: Box<dyn Launcher>,
	config: Box<dyn ConfigSource>,
}

struct Shared {
	inner: Mutex<Inner>,
	notifier: Throttle,
	changes: broadcast::Sender<ChangeEvent>,
	options: ManagerOptions,
}

struct Inner {
	state: ServerState,
	transcript: Transcript,
	worker: Option<LiveWorker>,
	/// Bumped whenever the current worker is replaced or dropped; events
	/// tagged with an older value are discarded.
	generation: u64,
	prepared: bool,
	/// A start is between reading its config and installing the worker.
	launching: bool,
}

struct LiveWorker {
	control: Box<dyn WorkerControl>,
	pump: JoinHandle<()>,
}

enum Input {
	Event(WorkerEvent),
	StartupTimedOut,
}

enum Outcome {
	Stale,
	Applied { settled: bool, finished: bool },
}

impl ServerManager {
	pub fn new(
		launcher: impl Launcher + 'static,
		config: impl ConfigSource + 'static,
		options: ManagerOptions,
	) -> Self {
		let (changes, _) = broadcast::channel(64);
		let emitter = changes.clone();
		let notifier = Throttle::new(options.throttle, move || {
			let _ = emitter.send(ChangeEvent);
		});
		Self {
			shared: Arc::new(Shared {
				inner: Mutex::new(Inner {
					state: ServerState::Stopped,
					transcript: Transcript::new(options.transcript_limit),
					worker: None,
					generation: 0,
					prepared: false,
					launching: false,
				}),
				notifier,
				changes,
				options,
			}),
			launcher: Box::new(launcher),
			config: Box::new(config),
		}
	}

	pub fn state(&self) -> ServerState {
		self.shared.inner.lock().state
	}

	pub fn transcript(&self) -> String {
		self.shared.inner.lock().transcript.as_str().to_string()
	}

	pub fn worker_pid(&self) -> Option<u32> {
		self.shared.inner.lock().worker.as_ref().and_then(|w| w.control.pid())
	}

	/// Change notifications. Drop the receiver to unsubscribe.
	pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
		self.shared.changes.subscribe()
	}

	/// Reset the transcript to the banner and enter `STARTING`. A live worker
	/// is stopped first.
	pub fn prepare_start(&self) {
		{
			let mut inner = self.shared.inner.lock();
			if inner.worker.is_some() {
				inner.stop_worker(&self.shared.options.stopping_notice);
			}
			inner.prepare(&self.shared.options.banner);
		}
		self.shared.notifier.signal();
	}

	/// Spawn a worker and return immediately; progress arrives as change
	/// events. Without a preceding `prepare_start` the preparation is implied.
	/// Refused while a worker is starting, building or listening.
	pub fn start_server(&self) -> Result<(), ManagerError> {
		let generation = {
			let mut inner = self.shared.inner.lock();
			if inner.worker.is_some() || inner.launching {
				if !inner.state.accepts_start() {
					return Err(ManagerError::AlreadyRunning { state: inner.state });
				}
				// Failed worker that has not exited yet.
				inner.discard_worker();
			}
			if !inner.prepared {
				inner.prepare(&self.shared.options.banner);
			}
			inner.prepared = false;
			inner.launching = true;
			inner.generation += 1;
			inner.generation
		};

		// Config reads and the spawn happen unlocked; a stop or prepare in the
		// meantime bumps the generation and the new worker is discarded below.
		let config = self.config.start_config();
		let launched = self.launcher.launch(&config);

		{
			let mut inner = self.shared.inner.lock();
			if inner.generation != generation {
				tracing::debug!("start superseded while launching");
				if let Ok(worker) = launched {
					worker.control.terminate();
				}
				return Ok(());
			}
			inner.launching = false;
			match launched {
				Ok(worker) => {
					let pump = tokio::spawn(pump(
						Arc::downgrade(&self.shared),
						generation,
						worker.events,
						self.shared.options.startup_timeout,
					));
					inner.worker = Some(LiveWorker {
						control: worker.control,
						pump,
					});
					tracing::info!(port = config.port, root = %config.root_path.display(), "dev server starting");
				}
				Err(e) => {
					tracing::error!("{}", e);
					inner.state = ServerState::Error;
					let notice = self.shared.options.failure_notice(Some(&e.to_string()));
					inner.transcript.append(&notice);
				}
			}
		}
		self.shared.notifier.signal();
		Ok(())
	}

	/// Move to `STOPPED` from any state. Stops the worker without waiting for
	/// it to exit and returns whether there was one to stop.
	pub fn stop_server(&self) -> bool {
		let stopped = {
			let mut inner = self.shared.inner.lock();
			if inner.worker.is_some() {
				inner.stop_worker(&self.shared.options.stopping_notice);
				true
			} else if inner.state != ServerState::Stopped || inner.prepared || inner.launching {
				inner.generation += 1;
				inner.prepared = false;
				inner.launching = false;
				inner.state = ServerState::Stopped;
				false
			} else {
				return false;
			}
		};
		self.shared.notifier.signal();
		stopped
	}
}

impl Drop for ServerManager {
	fn drop(&mut self) {
		self.shared.inner.lock().discard_worker();
	}
}

impl Inner {
	fn prepare(&mut self, banner: &str) {
		self.generation += 1;
		self.launching = false;
		self.transcript.reset(banner);
		self.state = ServerState::Starting;
		self.prepared = true;
	}

	fn discard_worker(&mut self) {
		if let Some(worker) = self.worker.take() {
			self.generation += 1;
			worker.pump.abort();
			worker.control.terminate();
		}
	}

	fn stop_worker(&mut self, notice: &str) {
		self.discard_worker();
		self.transcript.append(notice);
		self.state = ServerState::Stopped;
		tracing::info!("dev server stopped");
	}
}

impl Shared {
	fn apply(&self, generation: u64, input: Input) -> Outcome {
		let mut inner = self.inner.lock();
		if inner.generation != generation {
			return Outcome::Stale;
		}

		let mut settled = false;
		let mut finished = false;
		match input {
			Input::Event(WorkerEvent::Stdout(text)) | Input::Event(WorkerEvent::Stderr(text)) => {
				inner.transcript.append(&text);
			}
			Input::Event(WorkerEvent::Lifecycle(msg)) => match inner.state.on_report(msg.state) {
				Transition::To(next) => {
					tracing::debug!("dev server {} -> {}", inner.state, next);
					inner.state = next;
					if next == ServerState::Error {
						let notice = self.options.failure_notice(msg.message.as_deref());
						inner.transcript.append(&notice);
					}
					settled = matches!(next, ServerState::Listening | ServerState::Error);
				}
				Transition::Unchanged => {}
				Transition::Rejected => {
					tracing::warn!("ignoring worker report {} while {}", msg.state, inner.state);
				}
			},
			Input::Event(WorkerEvent::Exited(code)) => {
				// The pump is the caller; let its handle go without aborting it.
				inner.worker = None;
				inner.generation += 1;
				finished = true;
				let status = match code {
					Some(code) => format!("worker exited with code {}", code),
					None => "worker was killed by a signal".to_string(),
				};
				match inner.state {
					ServerState::Starting | ServerState::Building => {
						tracing::warn!("{} before listening", status);
						inner.state = ServerState::Error;
						let notice = self.options.failure_notice(Some(&status));
						inner.transcript.append(&notice);
					}
					ServerState::Listening => {
						tracing::warn!("{} while listening", status);
						inner.state = ServerState::Stopped;
						inner.transcript.append(&format!("\r\n{}\r\n", status));
					}
					ServerState::Stopped | ServerState::Error => {}
				}
			}
			Input::StartupTimedOut => {
				if matches!(inner.state, ServerState::Starting | ServerState::Building) {
					let waited = self.options.startup_timeout.unwrap_or_default();
					tracing::warn!("worker not listening after {:?}, giving up", waited);
					if let Some(worker) = inner.worker.take() {
						worker.control.terminate();
					}
					inner.generation += 1;
					inner.state = ServerState::Error;
					let cause = format!("worker did not start listening within {}s", waited.as_secs());
					let notice = self.options.failure_notice(Some(&cause));
					inner.transcript.append(&notice);
					finished = true;
				}
				settled = true;
			}
		}
		Outcome::Applied { settled, finished }
	}
}

async fn pump(
	shared: Weak<Shared>,
	generation: u64,
	mut events: mpsc::UnboundedReceiver<WorkerEvent>,
	startup_timeout: Option<Duration>,
) {
	let deadline = startup_timeout.map(|t| Instant::now() + t);
	let mut settled = false;
	loop {
		let input = tokio::select! {
			event = events.recv() => match event {
				Some(event) => Input::Event(event),
				None => return,
			},
			_ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !settled => {
				Input::StartupTimedOut
			}
		};

		let Some(shared) = shared.upgrade() else {
			return;
		};
		match shared.apply(generation, input) {
			Outcome::Stale => return,
			Outcome::Applied { settled: s, finished } => {
				settled |= s;
				shared.notifier.signal();
				if finished {
					return;
				}
			}
		}
	}
}
