//! Trailing-edge throttle for change notifications.
//!
//! The first signal after a quiet period fires at once and opens a cool-down
//! window. Signals inside the window push a single deferred emit to `interval`
//! after the latest of them. Signals arriving after the window closed but while
//! that deferred emit is still pending fold into it, so a burst produces one
//! leading and one trailing emit.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

/// Pure bookkeeping behind [`Throttle`]; time is passed in by the caller.
#[derive(Debug, Clone)]
pub struct ThrottleWindow {
	interval: Duration,
	last_emit: Option<Instant>,
	pending: Option<Instant>,
}

impl ThrottleWindow {
	pub fn new(interval: Duration) -> Self {
		Self {
			interval,
			last_emit: None,
			pending: None,
		}
	}

	/// Record a signal at `now`. Returns true when the caller should emit now.
	pub fn on_signal(&mut self, now: Instant) -> bool {
		let cooling = self.last_emit.is_some_and(|t| now < t + self.interval);
		if self.pending.is_some() {
			if cooling {
				self.pending = Some(now + self.interval);
			}
			return false;
		}
		if cooling {
			self.pending = Some(now + self.interval);
			return false;
		}
		self.last_emit = Some(now);
		true
	}

	/// When the deferred emit is due, if one is scheduled.
	pub fn deadline(&self) -> Option<Instant> {
		self.pending
	}

	/// The deferred emit fired at `now`.
	pub fn fired(&mut self, now: Instant) {
		self.pending = None;
		self.last_emit = Some(now);
	}
}

/// Rate-limits calls to an emit callback. Dropping the throttle stops its task
/// and discards a pending trailing emit.
///
/// Must be created inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct Throttle {
	tx: mpsc::UnboundedSender<()>,
}

impl Throttle {
	pub fn new<F>(interval: Duration, emit: F) -> Self
	where
		F: Fn() + Send + 'static,
	{
		let (tx, rx) = mpsc::unbounded_channel();
		tokio::spawn(run(ThrottleWindow::new(interval), rx, emit));
		Self { tx }
	}

	pub fn signal(&self) {
		let _ = self.tx.send(());
	}
}

async fn run<F>(mut window: ThrottleWindow, mut rx: mpsc::UnboundedReceiver<()>, emit: F)
where
	F: Fn() + Send + 'static,
{
	loop {
		let deadline = window.deadline();
		tokio::select! {
			msg = rx.recv() => match msg {
				Some(()) => {
					if window.on_signal(Instant::now()) {
						emit();
					}
				}
				None => return,
			},
			_ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
				window.fired(Instant::now());
				emit();
			}
		}
	}
}
