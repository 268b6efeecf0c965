//! # tamayo
//!
//! Dev-server process manager for Rust tools.
//!
//! Runs one long-lived build/serve worker on behalf of an interactive host,
//! tracks its lifecycle (`STOPPED`, `STARTING`, `BUILDING`, `LISTENING`,
//! `ERROR`), keeps a terminal-faithful transcript of its output and tells
//! subscribers when something changed, at most once per throttle interval.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tamayo::{ManagerOptions, ProcessLauncher, ServerManager, StartConfig, WorkerCommand};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let launcher = ProcessLauncher::new(WorkerCommand::new("storyhost").arg("worker"));
//! let manager = ServerManager::new(
//!     launcher,
//!     || StartConfig {
//!         root_path: "/path/to/project".into(),
//!         port: 6006,
//!         static_dirs: vec![],
//!         config_dir: ".storybook".into(),
//!     },
//!     ManagerOptions::default(),
//! );
//!
//! let mut changes = manager.subscribe();
//! manager.prepare_start();
//! manager.start_server().unwrap();
//! while changes.recv().await.is_ok() {
//!     println!("{}", manager.state());
//! }
//! # }
//! ```

pub mod error;
pub mod ipc;
pub mod manager;
pub mod markers;
pub mod sanitize;
pub mod state;
pub mod supervisor;
pub mod throttle;
pub mod transcript;
pub mod types;

pub use error::{IpcError, LaunchError, ManagerError};
pub use ipc::{WorkerChannel, IPC_ENV};
pub use manager::{ConfigSource, ManagerOptions, ServerManager};
pub use markers::OutputMarkers;
pub use state::ServerState;
pub use supervisor::{Launcher, ProcessLauncher, Worker, WorkerCommand, WorkerControl, WorkerProtocol};
pub use types::{ChangeEvent, LifecycleMessage, StartConfig, WorkerEvent};
