use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tamayo::{ConfigSource, ManagerOptions, OutputMarkers, StartConfig};

use crate::error::CliError;

pub const PROJECT_FILE: &str = ".storyhost.toml";

const DEFAULT_COMMAND: &str = "npx storybook dev --ci --port {port} --config-dir {config_dir}";

// ── Files (~/.config/storyhost/config.toml, <root>/.storyhost.toml) ─────────

/// One config file as written. Every key is optional; later files override
/// earlier ones key by key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	port: Option<u16>,
	static_dirs: Option<Vec<String>>,
	config_dir: Option<String>,
	root: Option<PathBuf>,
	#[serde(default)]
	worker: WorkerFile,
	#[serde(default)]
	manager: ManagerFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerFile {
	command: Option<String>,
	protocol: Option<Protocol>,
	#[serde(default)]
	markers: MarkersFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MarkersFile {
	building: Option<Vec<String>>,
	listening: Option<Vec<String>>,
	error: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManagerFile {
	throttle_ms: Option<u64>,
	startup_timeout_secs: Option<u64>,
	kill_grace_secs: Option<u64>,
	transcript_limit_bytes: Option<usize>,
}

impl FileConfig {
	fn merge(self, over: FileConfig) -> FileConfig {
		FileConfig {
			port: over.port.or(self.port),
			static_dirs: over.static_dirs.or(self.static_dirs),
			config_dir: over.config_dir.or(self.config_dir),
			root: over.root.or(self.root),
			worker: WorkerFile {
				command: over.worker.command.or(self.worker.command),
				protocol: over.worker.protocol.or(self.worker.protocol),
				markers: MarkersFile {
					building: over.worker.markers.building.or(self.worker.markers.building),
					listening: over.worker.markers.listening.or(self.worker.markers.listening),
					error: over.worker.markers.error.or(self.worker.markers.error),
				},
			},
			manager: ManagerFile {
				throttle_ms: over.manager.throttle_ms.or(self.manager.throttle_ms),
				startup_timeout_secs: over.manager.startup_timeout_secs.or(self.manager.startup_timeout_secs),
				kill_grace_secs: over.manager.kill_grace_secs.or(self.manager.kill_grace_secs),
				transcript_limit_bytes: over.manager.transcript_limit_bytes.or(self.manager.transcript_limit_bytes),
			},
		}
	}
}

fn read_file(path: &Path) -> Result<FileConfig, CliError> {
	if !path.exists() {
		return Ok(FileConfig::default());
	}
	let content = std::fs::read_to_string(path).map_err(|source| CliError::ReadConfig {
		path: path.display().to_string(),
		source,
	})?;
	parse(&content, path)
}

fn parse(content: &str, path: &Path) -> Result<FileConfig, CliError> {
	toml::from_str(content).map_err(|source| CliError::ParseConfig {
		path: path.display().to_string(),
		source,
	})
}

pub fn config_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		PathBuf::from(dir).join("storyhost")
	} else if let Ok(home) = std::env::var("HOME") {
		PathBuf::from(home).join(".config").join("storyhost")
	} else {
		PathBuf::from("/tmp").join("storyhost").join("config")
	}
}

pub fn global_config_path() -> PathBuf {
	config_dir().join("config.toml")
}

// ── Command line ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
	/// Port the dev server listens on
	#[arg(long)]
	pub port: Option<u16>,
	/// Project root (defaults to the current directory)
	#[arg(long)]
	pub root: Option<PathBuf>,
	/// Storybook config directory, relative to the root
	#[arg(long)]
	pub config_dir: Option<String>,
	/// Static directory to serve; repeat for more than one
	#[arg(long = "static-dir")]
	pub static_dirs: Vec<String>,
}

impl Overrides {
	pub fn for_root(root: &Path) -> Self {
		Self {
			root: Some(root.to_path_buf()),
			..Self::default()
		}
	}

	fn into_file(self) -> FileConfig {
		FileConfig {
			port: self.port,
			static_dirs: if self.static_dirs.is_empty() { None } else { Some(self.static_dirs) },
			config_dir: self.config_dir,
			root: self.root,
			..FileConfig::default()
		}
	}
}

// ── Effective settings ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	/// Re-run this binary as `storyhost worker`, reporting over the control socket.
	#[default]
	Ipc,
	/// Run the command directly and read lifecycle from its output.
	Markers,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
	pub port: u16,
	pub root: PathBuf,
	pub config_dir: String,
	pub static_dirs: Vec<String>,
	pub worker: WorkerSettings,
	pub manager: ManagerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSettings {
	pub command: String,
	pub protocol: Protocol,
	pub markers: OutputMarkers,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerSettings {
	pub throttle_ms: u64,
	pub startup_timeout_secs: u64,
	pub kill_grace_secs: u64,
	pub transcript_limit_bytes: usize,
}

impl Settings {
	fn resolve(file: FileConfig, cwd: &Path) -> Settings {
		let markers = OutputMarkers::default();
		let root = match file.root {
			Some(root) if root.is_absolute() => root,
			Some(root) => cwd.join(root),
			None => cwd.to_path_buf(),
		};
		Settings {
			port: file.port.unwrap_or(6006),
			root,
			config_dir: file.config_dir.unwrap_or_else(|| ".storybook".into()),
			static_dirs: file.static_dirs.unwrap_or_default(),
			worker: WorkerSettings {
				command: file.worker.command.unwrap_or_else(|| DEFAULT_COMMAND.into()),
				protocol: file.worker.protocol.unwrap_or_default(),
				markers: OutputMarkers {
					building: file.worker.markers.building.unwrap_or(markers.building),
					listening: file.worker.markers.listening.unwrap_or(markers.listening),
					error: file.worker.markers.error.unwrap_or(markers.error),
				},
			},
			manager: ManagerSettings {
				throttle_ms: file.manager.throttle_ms.unwrap_or(100),
				startup_timeout_secs: file.manager.startup_timeout_secs.unwrap_or(120),
				kill_grace_secs: file.manager.kill_grace_secs.unwrap_or(3),
				transcript_limit_bytes: file.manager.transcript_limit_bytes.unwrap_or(tamayo::transcript::DEFAULT_TRANSCRIPT_LIMIT),
			},
		}
	}

	pub fn start_config(&self) -> StartConfig {
		StartConfig {
			root_path: self.root.clone(),
			port: self.port,
			static_dirs: self.static_dirs.clone(),
			config_dir: self.config_dir.clone(),
		}
	}

	pub fn manager_options(&self) -> ManagerOptions {
		let secs = |n: u64| if n == 0 { None } else { Some(Duration::from_secs(n)) };
		ManagerOptions {
			banner: "Starting Storybook dev server ...\n".into(),
			stopping_notice: "Stopping Storybook dev server ...\n".into(),
			failure_headline: "Storybook dev server didn't start.".into(),
			throttle: Duration::from_millis(self.manager.throttle_ms),
			startup_timeout: secs(self.manager.startup_timeout_secs),
			transcript_limit: Some(self.manager.transcript_limit_bytes),
			..ManagerOptions::default()
		}
	}

	pub fn kill_grace(&self) -> Option<Duration> {
		match self.manager.kill_grace_secs {
			0 => None,
			n => Some(Duration::from_secs(n)),
		}
	}
}

/// Global file, then the project file under the resolved root, then flags.
/// A `root` key in the project file is ignored since the file is found through it.
pub fn load(overrides: &Overrides) -> Result<Settings, CliError> {
	let cwd = std::env::current_dir()?;
	let global = read_file(&global_config_path())?;
	let flags = overrides.clone().into_file();

	let root = Settings::resolve(global.clone().merge(flags.clone()), &cwd).root;
	let mut project = read_file(&root.join(PROJECT_FILE))?;
	if project.root.take().is_some() {
		tracing::warn!("ignoring `root` in {}", root.join(PROJECT_FILE).display());
	}
	Ok(Settings::resolve(global.merge(project).merge(flags), &cwd))
}

/// Re-reads the config files every time a server starts. Keeps the last good
/// settings for when a file stops parsing.
pub struct FileConfigSource {
	overrides: Overrides,
	last: Arc<Mutex<Settings>>,
}

impl FileConfigSource {
	pub fn new(overrides: Overrides, initial: Settings) -> Self {
		Self {
			overrides,
			last: Arc::new(Mutex::new(initial)),
		}
	}

	/// Settings used by the most recent start. Stays readable after the
	/// source is handed to the manager.
	pub fn last(&self) -> Arc<Mutex<Settings>> {
		self.last.clone()
	}
}

impl ConfigSource for FileConfigSource {
	fn start_config(&self) -> StartConfig {
		match load(&self.overrides) {
			Ok(settings) => {
				let config = settings.start_config();
				*self.last.lock() = settings;
				config
			}
			Err(e) => {
				tracing::warn!("{}; keeping previous settings", e);
				self.last.lock().start_config()
			}
		}
	}
}
