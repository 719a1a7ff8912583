//! Configuration loader with environment variable overrides.
//!
//! Loads configuration from:
//! 1. Default values
//! 2. `.abot/config.yaml` in project directory
//! 3. `~/.abot/config.yaml` in home directory
//! 4. Environment variables with `ABOT_` prefix
//! 5. Well-known variables: `PORT`, `BASE_URL`, `ITSABOT_URL`, `GOPATH`, `ABOT_DEBUG`

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::message::FlexIdType;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    /// Debug logging (`ABOT_DEBUG=true`)
    #[serde(default)]
    pub debug: bool,
}

/// Router server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Public base URL used to build signup links. Must end with `/`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Timeout for a single plugin invocation, in seconds
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_secs: u64,
}

fn default_port() -> u16 {
    4200
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_invoke_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_url: None,
            invoke_timeout_secs: default_invoke_timeout(),
        }
    }
}

impl ServerConfig {
    /// Address the router binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    /// Base URL for links handed to users, falling back to the local listener
    pub fn public_base_url(&self) -> String {
        match &self.base_url {
            Some(url) if url.ends_with('/') => url.clone(),
            Some(url) => format!("{}/", url),
            None => format!("http://localhost:{}/", self.port),
        }
    }
}

/// What to do when pinning one plugin fails
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PinFailurePolicy {
    /// Abort the whole installation (after in-flight tasks drain)
    #[default]
    AbortRun,
    /// Record the failure and keep installing the other plugins
    SkipPlugin,
}

impl fmt::Display for PinFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AbortRun => write!(f, "abort_run"),
            Self::SkipPlugin => write!(f, "skip_plugin"),
        }
    }
}

/// Plugin installer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct InstallerConfig {
    /// Dependency manifest
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    /// Generated blank-import file
    #[serde(default = "default_import_file")]
    pub import_file: PathBuf,
    /// Module search root; plugin working copies live under `<root>/src/<path>`
    #[serde(default)]
    pub module_root: Option<PathBuf>,
    /// Directory the fetch and install commands run in
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,
    #[serde(default = "default_fetch_command")]
    pub fetch_command: String,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    /// Version control binary used for checkouts
    #[serde(default = "default_vcs")]
    pub vcs: String,
    /// Download-count collector
    #[serde(default = "default_collector_url")]
    pub collector_url: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,
    #[serde(default = "default_telemetry_timeout")]
    pub telemetry_timeout_secs: u64,
    #[serde(default)]
    pub pin_failure_policy: PinFailurePolicy,
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("plugins.json")
}

fn default_import_file() -> PathBuf {
    PathBuf::from("plugins.go")
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_fetch_command() -> String {
    "go get ./...".to_string()
}

fn default_install_command() -> String {
    "go install".to_string()
}

fn default_vcs() -> String {
    "git".to_string()
}

fn default_collector_url() -> String {
    "https://www.itsabot.org".to_string()
}

fn default_max_concurrency() -> usize {
    8
}

fn default_task_timeout() -> u64 {
    120
}

fn default_deadline() -> u64 {
    1800
}

fn default_telemetry_timeout() -> u64 {
    10
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            import_file: default_import_file(),
            module_root: None,
            project_dir: default_project_dir(),
            fetch_command: default_fetch_command(),
            install_command: default_install_command(),
            vcs: default_vcs(),
            collector_url: default_collector_url(),
            max_concurrency: default_max_concurrency(),
            task_timeout_secs: default_task_timeout(),
            deadline_secs: default_deadline(),
            telemetry_timeout_secs: default_telemetry_timeout(),
            pin_failure_policy: PinFailurePolicy::default(),
        }
    }
}

impl InstallerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_secs(self.telemetry_timeout_secs)
    }

    /// Module root, falling back to `~/go` like the Go toolchain does
    pub fn resolved_module_root(&self) -> PathBuf {
        if let Some(root) = &self.module_root {
            return root.clone();
        }
        dirs::home_dir()
            .map(|home| home.join("go"))
            .unwrap_or_else(|| PathBuf::from("go"))
    }

    /// Validate values that cannot be expressed through serde defaults
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("installer.max_concurrency must be at least 1".to_string());
        }
        if self.task_timeout_secs == 0 {
            return Err("installer.task_timeout_secs must be at least 1".to_string());
        }
        if self.deadline_secs < self.task_timeout_secs {
            return Err(format!(
                "installer.deadline_secs ({}) cannot be shorter than task_timeout_secs ({})",
                self.deadline_secs, self.task_timeout_secs
            ));
        }
        if shlex::split(&self.fetch_command).is_none_or(|argv| argv.is_empty()) {
            return Err(format!(
                "installer.fetch_command is not a valid command: {:?}",
                self.fetch_command
            ));
        }
        if shlex::split(&self.install_command).is_none_or(|argv| argv.is_empty()) {
            return Err(format!(
                "installer.install_command is not a valid command: {:?}",
                self.install_command
            ));
        }
        Ok(())
    }
}

/// Console defaults
#[derive(Debug, Deserialize, Clone)]
pub struct ConsoleConfig {
    #[serde(default = "default_flex_id_type")]
    pub flex_id_type: FlexIdType,
}

fn default_flex_id_type() -> FlexIdType {
    FlexIdType::Phone
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            flex_id_type: default_flex_id_type(),
        }
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    builder = builder
        .set_default("server.port", default_port() as i64)?
        .set_default("server.host", default_host())?
        .set_default("debug", false)?;

    let project_config = PathBuf::from(".abot/config.yaml");
    if project_config.exists() {
        builder = builder.add_source(File::from(project_config).required(false));
    }

    if let Some(home) = dirs::home_dir() {
        let home_config: PathBuf = home.join(".abot/config.yaml");
        if home_config.exists() {
            builder = builder.add_source(File::from(home_config).required(false));
        }
    }

    // e.g. ABOT_SERVER__PORT=9000, ABOT_INSTALLER__MAX_CONCURRENCY=4
    builder = builder.add_source(
        Environment::with_prefix("ABOT")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    // Well-known variables shared with the plugin ecosystem
    if let Ok(port) = std::env::var("PORT") {
        if !port.is_empty() {
            builder = builder.set_override("server.port", port)?;
        }
    }
    if let Ok(url) = std::env::var("BASE_URL") {
        if !url.is_empty() {
            builder = builder.set_override("server.base_url", url)?;
        }
    }
    if let Ok(url) = std::env::var("ITSABOT_URL") {
        if !url.is_empty() {
            builder = builder.set_override("installer.collector_url", url)?;
        }
    }
    if let Ok(root) = std::env::var("GOPATH") {
        if !root.is_empty() {
            builder = builder.set_override("installer.module_root", root)?;
        }
    }
    if let Ok(debug) = std::env::var("ABOT_DEBUG") {
        builder = builder.set_override("debug", debug == "true")?;
    }

    builder.build()?.try_deserialize()
}
