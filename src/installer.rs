//! Plugin installer - fetch, pin, report, reconcile, install.
//!
//! Stages run strictly in order and each is a barrier for the next:
//!
//! 1. **Fetch** - fetch every manifest dependency as one unit
//! 2. **PinAndReport** - per entry, pin the working copy and report the install,
//!    all concurrently; the stage ends only when every task has returned
//! 3. **ReinstallDependencies** - fetch again so dependencies match the pins
//! 4. **Install** - build and install
//!
//! Before stage 1 the manifest is loaded and the blank-import file rewritten.
//! Any stage failure, a pin failure (under [`PinFailurePolicy::AbortRun`]) or
//! the overall deadline aborts the run. Telemetry never does.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codegen;
use crate::config::{InstallerConfig, PinFailurePolicy};
use crate::manifest::{ManifestEntry, ManifestError, PluginManifest};
use crate::pinner::{PinError, PinOutcome, VersionPinner};
use crate::telemetry::{InstallReporter, ReportOutcome, TelemetryReporter};
use crate::workcopy::{CommandOutput, ToolchainClient, WorkingCopyClient, WorkingCopyError};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Fetch,
    PinAndReport,
    ReinstallDependencies,
    Install,
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::PinAndReport => write!(f, "pin and report"),
            Self::ReinstallDependencies => write!(f, "reinstall dependencies"),
            Self::Install => write!(f, "install"),
        }
    }
}

/// Fatal installer errors
#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Failed to write import file {path}: {source}")]
    ImportFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: InstallStage,
        #[source]
        source: WorkingCopyError,
    },

    #[error(transparent)]
    Pin(#[from] PinError),

    #[error("Installation exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Install task panicked: {0}")]
    TaskPanicked(String),

    #[error("Invalid installer configuration: {0}")]
    Config(String),
}

impl InstallError {
    /// External command output collected before the failure
    pub fn command_output(&self) -> Option<&str> {
        match self {
            Self::Stage { source, .. } => source.output(),
            Self::Pin(e) => e.output(),
            _ => None,
        }
    }
}

/// Result of one PinAndReport task
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Pin {
        path: String,
        result: Result<PinOutcome, PinError>,
    },
    Report {
        path: String,
        outcome: ReportOutcome,
    },
}

/// What a successful run did
#[derive(Debug, Clone, Default)]
pub struct InstallSummary {
    /// (path, revision) of every pinned plugin, sorted by path
    pub pinned: Vec<(String, String)>,
    /// Plugins left at whatever the fetch produced
    pub unpinned: Vec<String>,
    pub reports_delivered: usize,
    pub reports_dropped: usize,
    /// Pin failures tolerated under [`PinFailurePolicy::SkipPlugin`]
    pub skipped: Vec<PinError>,
}

/// Tunables for one installer
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub import_file: PathBuf,
    pub max_concurrency: usize,
    pub task_timeout: Duration,
    pub deadline: Duration,
    pub pin_failure_policy: PinFailurePolicy,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self::from_config(&InstallerConfig::default())
    }
}

impl InstallOptions {
    pub fn from_config(config: &InstallerConfig) -> Self {
        Self {
            import_file: config.import_file.clone(),
            max_concurrency: config.max_concurrency.max(1),
            task_timeout: config.task_timeout(),
            deadline: config.deadline(),
            pin_failure_policy: config.pin_failure_policy,
        }
    }
}

/// Orchestrates one installation run
pub struct PluginInstaller {
    working_copy: Arc<dyn WorkingCopyClient>,
    reporter: Arc<dyn InstallReporter>,
    options: InstallOptions,
}

impl PluginInstaller {
    /// A `max_concurrency` of 0 is raised to 1 so the barrier can drain
    pub fn new(
        working_copy: Arc<dyn WorkingCopyClient>,
        reporter: Arc<dyn InstallReporter>,
        mut options: InstallOptions,
    ) -> Self {
        options.max_concurrency = options.max_concurrency.max(1);
        Self {
            working_copy,
            reporter,
            options,
        }
    }

    /// Installer wired to the real toolchain and collector
    pub fn from_config(config: &InstallerConfig) -> Result<Self, InstallError> {
        config.validate().map_err(InstallError::Config)?;
        let toolchain =
            ToolchainClient::from_config(config).map_err(|e| InstallError::Config(e.to_string()))?;
        let reporter = TelemetryReporter::new(&config.collector_url, config.telemetry_timeout())
            .map_err(|e| InstallError::Config(e.to_string()))?;
        Ok(Self::new(
            Arc::new(toolchain),
            Arc::new(reporter),
            InstallOptions::from_config(config),
        ))
    }

    pub fn options(&self) -> &InstallOptions {
        &self.options
    }

    /// Load the manifest at `manifest_path` and install it
    pub async fn install_from(&self, manifest_path: &Path) -> Result<InstallSummary, InstallError> {
        let manifest = PluginManifest::load(manifest_path)?;
        self.install(&manifest).await
    }

    /// Run the whole pipeline under the job deadline
    pub async fn install(&self, manifest: &PluginManifest) -> Result<InstallSummary, InstallError> {
        let deadline = self.options.deadline;
        match timeout(deadline, self.run_stages(manifest)).await {
            Ok(result) => result,
            Err(_) => {
                error!(deadline = ?deadline, "Installation deadline exceeded");
                Err(InstallError::DeadlineExceeded(deadline))
            }
        }
    }

    async fn run_stages(&self, manifest: &PluginManifest) -> Result<InstallSummary, InstallError> {
        codegen::write(manifest, &self.options.import_file).map_err(|source| {
            InstallError::ImportFile {
                path: self.options.import_file.clone(),
                source,
            }
        })?;

        info!(count = manifest.len(), "Fetching plugins...");
        self.run_stage(InstallStage::Fetch, self.working_copy.fetch_all())
            .await?;

        let outcomes = self.pin_and_report(manifest).await?;
        let summary = self.summarize(outcomes)?;

        info!("Installing plugins...");
        self.run_stage(
            InstallStage::ReinstallDependencies,
            self.working_copy.fetch_all(),
        )
        .await?;
        self.run_stage(InstallStage::Install, self.working_copy.build_and_install())
            .await?;

        info!(
            pinned = summary.pinned.len(),
            unpinned = summary.unpinned.len(),
            reports_dropped = summary.reports_dropped,
            "Success!"
        );
        Ok(summary)
    }

    async fn run_stage<F>(&self, stage: InstallStage, work: F) -> Result<CommandOutput, InstallError>
    where
        F: Future<Output = Result<CommandOutput, WorkingCopyError>>,
    {
        debug!(stage = %stage, "Entering install stage");
        let output = work
            .await
            .map_err(|source| InstallError::Stage { stage, source })?;
        if !output.output.trim().is_empty() {
            debug!(stage = %stage, output = %output.output.trim(), "Stage output");
        }
        Ok(output)
    }

    /// Spawn one pin task and one report task per entry and wait for all of them.
    ///
    /// Concurrency is bounded by `max_concurrency`; every task runs under the
    /// per-task timeout. Outcomes come back in completion order.
    pub async fn pin_and_report(
        &self,
        manifest: &PluginManifest,
    ) -> Result<Vec<TaskOutcome>, InstallError> {
        debug!(stage = %InstallStage::PinAndReport, "Entering install stage");

        let permits = Arc::new(Semaphore::new(self.options.max_concurrency));
        let pinner = VersionPinner::new(self.working_copy.clone());
        let task_timeout = self.options.task_timeout;
        let mut tasks = JoinSet::new();

        for entry in manifest.entries() {
            tasks.spawn(pin_task(
                entry.clone(),
                pinner.clone(),
                permits.clone(),
                task_timeout,
            ));
            tasks.spawn(report_task(
                entry.path,
                self.reporter.clone(),
                permits.clone(),
                task_timeout,
            ));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut panicked = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let TaskOutcome::Pin { result: Err(e), .. } = &outcome {
                        error!(path = %e.path(), error = %e, "Pin failed");
                    }
                    outcomes.push(outcome);
                }
                Err(e) => {
                    error!(error = %e, "Install task did not complete");
                    panicked.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if let Some(reason) = panicked {
            return Err(InstallError::TaskPanicked(reason));
        }
        Ok(outcomes)
    }

    /// Fold task outcomes, surfacing the first pin failure per policy
    fn summarize(&self, outcomes: Vec<TaskOutcome>) -> Result<InstallSummary, InstallError> {
        let mut summary = InstallSummary::default();
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Pin { path, result } => match result {
                    Ok(PinOutcome::Pinned(revision)) => summary.pinned.push((path, revision)),
                    Ok(PinOutcome::Unpinned) => summary.unpinned.push(path),
                    Err(e) => match self.options.pin_failure_policy {
                        PinFailurePolicy::AbortRun => return Err(InstallError::Pin(e)),
                        PinFailurePolicy::SkipPlugin => {
                            warn!(path = %path, error = %e, "Skipping plugin that failed to pin");
                            summary.skipped.push(e);
                        }
                    },
                },
                TaskOutcome::Report { outcome, .. } => {
                    if outcome.is_delivered() {
                        summary.reports_delivered += 1;
                    } else {
                        summary.reports_dropped += 1;
                    }
                }
            }
        }
        summary.pinned.sort();
        summary.unpinned.sort();
        Ok(summary)
    }
}

async fn pin_task(
    entry: ManifestEntry,
    pinner: VersionPinner,
    permits: Arc<Semaphore>,
    task_timeout: Duration,
) -> TaskOutcome {
    let _permit = permits.acquire_owned().await.ok();
    let result = match timeout(task_timeout, pinner.pin(&entry)).await {
        Ok(result) => result,
        Err(_) => Err(PinError::TimedOut {
            path: entry.path.clone(),
            revision: entry.version.to_string(),
            seconds: task_timeout.as_secs(),
        }),
    };
    TaskOutcome::Pin {
        path: entry.path,
        result,
    }
}

async fn report_task(
    path: String,
    reporter: Arc<dyn InstallReporter>,
    permits: Arc<Semaphore>,
    task_timeout: Duration,
) -> TaskOutcome {
    let _permit = permits.acquire_owned().await.ok();
    let outcome = match timeout(task_timeout, reporter.report(&path)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(path = %path, "Dropping download count report after timeout");
            ReportOutcome::TimedOut
        }
    };
    TaskOutcome::Report { path, outcome }
}
