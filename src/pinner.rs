//! Version pinning: check a plugin's working copy out at the manifest revision.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::manifest::{ManifestEntry, VersionConstraint};
use crate::workcopy::{WorkingCopyClient, WorkingCopyError};

/// Errors pinning a single plugin
#[derive(Error, Debug, Clone)]
pub enum PinError {
    #[error("Failed to check out {path} at {revision}: {source}")]
    Checkout {
        path: String,
        revision: String,
        #[source]
        source: WorkingCopyError,
    },

    #[error("Checking out {path} at {revision} timed out after {seconds}s")]
    TimedOut {
        path: String,
        revision: String,
        seconds: u64,
    },
}

impl PinError {
    pub fn path(&self) -> &str {
        match self {
            Self::Checkout { path, .. } | Self::TimedOut { path, .. } => path,
        }
    }

    /// Tool output collected before the failure
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Checkout { source, .. } => source.output(),
            Self::TimedOut { .. } => None,
        }
    }
}

/// What pinning did for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOutcome {
    /// Version was `*`; the working copy was left alone
    Unpinned,
    /// Working copy now sits at this revision
    Pinned(String),
}

/// Pins manifest entries through a [`WorkingCopyClient`]
#[derive(Clone)]
pub struct VersionPinner {
    client: Arc<dyn WorkingCopyClient>,
}

impl VersionPinner {
    pub fn new(client: Arc<dyn WorkingCopyClient>) -> Self {
        Self { client }
    }

    pub async fn pin(&self, entry: &ManifestEntry) -> Result<PinOutcome, PinError> {
        let revision = match &entry.version {
            VersionConstraint::Latest => return Ok(PinOutcome::Unpinned),
            VersionConstraint::Exact(revision) => revision,
        };

        debug!(path = %entry.path, revision = %revision, "Checking out plugin");
        self.client
            .checkout(&entry.path, revision)
            .await
            .map_err(|source| PinError::Checkout {
                path: entry.path.clone(),
                revision: revision.clone(),
                source,
            })?;
        Ok(PinOutcome::Pinned(revision.clone()))
    }
}
