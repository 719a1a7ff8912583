//! Plugin dependency manifest (`plugins.json`).
//!
//! ```json
//! {"dependencies": {"github.com/itsabot/plugin_onboard": "*",
//!                   "example.org/plug-a": "v1.2.0"}}
//! ```
//!
//! Keys are plugin paths, values are either `*` (track latest, never pin) or
//! an exact revision the working copy is checked out to.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

static PATH_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._~\-]+$").expect("plugin path segment regex must compile")
});

/// Errors raised while reading the manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid manifest entry '{path}': {reason}")]
    InvalidEntry { path: String, reason: String },
}

/// Version constraint for one plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// `*` - keep whatever the fetch produced
    Latest,
    /// Exact revision (tag, branch or commit)
    Exact(String),
}

impl VersionConstraint {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "*" => Self::Latest,
            other => Self::Exact(other.to_string()),
        }
    }

    /// Revision to pin to, if any
    pub fn revision(&self) -> Option<&str> {
        match self {
            Self::Latest => None,
            Self::Exact(rev) => Some(rev),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "*"),
            Self::Exact(rev) => write!(f, "{}", rev),
        }
    }
}

/// One plugin dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub version: VersionConstraint,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>, version: &str) -> Self {
        Self {
            path: path.into(),
            version: VersionConstraint::parse(version),
        }
    }
}

/// On-disk shape of `plugins.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

/// Parsed manifest, keyed and iterated by plugin path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginManifest {
    dependencies: BTreeMap<String, VersionConstraint>,
}

impl PluginManifest {
    /// Read and validate a manifest file
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Self::parse(&content)?;
        debug!(path = ?path, count = manifest.len(), "Loaded plugin manifest");
        Ok(manifest)
    }

    /// Parse manifest JSON
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let file: ManifestFile = serde_json::from_str(content)?;
        let mut dependencies = BTreeMap::new();
        for (path, version) in file.dependencies {
            validate_path(&path)?;
            let version = VersionConstraint::parse(&version);
            if let VersionConstraint::Exact(rev) = &version {
                validate_revision(&path, rev)?;
            }
            dependencies.insert(path, version);
        }
        Ok(Self { dependencies })
    }

    pub fn from_entries<I>(entries: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = ManifestEntry>,
    {
        let mut dependencies = BTreeMap::new();
        for entry in entries {
            validate_path(&entry.path)?;
            if let VersionConstraint::Exact(rev) = &entry.version {
                validate_revision(&entry.path, rev)?;
            }
            dependencies.insert(entry.path, entry.version);
        }
        Ok(Self { dependencies })
    }

    /// Entries in lexicographic path order
    pub fn entries(&self) -> impl Iterator<Item = ManifestEntry> + '_ {
        self.dependencies.iter().map(|(path, version)| ManifestEntry {
            path: path.clone(),
            version: version.clone(),
        })
    }

    /// Plugin paths in lexicographic order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<&VersionConstraint> {
        self.dependencies.get(path)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Number of entries that will be checked out to an exact revision
    pub fn pinned_count(&self) -> usize {
        self.dependencies
            .values()
            .filter(|v| v.revision().is_some())
            .count()
    }
}

/// Plugin paths are joined onto the module root, so they must stay inside it
fn validate_path(path: &str) -> Result<(), ManifestError> {
    let invalid = |reason: &str| ManifestError::InvalidEntry {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(invalid("path must be relative"));
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(invalid("path contains an empty segment"));
        }
        if segment == "." || segment == ".." {
            return Err(invalid("path must not contain '.' or '..' segments"));
        }
        if !PATH_SEGMENT_RE.is_match(segment) {
            return Err(invalid("path contains unsupported characters"));
        }
    }
    Ok(())
}

/// Revisions become a process argument; refuse anything that reads as a flag
fn validate_revision(path: &str, revision: &str) -> Result<(), ManifestError> {
    if revision.is_empty() {
        return Err(ManifestError::InvalidEntry {
            path: path.to_string(),
            reason: "version is empty (use \"*\" for latest)".to_string(),
        });
    }
    if revision.starts_with('-') || revision.chars().any(char::is_whitespace) {
        return Err(ManifestError::InvalidEntry {
            path: path.to_string(),
            reason: format!("invalid revision '{}'", revision),
        });
    }
    Ok(())
}
