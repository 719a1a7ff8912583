//! Working copy client - the installer's only door to the version control and
//! build toolchain.
//!
//! [`WorkingCopyClient`] is a narrow capability: fetch every dependency, check
//! one plugin out at a revision, build and install. [`ToolchainClient`] runs
//! the real tools as child processes; tests substitute their own client.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::InstallerConfig;

/// Errors from running an external tool
#[derive(Error, Debug, Clone)]
pub enum WorkingCopyError {
    #[error("Failed to start `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("`{command}` exited with status {status}")]
    Failed {
        command: String,
        status: i32,
        /// Combined stdout and stderr
        output: String,
    },

    #[error("Invalid command line: {0}")]
    InvalidCommand(String),
}

impl WorkingCopyError {
    /// Collected tool output, if the tool ran at all
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Failed { output, .. } if !output.trim().is_empty() => Some(output),
            _ => None,
        }
    }
}

/// Captured output of a successful tool run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    pub output: String,
}

/// Capability over the external version control / build tooling
#[async_trait]
pub trait WorkingCopyClient: Send + Sync {
    /// Fetch every manifest dependency as one unit
    async fn fetch_all(&self) -> Result<CommandOutput, WorkingCopyError>;

    /// Check the plugin's working copy out at an exact revision
    async fn checkout(&self, path: &str, revision: &str) -> Result<CommandOutput, WorkingCopyError>;

    /// Build and install over the reconciled module tree
    async fn build_and_install(&self) -> Result<CommandOutput, WorkingCopyError>;
}

/// Runs the configured toolchain as child processes, without a shell
#[derive(Debug, Clone)]
pub struct ToolchainClient {
    module_root: PathBuf,
    project_dir: PathBuf,
    vcs: String,
    fetch_argv: Vec<String>,
    install_argv: Vec<String>,
}

impl ToolchainClient {
    pub fn new(
        module_root: impl Into<PathBuf>,
        project_dir: impl Into<PathBuf>,
        vcs: impl Into<String>,
        fetch_command: &str,
        install_command: &str,
    ) -> Result<Self, WorkingCopyError> {
        Ok(Self {
            module_root: module_root.into(),
            project_dir: project_dir.into(),
            vcs: vcs.into(),
            fetch_argv: split_command(fetch_command)?,
            install_argv: split_command(install_command)?,
        })
    }

    pub fn from_config(config: &InstallerConfig) -> Result<Self, WorkingCopyError> {
        Self::new(
            config.resolved_module_root(),
            config.project_dir.clone(),
            config.vcs.clone(),
            &config.fetch_command,
            &config.install_command,
        )
    }

    /// Conventional on-disk location of a plugin's working copy
    pub fn working_copy_dir(&self, path: &str) -> PathBuf {
        working_copy_dir(&self.module_root, path)
    }
}

/// `<module_root>/src/<plugin path>`
pub fn working_copy_dir(module_root: &Path, path: &str) -> PathBuf {
    path.split('/')
        .fold(module_root.join("src"), |dir, segment| dir.join(segment))
}

fn split_command(command: &str) -> Result<Vec<String>, WorkingCopyError> {
    match shlex::split(command) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        _ => Err(WorkingCopyError::InvalidCommand(command.to_string())),
    }
}

#[async_trait]
impl WorkingCopyClient for ToolchainClient {
    async fn fetch_all(&self) -> Result<CommandOutput, WorkingCopyError> {
        run_argv(&self.fetch_argv, &self.project_dir).await
    }

    async fn checkout(&self, path: &str, revision: &str) -> Result<CommandOutput, WorkingCopyError> {
        let dir = self.working_copy_dir(path);
        let argv = vec![
            self.vcs.clone(),
            "-C".to_string(),
            dir.to_string_lossy().to_string(),
            "checkout".to_string(),
            revision.to_string(),
        ];
        run_argv(&argv, &self.project_dir).await
    }

    async fn build_and_install(&self) -> Result<CommandOutput, WorkingCopyError> {
        run_argv(&self.install_argv, &self.project_dir).await
    }
}

/// Run a command to completion, capturing stdout and stderr together
async fn run_argv(argv: &[String], cwd: &Path) -> Result<CommandOutput, WorkingCopyError> {
    let command_line = argv.join(" ");
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| WorkingCopyError::InvalidCommand(command_line.clone()))?;

    debug!(command = %command_line, cwd = ?cwd, "Running toolchain command");

    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| WorkingCopyError::Spawn {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(WorkingCopyError::Failed {
            command: command_line,
            status: output.status.code().unwrap_or(-1),
            output: combined,
        });
    }

    Ok(CommandOutput {
        command: command_line,
        output: combined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_working_copy_dir_layout() {
        let dir = working_copy_dir(Path::new("/gopath"), "example.org/plug-a");
        assert_eq!(dir, PathBuf::from("/gopath/src/example.org/plug-a"));
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("go get ./...").unwrap(),
            vec!["go", "get", "./..."]
        );
        assert_eq!(
            split_command("make 'install all'").unwrap(),
            vec!["make", "install all"]
        );
        assert!(split_command("").is_err());
        assert!(split_command("echo \"unterminated").is_err());
    }

    #[test]
    fn test_error_output_only_when_present() {
        let err = WorkingCopyError::Failed {
            command: "go get ./...".to_string(),
            status: 1,
            output: "cannot find package\n".to_string(),
        };
        assert_eq!(err.output(), Some("cannot find package\n"));
        assert!(err.to_string().contains("exited with status 1"));

        let err = WorkingCopyError::Failed {
            command: "x".to_string(),
            status: 1,
            output: "  \n".to_string(),
        };
        assert_eq!(err.output(), None);

        let err = WorkingCopyError::InvalidCommand("".to_string());
        assert_eq!(err.output(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_argv_captures_output() {
        let dir = TempDir::new().unwrap();
        let out = run_argv(
            &["sh".to_string(), "-c".to_string(), "echo out; echo err >&2".to_string()],
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(out.command, "sh -c echo out; echo err >&2");
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_argv_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let err = run_argv(
            &["sh".to_string(), "-c".to_string(), "echo broken; exit 3".to_string()],
            dir.path(),
        )
        .await
        .unwrap_err();
        match err {
            WorkingCopyError::Failed {
                command,
                status,
                output,
            } => {
                assert_eq!(command, "sh -c echo broken; exit 3");
                assert_eq!(status, 3);
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_argv_missing_binary() {
        let dir = TempDir::new().unwrap();
        let err = run_argv(&["abot-definitely-not-a-binary".to_string()], dir.path())
            .await
            .unwrap_err();
        match err {
            WorkingCopyError::Spawn { command, .. } => {
                assert_eq!(command, "abot-definitely-not-a-binary")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_toolchain_client_runs_configured_commands() {
        let dir = TempDir::new().unwrap();
        let client = ToolchainClient::new(
            dir.path(),
            dir.path(),
            "git",
            "sh -c 'echo fetched'",
            "sh -c 'echo installed'",
        )
        .unwrap();

        assert!(client.fetch_all().await.unwrap().output.contains("fetched"));
        assert!(client
            .build_and_install()
            .await
            .unwrap()
            .output
            .contains("installed"));
    }
}
