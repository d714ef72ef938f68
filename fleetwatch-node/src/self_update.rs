//! Node self-update
//!
//! Pulls the node's own code with git, then asks for a restart. The restart
//! is a deliberate process exit: the node relies on its service manager
//! (systemd `Restart=always` or equivalent) to start it again. It is logged
//! as a requested restart, not as a crash.

use crate::config::UpdateConfig;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("could not run git: {0}")]
    Spawn(#[from] io::Error),
    #[error("git pull failed ({status}): {stderr}")]
    GitFailed { status: String, stderr: String },
}

/// Returned by a successful update. The holder must end the process with
/// [`restart`] once any pending response has been flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequested {
    pub exit_code: i32,
    /// git's own summary of what changed
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct SelfUpdater {
    working_dir: PathBuf,
    branch: Option<String>,
    exit_code: i32,
}

impl SelfUpdater {
    pub fn new(config: &UpdateConfig) -> Self {
        Self {
            working_dir: config.git_working_dir.clone(),
            branch: config.branch.clone(),
            exit_code: config.restart_exit_code,
        }
    }

    /// Runs `git pull` in the working directory
    pub async fn pull(&self) -> Result<RestartRequested, UpdateError> {
        let mut command = Command::new("git");
        command.arg("pull");
        if let Some(branch) = &self.branch {
            command.args(["origin", branch]);
        }

        info!(dir = %self.working_dir.display(), branch = ?self.branch, "Updating node");
        let output = command
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            error!(status = %output.status, %stderr, "Error on update");
            return Err(UpdateError::GitFailed {
                status: output.status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            // git reports progress on stderr even when it succeeds
            warn!(%stderr, "git pull diagnostics");
        }
        info!(result = %stdout, "Update result");
        info!("Restarting now; the service manager is expected to start the node again");

        Ok(RestartRequested {
            exit_code: self.exit_code,
            summary: stdout,
        })
    }
}

/// Ends the process for a requested restart
pub fn restart(request: RestartRequested) -> ! {
    info!(exit_code = request.exit_code, "exiting for requested restart");
    std::process::exit(request.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pull_outside_a_repository_fails() {
        let dir = tempfile::TempDir::new().unwrap();

        let updater = SelfUpdater::new(&UpdateConfig {
            git_working_dir: dir.path().to_path_buf(),
            branch: None,
            restart_exit_code: 0,
        });
        assert!(updater.pull().await.is_err());
    }
}
