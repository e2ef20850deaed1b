//! Registering the helper in git's global configuration

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// Helper installation errors
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("git executable not found")]
    GitNotFound,

    #[error("`git {args}` failed: {stderr}")]
    GitFailed { args: String, stderr: String },

    #[error("cannot locate the gitswitch executable: {0}")]
    CurrentExe(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The helper as git sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStatus {
    /// All configured `credential.helper` values, in order
    pub helpers: Vec<String>,
    /// A gitswitch helper is configured
    pub installed: bool,
    /// `credential.useHttpPath` is enabled
    pub use_http_path: bool,
}

/// The `credential.helper` value that runs `exe`
pub fn helper_command(exe: &Path) -> String {
    format!("!{} credential-helper", shell_quote(&exe.to_string_lossy()))
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn is_gitswitch_helper(value: &str) -> bool {
    value.trim_end().ends_with(" credential-helper") && value.contains("gitswitch")
}

/// Edits git's global credential configuration
pub struct HelperInstaller {
    git: PathBuf,
}

impl Default for HelperInstaller {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
        }
    }
}

impl HelperInstaller {
    pub fn with_git(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }

    /// Make the running executable git's only credential helper
    pub async fn install(&self) -> Result<String, InstallError> {
        let exe = std::env::current_exe().map_err(InstallError::CurrentExe)?;
        self.install_for(&exe).await
    }

    /// Make `exe` git's only credential helper
    pub async fn install_for(&self, exe: &Path) -> Result<String, InstallError> {
        let helper = helper_command(exe);

        // Exit code 5 means there was nothing to unset
        self.git(&["config", "--global", "--unset-all", "credential.helper"], &[0, 5])
            .await?;
        self.git(&["config", "--global", "credential.helper", helper.as_str()], &[0])
            .await?;
        self.git(&["config", "--global", "credential.useHttpPath", "true"], &[0])
            .await?;

        info!(helper = %helper, "Installed credential helper");
        Ok(helper)
    }

    /// Read the current helper configuration
    pub async fn status(&self) -> Result<InstallStatus, InstallError> {
        // Exit code 1 means the key is not set
        let helpers = self
            .git(&["config", "--global", "--get-all", "credential.helper"], &[0, 1])
            .await?;
        let use_http_path = self
            .git(&["config", "--global", "--bool", "--get", "credential.useHttpPath"], &[0, 1])
            .await?;

        let helpers: Vec<String> = helpers
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(InstallStatus {
            installed: helpers.iter().any(|h| is_gitswitch_helper(h)),
            helpers,
            use_http_path: use_http_path.trim() == "true",
        })
    }

    async fn git(&self, args: &[&str], accepted: &[i32]) -> Result<String, InstallError> {
        let output = Command::new(&self.git)
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => InstallError::GitNotFound,
                _ => InstallError::Io(e),
            })?;

        match output.status.code() {
            Some(code) if accepted.contains(&code) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            _ => Err(InstallError::GitFailed {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}
