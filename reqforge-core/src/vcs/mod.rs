//! Git integration for committing generated artifacts
//!
//! The committer materializes an artifact in a scratch working copy of
//! the target repository and pushes exactly one commit to the requested
//! branch. Scratch directories are released on every exit path.

pub mod committer;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub use committer::{ArtifactCommitter, CommitOutcome, CommitRequest};

/// Identity and credentials used for clone, commit and push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitIdentity {
    pub username: String,
    pub email: String,
    /// Private key for ssh remotes; host-key checking is disabled when set
    pub ssh_key_path: Option<PathBuf>,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            username: "reqforge".to_string(),
            email: "reqforge@localhost".to_string(),
            ssh_key_path: None,
        }
    }
}

impl GitIdentity {
    pub fn from_env() -> Self {
        Self {
            username: std::env::var("GIT_USERNAME").unwrap_or_else(|_| "reqforge".to_string()),
            email: std::env::var("GIT_EMAIL").unwrap_or_else(|_| "reqforge@localhost".to_string()),
            ssh_key_path: std::env::var("GIT_SSH_KEY_PATH").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommitError {
    /// The repository URL yields no usable name; not worth retrying
    #[error("invalid repository url '{0}'")]
    InvalidRepositoryUrl(String),

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("commit task was aborted: {0}")]
    Aborted(String),
}

impl CommitError {
    /// Remote trouble is transient; a malformed URL is not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CommitError::InvalidRepositoryUrl(_))
    }
}

/// Derive a filesystem-safe repository name from a remote URL: strip the
/// protocol and `.git` suffix, then collapse everything non-alphanumeric
/// to `-`. An empty result is a hard error.
pub fn repository_name(url: &str) -> Result<String, CommitError> {
    let trimmed = url.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    // scp-style remotes: git@host:owner/repo.git
    let without_user = without_scheme
        .split_once('@')
        .map(|(_, rest)| rest)
        .unwrap_or(without_scheme);
    let without_suffix = without_user.trim_end_matches('/').trim_end_matches(".git");

    let name: String = without_suffix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let name = name.trim_matches('-').to_string();
    if name.is_empty() {
        return Err(CommitError::InvalidRepositoryUrl(url.to_string()));
    }
    Ok(name)
}

/// Commit message: `feat: implement <title>` plus the first 200 chars of
/// the requirement text, with an ellipsis when truncated.
pub fn commit_message(title: Option<&str>, requirement_text: &str) -> String {
    let title = match title {
        Some(t) if !t.trim().is_empty() => t.trim(),
        _ => "new requirement",
    };
    let mut body: String = requirement_text.chars().take(200).collect();
    if requirement_text.chars().count() > 200 {
        body.push_str("...");
    }
    format!("feat: implement {title}\n\n{body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_name_strips_protocol_and_suffix() {
        assert_eq!(repository_name("git@host:o/r.git").unwrap(), "host-o-r");
        assert_eq!(repository_name("https://github.com/acme/widget.git").unwrap(), "github-com-acme-widget");
        assert_eq!(repository_name("/tmp/fixtures/remote.git").unwrap(), "tmp-fixtures-remote");
    }

    #[test]
    fn unusable_url_is_rejected() {
        assert!(matches!(
            repository_name("...."),
            Err(CommitError::InvalidRepositoryUrl(_))
        ));
        assert!(matches!(repository_name(""), Err(CommitError::InvalidRepositoryUrl(_))));
    }

    #[test]
    fn invalid_url_is_not_retryable() {
        assert!(!CommitError::InvalidRepositoryUrl("x".to_string()).is_retryable());
        assert!(CommitError::Timeout(std::time::Duration::from_secs(120)).is_retryable());
    }

    #[test]
    fn commit_message_includes_title_and_truncated_requirement() {
        let message = commit_message(Some("User Auth"), "short requirement");
        assert!(message.starts_with("feat: implement User Auth\n\n"));
        assert!(message.ends_with("short requirement"));

        let long = "x".repeat(300);
        let message = commit_message(None, &long);
        assert!(message.starts_with("feat: implement new requirement\n\n"));
        assert!(message.ends_with("..."));
        assert_eq!(message.lines().last().unwrap().chars().count(), 203);
    }
}
