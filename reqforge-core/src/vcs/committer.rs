//! Artifact committer
//!
//! Clone the remote into a scratch directory, check out (or create) the
//! requested branch, write the artifact, stage exactly the written
//! paths, commit, push. The scratch directory is removed on every exit
//! path; removal errors are logged and dropped. git2 work runs on a
//! blocking thread under a deadline.

use super::{commit_message, repository_name, CommitError, GitIdentity};
use crate::artifact::Artifact;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, Cred, CredentialType, FetchOptions, PushOptions, RemoteCallbacks, Repository,
    Signature,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// One commit request
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub repository_url: String,
    pub branch: String,
    pub artifact: Artifact,
    /// Sub-path the artifact is rooted at inside the repository
    pub output_path: String,
    pub title: Option<String>,
    pub requirement_text: String,
}

/// Result of a pushed commit
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub commit_hash: String,
    pub files_changed: Vec<String>,
}

/// Commits artifacts to remote repositories
#[derive(Clone)]
pub struct ArtifactCommitter {
    identity: GitIdentity,
    timeout: Duration,
}

impl ArtifactCommitter {
    pub fn new(identity: GitIdentity) -> Self {
        Self { identity, timeout: Duration::from_secs(120) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Materialize the artifact on the requested branch and push one
    /// commit. Either a commit lands and its hash is returned, or an
    /// error is raised; no partial state outlives the call.
    pub async fn commit_and_push(
        &self,
        request: CommitRequest,
    ) -> Result<CommitOutcome, CommitError> {
        let identity = self.identity.clone();
        let deadline = self.timeout;
        let handle =
            tokio::task::spawn_blocking(move || commit_blocking(&identity, &request));
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(CommitError::Aborted(join_err.to_string())),
            Err(_) => Err(CommitError::Timeout(deadline)),
        }
    }
}

fn commit_blocking(
    identity: &GitIdentity,
    request: &CommitRequest,
) -> Result<CommitOutcome, CommitError> {
    let repo_name = repository_name(&request.repository_url)?;
    let scratch = TempDir::new()?;
    debug!(repo = %repo_name, dir = %scratch.path().display(), "cloning into scratch directory");

    let result = commit_in_dir(identity, request, scratch.path());

    // Release the working copy regardless of outcome.
    if let Err(err) = scratch.close() {
        warn!(error = %err, "failed to remove scratch directory");
    }
    result
}

fn commit_in_dir(
    identity: &GitIdentity,
    request: &CommitRequest,
    workdir: &Path,
) -> Result<CommitOutcome, CommitError> {
    let repo = clone_remote(identity, &request.repository_url, workdir)?;
    checkout_branch(&repo, &request.branch)?;

    let files_changed = write_artifact(&repo, &request.artifact, &request.output_path)?;
    stage_paths(&repo, &files_changed)?;

    let message = commit_message(request.title.as_deref(), &request.requirement_text);
    let commit_hash = create_commit(&repo, identity, &message)?;
    push_branch(&repo, identity, &request.branch)?;

    info!(
        branch = %request.branch,
        commit = %commit_hash,
        files = files_changed.len(),
        "artifact pushed"
    );
    Ok(CommitOutcome { commit_hash, files_changed })
}

fn remote_callbacks(identity: &GitIdentity) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let ssh_key = identity.ssh_key_path.clone();
    let username = identity.username.clone();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        if let Some(key) = &ssh_key {
            if allowed.contains(CredentialType::SSH_KEY) {
                let user = username_from_url.unwrap_or(&username);
                return Cred::ssh_key(user, None, key, None);
            }
        }
        Cred::default()
    });
    // The ssh key path implies automation against a known remote;
    // host-key verification is disabled for it.
    callbacks.certificate_check(|_cert, _host| Ok(git2::CertificateCheckStatus::CertificateOk));
    callbacks
}

fn clone_remote(
    identity: &GitIdentity,
    url: &str,
    workdir: &Path,
) -> Result<Repository, CommitError> {
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(remote_callbacks(identity));
    let repo = RepoBuilder::new().fetch_options(fetch).clone(url, workdir)?;
    Ok(repo)
}

/// Check out the requested branch; when it exists neither locally nor
/// under `remotes/origin/`, create it from current HEAD.
fn checkout_branch(repo: &Repository, branch: &str) -> Result<(), CommitError> {
    let refname = format!("refs/heads/{branch}");

    if repo.find_branch(branch, BranchType::Local).is_ok() {
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        return Ok(());
    }

    if let Ok(remote_branch) = repo.find_branch(&format!("origin/{branch}"), BranchType::Remote) {
        let commit = remote_branch.get().peel_to_commit()?;
        repo.branch(branch, &commit, false)?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        debug!(branch, "created local branch from origin");
        return Ok(());
    }

    match repo.head().ok().and_then(|head| head.peel_to_commit().ok()) {
        Some(commit) => {
            repo.branch(branch, &commit, false)?;
            repo.set_head(&refname)?;
            repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
            debug!(branch, "created new branch from HEAD");
        }
        None => {
            // Empty remote: point HEAD at the unborn branch, the first
            // commit brings it into existence.
            repo.set_head(&refname)?;
            debug!(branch, "targeting unborn branch in empty repository");
        }
    }
    Ok(())
}

/// Write each artifact file under the output path, creating parents.
/// Paths already rooted at the output path are not prefixed twice.
fn write_artifact(
    repo: &Repository,
    artifact: &Artifact,
    output_path: &str,
) -> Result<Vec<String>, CommitError> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| CommitError::Aborted("repository has no working directory".to_string()))?;
    let prefix = output_path.trim_matches('/');

    let mut files_changed = Vec::new();
    for (relative, content) in artifact.iter() {
        let repo_relative = if prefix.is_empty()
            || prefix == "."
            || relative == prefix
            || relative.starts_with(&format!("{prefix}/"))
        {
            relative.to_string()
        } else {
            format!("{prefix}/{relative}")
        };

        let absolute: PathBuf = workdir.join(&repo_relative);
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&absolute, content)?;
        files_changed.push(repo_relative);
    }
    Ok(files_changed)
}

fn stage_paths(repo: &Repository, paths: &[String]) -> Result<(), CommitError> {
    let mut index = repo.index()?;
    for path in paths {
        index.add_path(Path::new(path))?;
    }
    index.write()?;
    Ok(())
}

fn create_commit(
    repo: &Repository,
    identity: &GitIdentity,
    message: &str,
) -> Result<String, CommitError> {
    let signature = Signature::now(&identity.username, &identity.email)?;
    let tree_id = repo.index()?.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();

    let commit_id = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
    Ok(commit_id.to_string())
}

fn push_branch(
    repo: &Repository,
    identity: &GitIdentity,
    branch: &str,
) -> Result<(), CommitError> {
    let mut remote = repo.find_remote("origin")?;
    let mut options = PushOptions::new();
    options.remote_callbacks(remote_callbacks(identity));
    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    remote.push(&[refspec.as_str()], Some(&mut options))?;
    Ok(())
}
