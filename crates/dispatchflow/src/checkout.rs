//! Local clones of the content repositories scripts run against.
//!
//! A checkout is shared by every job on the same subject, so callers go
//! through [`CheckoutLocks`] and hold the lease for the whole script run.
//! Write jobs release it through [`CheckoutLease::release`], which puts the
//! tree back on the baseline branch; a lease dropped without release (early
//! return, panic) schedules the same restore before the lock is freed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::SubjectConfig;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("unknown subject `{0}`")]
    UnknownSubject(String),

    #[error("could not run git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    NoChanges,
    Pushed,
    Failed { stage: &'static str, message: String },
}

#[async_trait]
pub trait Checkouts: Send + Sync {
    /// Clones missing checkouts and brings every one back to an up to date
    /// baseline branch.
    async fn refresh(&self, token: &str) -> Result<(), GitError>;

    /// Commits whatever the script changed to `branch` and pushes it.
    async fn push_branch_and_diff(&self, subject: &str, branch: &str, token: &str) -> PushOutcome;

    /// Force the baseline branch back, drop untracked files and the job
    /// branch.
    async fn restore_baseline(&self, subject: &str, branch: &str) -> Result<(), GitError>;
}

/// One lock per subject checkout.
#[derive(Clone, Default)]
pub struct CheckoutLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl CheckoutLocks {
    pub fn new<'a>(subjects: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            locks: subjects
                .into_iter()
                .map(|s| (s.to_string(), Arc::new(Mutex::new(()))))
                .collect(),
        }
    }

    /// Waits for the subject's checkout. `restore` names the branch to clean
    /// up when the lease ends; read jobs pass `None`.
    pub async fn acquire(
        &self,
        subject: &str,
        checkouts: Arc<dyn Checkouts>,
        restore: Option<String>,
    ) -> Option<CheckoutLease> {
        let lock = self.locks.get(subject)?.clone();
        let guard = lock.lock_owned().await;
        Some(CheckoutLease {
            guard: Some(guard),
            checkouts,
            subject: subject.to_string(),
            restore,
        })
    }
}

pub struct CheckoutLease {
    guard: Option<OwnedMutexGuard<()>>,
    checkouts: Arc<dyn Checkouts>,
    subject: String,
    restore: Option<String>,
}

impl CheckoutLease {
    pub async fn release(mut self) {
        if let Some(branch) = self.restore.take() {
            restore_logged(self.checkouts.as_ref(), &self.subject, &branch).await;
        }
        self.guard.take();
    }
}

impl Drop for CheckoutLease {
    fn drop(&mut self) {
        let (Some(branch), Some(guard)) = (self.restore.take(), self.guard.take()) else {
            return;
        };
        let checkouts = self.checkouts.clone();
        let subject = std::mem::take(&mut self.subject);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    restore_logged(checkouts.as_ref(), &subject, &branch).await;
                    drop(guard);
                });
            }
            Err(_) => {
                tracing::error!(subject = %subject, branch = %branch, "checkout lease dropped outside a runtime, tree not restored");
            }
        }
    }
}

async fn restore_logged(checkouts: &dyn Checkouts, subject: &str, branch: &str) {
    if let Err(e) = checkouts.restore_baseline(subject, branch).await {
        tracing::error!(subject, branch, error = %e, "could not restore checkout to baseline");
    }
}

/// [`Checkouts`] over the `git` command line.
pub struct GitCheckouts {
    subjects: Vec<SubjectConfig>,
    baseline: String,
    bot_name: String,
    bot_email: String,
    remote_base: String,
}

impl GitCheckouts {
    pub fn new(
        subjects: Vec<SubjectConfig>,
        baseline: impl Into<String>,
        bot_name: impl Into<String>,
        bot_email: impl Into<String>,
    ) -> Self {
        Self {
            subjects,
            baseline: baseline.into(),
            bot_name: bot_name.into(),
            bot_email: bot_email.into(),
            remote_base: "https://github.com".to_string(),
        }
    }

    /// Where `owner/repo` slugs are resolved. Anything not `https://` is
    /// treated as a local directory of bare repositories.
    pub fn with_remote_base(mut self, base: impl Into<String>) -> Self {
        self.remote_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn subject(&self, name: &str) -> Result<&SubjectConfig, GitError> {
        self.subjects
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| GitError::UnknownSubject(name.to_string()))
    }

    fn remote_url(&self, repo: &str, token: &str) -> String {
        match self.remote_base.strip_prefix("https://") {
            Some(host) => format!("https://x-access-token:{token}@{host}/{repo}.git"),
            None => format!("{}/{repo}.git", self.remote_base),
        }
    }

    async fn refresh_one(&self, subject: &SubjectConfig, token: &str) -> Result<(), GitError> {
        let dir = subject.checkout_path.as_path();
        let url = self.remote_url(&subject.remote_repo, token);

        if !dir.exists() {
            if let Some(parent) = dir.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| GitError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            tracing::info!(subject = %subject.name, repo = %subject.remote_repo, "cloning checkout");
            let target = dir.to_string_lossy();
            git(
                None,
                &[
                    "clone",
                    "--depth=1",
                    "--branch",
                    self.baseline.as_str(),
                    url.as_str(),
                    target.as_ref(),
                ],
            )
            .await?;
            return Ok(());
        }

        git(Some(dir), &["remote", "set-url", "origin", url.as_str()]).await?;
        git(Some(dir), &["checkout", "-f", self.baseline.as_str()]).await?;
        git(Some(dir), &["clean", "-fd"]).await?;
        git(Some(dir), &["fetch", "--depth=1", "origin", self.baseline.as_str()]).await?;

        let remote_ref = format!("origin/{}", self.baseline);
        let local = git(Some(dir), &["rev-parse", "HEAD"]).await?;
        let remote = git(Some(dir), &["rev-parse", remote_ref.as_str()]).await?;
        if local.trim() != remote.trim() {
            tracing::info!(subject = %subject.name, "checkout behind remote, pulling");
            git(Some(dir), &["reset", "--hard", remote_ref.as_str()]).await?;
        }
        Ok(())
    }

    async fn commit_and_push(&self, dir: &Path, branch: &str, token: &str, repo: &str) -> PushOutcome {
        let url = self.remote_url(repo, token);
        let message = format!("Update for {branch}");
        let steps: [(&'static str, Vec<&str>); 4] = [
            ("branch", vec!["checkout", "-b", branch]),
            ("add", vec!["add", "-A"]),
            ("commit", vec!["commit", "-m", message.as_str()]),
            ("push", vec!["push", "--set-upstream", "origin", branch]),
        ];

        if let Err(e) = git(Some(dir), &["remote", "set-url", "origin", url.as_str()]).await {
            return PushOutcome::Failed {
                stage: "remote",
                message: e.to_string(),
            };
        }
        for (stage, args) in steps.iter() {
            if let Err(e) = git(Some(dir), args).await {
                return PushOutcome::Failed {
                    stage: *stage,
                    message: e.to_string(),
                };
            }
        }
        PushOutcome::Pushed
    }
}

#[async_trait]
impl Checkouts for GitCheckouts {
    async fn refresh(&self, token: &str) -> Result<(), GitError> {
        for subject in &self.subjects {
            self.refresh_one(subject, token).await?;
        }
        Ok(())
    }

    async fn push_branch_and_diff(&self, subject: &str, branch: &str, token: &str) -> PushOutcome {
        let subject = match self.subject(subject) {
            Ok(s) => s,
            Err(e) => {
                return PushOutcome::Failed {
                    stage: "lookup",
                    message: e.to_string(),
                }
            }
        };
        let dir = subject.checkout_path.as_path();

        for (key, value) in [("user.name", &self.bot_name), ("user.email", &self.bot_email)] {
            if let Err(e) = git(Some(dir), &["config", key, value.as_str()]).await {
                return PushOutcome::Failed {
                    stage: "config",
                    message: e.to_string(),
                };
            }
        }

        // porcelain also lists untracked files, which diff-index would miss
        match git(Some(dir), &["status", "--porcelain"]).await {
            Ok(status) if status.trim().is_empty() => return PushOutcome::NoChanges,
            Ok(_) => {}
            Err(e) => {
                return PushOutcome::Failed {
                    stage: "status",
                    message: e.to_string(),
                }
            }
        }

        self.commit_and_push(dir, branch, token, &subject.remote_repo)
            .await
    }

    async fn restore_baseline(&self, subject: &str, branch: &str) -> Result<(), GitError> {
        let dir = self.subject(subject)?.checkout_path.as_path();

        git(Some(dir), &["checkout", "-f", self.baseline.as_str()]).await?;
        git(Some(dir), &["clean", "-fd"]).await?;

        let local_ref = format!("refs/heads/{branch}");
        if git(Some(dir), &["rev-parse", "--verify", "--quiet", local_ref.as_str()])
            .await
            .is_ok()
        {
            git(Some(dir), &["branch", "-D", branch]).await?;
        }
        Ok(())
    }
}

async fn git(dir: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args).kill_on_drop(true);

    // tokens live in remote urls; never log them
    let shown = match args.first() {
        Some(&"clone") | Some(&"remote") => args[0].to_string(),
        _ => args.join(" "),
    };

    let out = cmd.output().await.map_err(|source| GitError::Spawn {
        args: shown.clone(),
        source,
    })?;
    if out.status.success() {
        return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
    }
    Err(GitError::Command {
        args: shown,
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    })
}
