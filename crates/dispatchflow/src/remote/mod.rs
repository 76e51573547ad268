//! The issue tracker / code host the worker reports back to.

pub mod auth;
pub mod github;

use std::path::Path;

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

pub use auth::AppTokenProvider;
pub use github::{Committer, GithubClient, TokenSource};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{operation} returned {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("{operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} returned an unexpected body: {detail}")]
    Malformed {
        operation: &'static str,
        detail: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Side effects visible to the person who asked for the job. Every call
/// reports failure distinctly so the pipeline can fail the job on it.
#[async_trait]
pub trait RemoteSurface: Send + Sync {
    /// A token that also authorises git pushes to the content repositories.
    async fn access_token(&self) -> Result<String, RemoteError>;

    async fn add_reaction(&self, issue_number: i64, reaction: &str) -> Result<(), RemoteError>;

    async fn add_comment(&self, issue_number: i64, body: &str) -> Result<(), RemoteError>;

    /// Uploads `local` to the results repository at `destination` and returns
    /// a browsable URL.
    async fn upload_artifact(
        &self,
        job_id: Uuid,
        local: &Path,
        destination: &str,
    ) -> Result<String, RemoteError>;

    async fn open_change_request(
        &self,
        repo: &str,
        branch: &str,
        issue_number: i64,
    ) -> Result<String, RemoteError>;

    async fn download_file(&self, url: &Url, dest: &Path) -> Result<(), RemoteError>;

    fn compare_url(&self, repo: &str, branch: &str) -> String {
        format!("https://github.com/{repo}/compare/{branch}?expand=1")
    }
}
