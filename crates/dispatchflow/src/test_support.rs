//! In-memory stand-ins for the remote surface and the checkouts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use url::Url;
use uuid::Uuid;

use crate::checkout::{Checkouts, GitError, PushOutcome};
use crate::jobs::{IssueJobData, Job, JobData, JobStatus, JobType};
use crate::remote::{RemoteError, RemoteSurface};

pub fn issue_job(status: JobStatus, data: IssueJobData) -> Job {
    Job {
        id: Uuid::new_v4(),
        job_type: JobType::Issue,
        status,
        data: JobData::Issue(data),
        enqueued_at: Utc::now(),
        executed_at: None,
        run_duration: None,
        wait_duration: None,
    }
}

#[derive(Default)]
struct Recorded {
    comments: Vec<(i64, String)>,
    reactions: Vec<(i64, String)>,
    uploads: Vec<String>,
    change_requests: Vec<(String, String, i64)>,
}

#[derive(Default)]
pub struct FakeRemote {
    recorded: Mutex<Recorded>,
    fail_comments: bool,
    fail_reactions: bool,
    fail_upload: Option<String>,
    files: HashMap<String, Vec<u8>>,
}

impl FakeRemote {
    pub fn failing_comments(mut self) -> Self {
        self.fail_comments = true;
        self
    }

    pub fn failing_reactions(mut self) -> Self {
        self.fail_reactions = true;
        self
    }

    /// Uploads whose destination ends with `file` are rejected.
    pub fn failing_upload(mut self, file: &str) -> Self {
        self.fail_upload = Some(file.to_string());
        self
    }

    pub fn serving(mut self, url: &str, body: &[u8]) -> Self {
        self.files.insert(url.to_string(), body.to_vec());
        self
    }

    pub fn comments(&self) -> Vec<(i64, String)> {
        self.recorded.lock().unwrap().comments.clone()
    }

    pub fn reactions(&self) -> Vec<(i64, String)> {
        self.recorded.lock().unwrap().reactions.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.recorded.lock().unwrap().uploads.clone()
    }

    pub fn change_requests(&self) -> Vec<(String, String, i64)> {
        self.recorded.lock().unwrap().change_requests.clone()
    }
}

fn rejected(operation: &'static str) -> RemoteError {
    RemoteError::Status {
        operation,
        status: 422,
        body: "rejected".into(),
    }
}

#[async_trait]
impl RemoteSurface for FakeRemote {
    async fn access_token(&self) -> Result<String, RemoteError> {
        Ok("token".into())
    }

    async fn add_reaction(&self, issue_number: i64, reaction: &str) -> Result<(), RemoteError> {
        if self.fail_reactions {
            return Err(rejected("add reaction"));
        }
        self.recorded
            .lock()
            .unwrap()
            .reactions
            .push((issue_number, reaction.to_string()));
        Ok(())
    }

    async fn add_comment(&self, issue_number: i64, body: &str) -> Result<(), RemoteError> {
        if self.fail_comments {
            return Err(rejected("add comment"));
        }
        self.recorded
            .lock()
            .unwrap()
            .comments
            .push((issue_number, body.to_string()));
        Ok(())
    }

    async fn upload_artifact(
        &self,
        _job_id: Uuid,
        _local: &Path,
        destination: &str,
    ) -> Result<String, RemoteError> {
        if let Some(bad) = &self.fail_upload {
            if destination.ends_with(bad.as_str()) {
                return Err(rejected("upload artifact"));
            }
        }
        self.recorded
            .lock()
            .unwrap()
            .uploads
            .push(destination.to_string());
        Ok(format!("https://results.example/{destination}"))
    }

    async fn open_change_request(
        &self,
        repo: &str,
        branch: &str,
        issue_number: i64,
    ) -> Result<String, RemoteError> {
        self.recorded.lock().unwrap().change_requests.push((
            repo.to_string(),
            branch.to_string(),
            issue_number,
        ));
        Ok(format!("https://github.com/{repo}/pull/1"))
    }

    async fn download_file(&self, url: &Url, dest: &Path) -> Result<(), RemoteError> {
        let body = self.files.get(url.as_str()).ok_or(RemoteError::Status {
            operation: "download file",
            status: 404,
            body: "not found".into(),
        })?;
        tokio::fs::write(dest, body)
            .await
            .map_err(|source| RemoteError::Io {
                operation: "download file",
                source,
            })
    }
}

pub struct FakeCheckouts {
    outcome: PushOutcome,
    events: Mutex<Vec<String>>,
}

impl FakeCheckouts {
    pub fn new(outcome: PushOutcome) -> Self {
        Self {
            outcome,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Checkouts for FakeCheckouts {
    async fn refresh(&self, _token: &str) -> Result<(), GitError> {
        self.events.lock().unwrap().push("refresh".into());
        Ok(())
    }

    async fn push_branch_and_diff(&self, subject: &str, branch: &str, _token: &str) -> PushOutcome {
        self.events
            .lock()
            .unwrap()
            .push(format!("push {subject} {branch}"));
        self.outcome.clone()
    }

    async fn restore_baseline(&self, subject: &str, branch: &str) -> Result<(), GitError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("restore {subject} {branch}"));
        Ok(())
    }
}
