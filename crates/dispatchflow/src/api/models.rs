use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intake::ThreadRequest;
use crate::jobs::{Job, JobStatus, JobType};

/// What `GET /jobs/:id` shows. `result` only for FINISHED jobs, `error` only
/// for FAILED ones.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub issue_number: i64,
    pub script_name: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_url: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub wait_duration: Option<String>,
    pub run_duration: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let data = job.issue();
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            issue_number: data.issue_number,
            script_name: data.script_name.clone(),
            subject: data.subject.clone(),
            result: (job.status == JobStatus::Finished)
                .then(|| data.result.clone())
                .flatten(),
            error: (job.status == JobStatus::Failed)
                .then(|| data.error.clone())
                .flatten(),
            branch: data.branch.clone(),
            change_url: data.change_url.clone(),
            enqueued_at: job.enqueued_at,
            executed_at: job.executed_at,
            wait_duration: job.wait_duration.map(seconds),
            run_duration: job.run_duration.map(seconds),
        }
    }
}

fn seconds(value: f64) -> String {
    format!("{value:.3}s")
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatus {
    pub queue_size: i64,
    pub pending: Vec<Uuid>,
    pub running: Vec<Uuid>,
    pub paused: Vec<Uuid>,
    pub finished: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub author: String,
    pub body: String,
    /// Lets a run command recreate the job when the thread has none.
    #[serde(default)]
    pub fallback: Option<ThreadRequest>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
