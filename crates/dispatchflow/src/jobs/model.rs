use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Finished,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Finished,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "PAUSED" => Ok(JobStatus::Paused),
            "FINISHED" => Ok(JobStatus::Finished),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects the handler for a job. Adding a variant forces every dispatch
/// `match` to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    /// Script run requested through an issue thread.
    Issue,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Issue => "ISSUE",
        }
    }
}

impl FromStr for JobType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ISSUE" => Ok(JobType::Issue),
            other => Err(ModelError::UnknownJobType(other.to_string())),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What last happened on the issue thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Opened,
    Comment,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub file: String,
    pub url: String,
}

/// Payload of an `ISSUE` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueJobData {
    pub issue_number: i64,
    pub issue_status: IssueStatus,
    #[serde(default)]
    pub create_pull_request: bool,
    pub script_name: String,
    pub subject: String,
    /// Raw argument replies, in the order the script declares them.
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_files: Vec<OutputFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_url: Option<String>,
}

impl IssueJobData {
    pub fn new(
        issue_number: i64,
        issue_status: IssueStatus,
        script_name: impl Into<String>,
        subject: impl Into<String>,
        create_pull_request: bool,
    ) -> Self {
        Self {
            issue_number,
            issue_status,
            create_pull_request,
            script_name: script_name.into(),
            subject: subject.into(),
            arguments: Vec::new(),
            argument_index: None,
            result: None,
            error: None,
            notify_error: None,
            output_files: Vec::new(),
            branch: None,
            change_url: None,
        }
    }

    /// Same request, fresh conversation: used when a thread asks for a rerun.
    pub fn restarted(&self) -> Self {
        Self::new(
            self.issue_number,
            IssueStatus::Reset,
            self.script_name.clone(),
            self.subject.clone(),
            self.create_pull_request,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobData {
    Issue(IssueJobData),
}

impl JobData {
    pub fn job_type(&self) -> JobType {
        match self {
            JobData::Issue(_) => JobType::Issue,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            JobData::Issue(data) => serde_json::to_value(data),
        }
    }

    fn decode(job_type: JobType, value: Value) -> Result<Self, serde_json::Error> {
        match job_type {
            JobType::Issue => Ok(JobData::Issue(serde_json::from_value(value)?)),
        }
    }
}

impl From<IssueJobData> for JobData {
    fn from(data: IssueJobData) -> Self {
        JobData::Issue(data)
    }
}

/// Shallow patch over a job's data. Absent fields are left untouched when
/// merged, so applying the same patch twice is the same as applying it once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_status: Option<IssueStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_files: Option<Vec<OutputFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_url: Option<String>,
}

impl JobPatch {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// The status change a handler asks the store to make. Never `RUNNING`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub status: JobStatus,
    pub patch: JobPatch,
}

impl Transition {
    pub fn pending(patch: JobPatch) -> Self {
        Self {
            status: JobStatus::Pending,
            patch,
        }
    }

    pub fn paused(patch: JobPatch) -> Self {
        Self {
            status: JobStatus::Paused,
            patch,
        }
    }

    pub fn finished(patch: JobPatch) -> Self {
        Self {
            status: JobStatus::Finished,
            patch,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            patch: JobPatch::error(message),
        }
    }

    pub fn failed_with(patch: JobPatch) -> Self {
        Self {
            status: JobStatus::Failed,
            patch,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub data: JobData,
    pub enqueued_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Seconds from first claim to the terminal transition.
    pub run_duration: Option<f64>,
    /// Seconds from enqueue to claim.
    pub wait_duration: Option<f64>,
}

impl Job {
    pub fn issue(&self) -> &IssueJobData {
        match &self.data {
            JobData::Issue(data) => data,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub job_type: String,
    pub status: String,
    pub data: Value,
    pub enqueued_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub run_duration: Option<f64>,
    pub wait_duration: Option<f64>,
}

impl TryFrom<JobRow> for Job {
    type Error = ModelError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let job_type: JobType = row.job_type.parse()?;
        let status: JobStatus = row.status.parse()?;
        let data = JobData::decode(job_type, row.data).map_err(|source| ModelError::Payload {
            job_id: row.id,
            source,
        })?;

        Ok(Job {
            id: row.id,
            job_type,
            status,
            data,
            enqueued_at: row.enqueued_at,
            executed_at: row.executed_at,
            run_duration: row.run_duration,
            wait_duration: row.wait_duration,
        })
    }
}
