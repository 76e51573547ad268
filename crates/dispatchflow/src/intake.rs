//! Producer side: turns issue thread events into queue operations.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::{self, ConversationError};
use crate::jobs::{IssueJobData, IssueStatus, Job, JobStatus, JobsRepo, StoreError};
use crate::scripts::ScriptRegistry;

const RUN_COMMANDS: [&str; 5] = ["run", "rerun", "restart", "re-run", "re-start"];

const REPLY_WAIT_ATTEMPTS: u32 = 10;
const REPLY_WAIT_DELAY: Duration = Duration::from_millis(300);

/// What a new thread asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRequest {
    pub issue_number: i64,
    pub script_name: String,
    pub subject: String,
    #[serde(default)]
    pub create_pull_request: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntakeOutcome {
    Enqueued { job_id: Uuid },
    Reset { job_id: Uuid },
    ArgumentRecorded { job_id: Uuid },
    Ignored { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("no job is bound to issue #{0}")]
    NoJob(i64),

    #[error("job {job_id} is {status}, not waiting for an argument")]
    NotAwaitingArgument { job_id: Uuid, status: JobStatus },

    #[error("job {job_id} names unknown script `{script}`")]
    UnknownScript { job_id: Uuid, script: String },

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Intake {
    jobs: JobsRepo,
    registry: Arc<ScriptRegistry>,
    bot_name: String,
    reply_wait: (u32, Duration),
}

impl Intake {
    pub fn new(jobs: JobsRepo, registry: Arc<ScriptRegistry>, bot_name: impl Into<String>) -> Self {
        Self {
            jobs,
            registry,
            bot_name: bot_name.into(),
            reply_wait: (REPLY_WAIT_ATTEMPTS, REPLY_WAIT_DELAY),
        }
    }

    /// How often, and how far apart, a reply re-reads a job that is still
    /// RUNNING before giving up on it.
    pub fn with_reply_wait(mut self, attempts: u32, delay: Duration) -> Self {
        self.reply_wait = (attempts, delay);
        self
    }

    /// A thread was opened. Reuses the thread's unfinished job if it has one.
    pub async fn open_thread(&self, req: &ThreadRequest) -> Result<IntakeOutcome, IntakeError> {
        tracing::info!(issue = req.issue_number, script = %req.script_name, subject = %req.subject, "thread opened");
        let data = IssueJobData::new(
            req.issue_number,
            IssueStatus::Opened,
            &req.script_name,
            &req.subject,
            req.create_pull_request,
        );

        match self.jobs.find_by_correlation(req.issue_number).await? {
            Some(existing) => {
                let job_id = self.jobs.reset(existing.id, data).await?;
                Ok(IntakeOutcome::Reset { job_id })
            }
            None => {
                let job_id = self.jobs.enqueue(data).await?;
                Ok(IntakeOutcome::Enqueued { job_id })
            }
        }
    }

    /// A comment landed on a thread. `fallback` describes the thread in case
    /// a run command arrives for an issue whose job is gone.
    pub async fn comment(
        &self,
        issue_number: i64,
        author: &str,
        body: &str,
        fallback: Option<&ThreadRequest>,
    ) -> Result<IntakeOutcome, IntakeError> {
        if author == self.bot_name {
            return Ok(IntakeOutcome::Ignored {
                reason: "comment from this bot".into(),
            });
        }

        let job = self.jobs.find_by_correlation(issue_number).await?;

        if let Some(command) = parse_command(body) {
            if !RUN_COMMANDS.contains(&command.as_str()) {
                return Ok(IntakeOutcome::Ignored {
                    reason: format!("unknown command `{command}`"),
                });
            }
            return match (job, fallback) {
                (Some(job), _) => {
                    tracing::info!(issue = issue_number, job_id = %job.id, "rerun requested");
                    let job_id = self.jobs.reset(job.id, job.issue().restarted()).await?;
                    Ok(IntakeOutcome::Reset { job_id })
                }
                (None, Some(req)) => {
                    let data = IssueJobData::new(
                        issue_number,
                        IssueStatus::Reset,
                        &req.script_name,
                        &req.subject,
                        req.create_pull_request,
                    );
                    let job_id = self.jobs.enqueue(data).await?;
                    Ok(IntakeOutcome::Enqueued { job_id })
                }
                (None, None) => Err(IntakeError::NoJob(issue_number)),
            };
        }

        let job = job.ok_or(IntakeError::NoJob(issue_number))?;
        let job = self.settled(issue_number, job).await?;
        if job.status != JobStatus::Paused {
            return Err(IntakeError::NotAwaitingArgument {
                job_id: job.id,
                status: job.status,
            });
        }
        let data = job.issue();
        let info = self
            .registry
            .get(&data.script_name)
            .ok_or_else(|| IntakeError::UnknownScript {
                job_id: job.id,
                script: data.script_name.clone(),
            })?;

        let transition = conversation::record_argument(&job, &info.arguments, body)?;
        self.jobs
            .update_status_if(
                job.id,
                JobStatus::Paused,
                data.arguments.len(),
                transition.status,
                &transition.patch,
            )
            .await?;
        tracing::info!(issue = issue_number, job_id = %job.id, index = data.arguments.len(), "argument recorded");
        Ok(IntakeOutcome::ArgumentRecorded { job_id: job.id })
    }

    /// The prompt is posted before the worker stores PAUSED, so a quick
    /// reply can find the job still RUNNING.
    async fn settled(&self, issue_number: i64, mut job: Job) -> Result<Job, IntakeError> {
        let (attempts, delay) = self.reply_wait;
        for _ in 0..attempts {
            if job.status != JobStatus::Running {
                break;
            }
            tracing::debug!(issue = issue_number, job_id = %job.id, "reply while RUNNING, waiting");
            tokio::time::sleep(delay).await;
            job = self
                .jobs
                .get_job(job.id)
                .await?
                .ok_or(IntakeError::NoJob(issue_number))?;
        }
        Ok(job)
    }
}

/// `Please <command>` on a single line, lower-cased.
pub fn parse_command(body: &str) -> Option<String> {
    let line = body.trim_end_matches(['\r', '\n']);
    if line.contains('\n') {
        return None;
    }
    line.strip_prefix("Please ")
        .map(|command| command.trim().to_lowercase())
}
