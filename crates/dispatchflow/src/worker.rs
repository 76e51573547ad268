//! The single consumer: claim, handle, record, repeat.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::{ErrorCode, Job, JobPatch, JobStatus, JobType, JobsRepo, StoreError, Transition, JOBS_CHANNEL};
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct Worker {
    jobs: JobsRepo,
    pipeline: Arc<Pipeline>,
    worker_id: String,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        jobs: JobsRepo,
        pipeline: Arc<Pipeline>,
        worker_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            jobs,
            pipeline,
            worker_id: worker_id.into(),
            poll_interval,
        }
    }

    /// Brings the checkouts up to date and reports jobs a previous worker
    /// left RUNNING. Those are not reclaimed.
    pub async fn startup(&self) {
        match self.pipeline.remote().access_token().await {
            Ok(token) => {
                if let Err(e) = self.pipeline.checkouts().refresh(&token).await {
                    tracing::warn!(error = %e, "initial checkout refresh failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "no token for initial checkout refresh"),
        }

        match self.jobs.ids_by_status(JobStatus::Running).await {
            Ok(ids) if !ids.is_empty() => tracing::warn!(
                count = ids.len(),
                job_ids = ?ids,
                "jobs already RUNNING at startup, left untouched; with no worker running, `dispatchctl reset <id> --orphaned` requeues one"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not check for orphaned jobs"),
        }
    }

    /// Runs until `shutdown` fires. A job in flight is always finished first.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(worker_id = %self.worker_id, poll_ms = self.poll_interval.as_millis() as u64, "worker loop starting");
        let mut listener = self.listen().await;

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => tracing::debug!("queue empty"),
                Err(e) => tracing::error!(error = %e, "claim failed"),
            }
            self.idle(&mut listener, &shutdown).await;
        }

        tracing::info!(worker_id = %self.worker_id, "worker loop stopped");
        Ok(())
    }

    /// Claims and fully processes at most one job.
    pub async fn run_once(&self) -> Result<Option<(Uuid, JobStatus)>, StoreError> {
        let Some(job) = self.jobs.claim_next().await? else {
            return Ok(None);
        };
        let job_id = job.id;
        tracing::info!(
            job_id = %job_id,
            job_type = %job.job_type,
            wait_s = job.wait_duration.unwrap_or_default(),
            "claimed job"
        );

        let transition = self.dispatch(job).await;
        let status = self.apply(job_id, transition).await?;
        tracing::info!(job_id = %job_id, status = %status, "job updated");
        Ok(Some((job_id, status)))
    }

    async fn dispatch(&self, job: Job) -> Transition {
        let pipeline = self.pipeline.clone();
        let job_id = job.id;

        // own task so a panicking handler cannot take the loop down
        let handle = tokio::spawn(async move {
            match job.job_type {
                JobType::Issue => pipeline.handle(&job).await,
            }
        });

        match handle.await {
            Ok(transition) => transition,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!(job_id = %job_id, code = %ErrorCode::Panic, error = %message, "handler panicked");
                Transition::failed(format!("Handler panicked: {message}"))
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, code = %ErrorCode::Unknown, error = %e, "handler task cancelled");
                Transition::failed(format!("Handler did not complete: {e}"))
            }
        }
    }

    async fn apply(&self, job_id: Uuid, transition: Transition) -> Result<JobStatus, StoreError> {
        match self
            .jobs
            .update_status(job_id, transition.status, &transition.patch)
            .await
        {
            Ok(()) => Ok(transition.status),
            Err(StoreError::RunningViaUpdate) => {
                let patch = JobPatch::error("Handler tried to leave the job RUNNING");
                self.jobs
                    .update_status(job_id, JobStatus::Failed, &patch)
                    .await?;
                Ok(JobStatus::Failed)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "could not record job outcome, job stays RUNNING");
                Err(e)
            }
        }
    }

    async fn listen(&self) -> Option<PgListener> {
        let mut listener = match PgListener::connect_with(self.jobs.pool()).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "LISTEN unavailable, polling only");
                return None;
            }
        };
        match listener.listen(JOBS_CHANNEL).await {
            Ok(()) => Some(listener),
            Err(e) => {
                tracing::warn!(error = %e, "LISTEN unavailable, polling only");
                None
            }
        }
    }

    /// Waits for a notification, the poll interval or shutdown, whichever
    /// comes first.
    async fn idle(&self, listener: &mut Option<PgListener>, shutdown: &CancellationToken) {
        let lost = match listener.as_mut() {
            Some(l) => tokio::select! {
                _ = shutdown.cancelled() => false,
                res = tokio::time::timeout(self.poll_interval, l.recv()) => match res {
                    Ok(Ok(n)) => {
                        tracing::debug!(job_id = n.payload(), "woken by notification");
                        false
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "notification listener lost, falling back to polling");
                        true
                    }
                    Err(_) => false,
                },
            },
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                false
            }
        };
        if lost {
            *listener = None;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => tracing::info!(signal = "SIGINT", "shutdown signal"),
            _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "shutdown signal"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_text() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic payload");
    }
}
