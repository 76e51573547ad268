// crates/dispatchflow/src/jobs/repo.rs

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::jobs::error::StoreError;
use crate::jobs::model::{Job, JobData, JobPatch, JobRow, JobStatus, JobType};
use crate::jobs::retry::{retry_on_contention, ContentionPolicy};

/// Channel notified whenever a job becomes PENDING.
pub const JOBS_CHANNEL: &str = "dispatch_jobs";

/// Error recorded on jobs failed through [`JobsRepo::fail_orphaned`].
pub const ORPHANED_ERROR: &str = "Abandoned by a stopped worker";

const THREAD_INDEX: &str = "jobs_open_issue_thread_idx";

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
    policy: ContentionPolicy,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, ContentionPolicy::default())
    }

    pub fn with_policy(pool: PgPool, policy: ContentionPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----------------------------
    // Producers
    // ----------------------------

    /// Creates a PENDING job under a freshly drawn id.
    pub async fn enqueue(&self, data: impl Into<JobData>) -> Result<Uuid, StoreError> {
        let data = data.into();
        let value = data.to_value()?;
        let job_type = data.job_type();

        retry_on_contention(&self.policy, "enqueue", || {
            self.insert_with_fresh_id(job_type, &value)
        })
        .await
        .map_err(|e| thread_conflict(e, &data))
    }

    async fn insert_with_fresh_id(&self, job_type: JobType, value: &Value) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;

        loop {
            let candidate = Uuid::new_v4();
            // ON CONFLICT only covers the primary key, so a taken id yields no
            // row while the thread index still raises.
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO jobs (id, job_type, status, data, enqueued_at)
                VALUES ($1, $2, $3, $4, clock_timestamp())
                ON CONFLICT (id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(candidate)
            .bind(job_type.as_str())
            .bind(JobStatus::Pending.as_str())
            .bind(value)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some(id) => {
                    notify_pending(&mut tx, id).await?;
                    tx.commit().await?;
                    return Ok(id);
                }
                None => tracing::warn!(job_id = %candidate, "generated job id already taken"),
            }
        }
    }

    /// Replaces a job's data and puts it at the back of the queue.
    pub async fn reset(&self, job_id: Uuid, data: impl Into<JobData>) -> Result<Uuid, StoreError> {
        let data = data.into();
        let value = data.to_value()?;
        let job_type = data.job_type();

        retry_on_contention(&self.policy, "reset", || {
            self.reset_once(job_id, job_type, &value)
        })
        .await
        .map_err(|e| thread_conflict(e, &data))
    }

    async fn reset_once(&self, job_id: Uuid, job_type: JobType, value: &Value) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;

        let current: JobStatus = match current {
            Some(s) => s.parse()?,
            None => return Err(StoreError::NotFound(job_id)),
        };
        if current == JobStatus::Running {
            return Err(StoreError::ResetWhileRunning(job_id));
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                job_type = $3,
                data = $4,
                enqueued_at = clock_timestamp(),
                executed_at = NULL,
                run_duration = NULL,
                wait_duration = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(JobStatus::Pending.as_str())
        .bind(job_type.as_str())
        .bind(value)
        .execute(&mut *tx)
        .await?;

        notify_pending(&mut tx, job_id).await?;
        tx.commit().await?;
        Ok(job_id)
    }

    // ----------------------------
    // Claiming
    // ----------------------------

    /// Moves the oldest PENDING job to RUNNING and returns it.
    ///
    /// Contention that outlasts the retry policy is reported as an empty
    /// queue, logged at warn so it can be told apart from a real one.
    pub async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        match retry_on_contention(&self.policy, "claim_next", || self.claim_once()).await {
            Ok(job) => Ok(job),
            Err(StoreError::Contended {
                operation,
                attempts,
            }) => {
                tracing::warn!(operation, attempts, "claim abandoned under lock contention");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn claim_once(&self) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        loop {
            let row = sqlx::query_as::<_, JobRow>(
                r#"
                WITH candidate AS (
                  SELECT id
                  FROM jobs
                  WHERE status = 'PENDING'
                  ORDER BY enqueued_at ASC, id ASC
                  FOR UPDATE SKIP LOCKED
                  LIMIT 1
                )
                UPDATE jobs j
                SET status = 'RUNNING',
                    executed_at = COALESCE(j.executed_at, clock_timestamp()),
                    wait_duration = EXTRACT(EPOCH FROM (clock_timestamp() - j.enqueued_at))::double precision
                FROM candidate
                WHERE j.id = candidate.id
                RETURNING j.id, j.job_type, j.status, j.data, j.enqueued_at,
                          j.executed_at, j.run_duration, j.wait_duration
                "#,
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                tx.commit().await?;
                return Ok(None);
            };

            let job_id = row.id;
            match Job::try_from(row) {
                Ok(job) => {
                    tx.commit().await?;
                    return Ok(Some(job));
                }
                Err(e) => {
                    // a row no handler can read would otherwise stall the queue
                    tracing::error!(job_id = %job_id, error = %e, "claimed malformed job, failing it");
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'FAILED',
                            run_duration = 0,
                            data = data || jsonb_build_object('error', $2::text)
                        WHERE id = $1
                        "#,
                    )
                    .bind(job_id)
                    .bind(e.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// Merges `patch` into the job's data and moves it to `status`.
    pub async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        patch: &JobPatch,
    ) -> Result<(), StoreError> {
        if status == JobStatus::Running {
            return Err(StoreError::RunningViaUpdate);
        }
        let patch = patch.to_value()?;

        let updated = retry_on_contention(&self.policy, "update_status", || {
            self.update_once(job_id, status, &patch, None)
        })
        .await?;

        if !updated {
            return Err(StoreError::NotFound(job_id));
        }
        if status == JobStatus::Failed {
            tracing::info!(job_id = %job_id, error = ?patch.get("error"), "job failed");
        }
        Ok(())
    }

    /// Like [`update_status`](Self::update_status) but only applies while the
    /// job still has `expected_status` and `expected_arguments` recorded
    /// arguments. Used for argument replies so two replies racing for the same
    /// slot cannot both land.
    pub async fn update_status_if(
        &self,
        job_id: Uuid,
        expected_status: JobStatus,
        expected_arguments: usize,
        status: JobStatus,
        patch: &JobPatch,
    ) -> Result<(), StoreError> {
        if status == JobStatus::Running {
            return Err(StoreError::RunningViaUpdate);
        }
        let patch = patch.to_value()?;
        let guard = Some((expected_status, Some(expected_arguments as i32)));

        let updated = retry_on_contention(&self.policy, "update_status_if", || {
            self.update_once(job_id, status, &patch, guard)
        })
        .await?;

        if updated {
            return Ok(());
        }
        match self.get_job(job_id).await? {
            Some(_) => Err(StoreError::Conflict(job_id)),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    /// Fails a job a stopped worker left RUNNING so it can be reset. Only
    /// safe while no worker is processing it.
    pub async fn fail_orphaned(&self, job_id: Uuid) -> Result<(), StoreError> {
        let patch = JobPatch::error(ORPHANED_ERROR).to_value()?;
        let guard = Some((JobStatus::Running, None));

        let updated = retry_on_contention(&self.policy, "fail_orphaned", || {
            self.update_once(job_id, JobStatus::Failed, &patch, guard)
        })
        .await?;

        if updated {
            tracing::warn!(job_id = %job_id, "orphaned job marked FAILED");
            return Ok(());
        }
        match self.get_job(job_id).await? {
            Some(_) => Err(StoreError::Conflict(job_id)),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    async fn update_once(
        &self,
        job_id: Uuid,
        status: JobStatus,
        patch: &Value,
        guard: Option<(JobStatus, Option<i32>)>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                data = data || $3::jsonb,
                run_duration = CASE
                    WHEN $2 IN ('FINISHED', 'FAILED') AND executed_at IS NOT NULL
                    THEN EXTRACT(EPOCH FROM (clock_timestamp() - executed_at))::double precision
                    ELSE run_duration
                END
            WHERE id = $1
              AND ($4::text IS NULL OR status = $4)
              AND ($5::int IS NULL
                   OR jsonb_array_length(COALESCE(data->'arguments', '[]'::jsonb)) = $5)
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(patch)
        .bind(guard.map(|(s, _)| s.as_str()))
        .bind(guard.and_then(|(_, n)| n))
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        if status == JobStatus::Pending {
            notify_pending(&mut tx, job_id).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_type, status, data, enqueued_at, executed_at, run_duration, wait_duration
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Job::try_from).transpose()?)
    }

    /// The unfinished job bound to an issue thread, if any.
    pub async fn find_by_correlation(&self, issue_number: i64) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_type, status, data, enqueued_at, executed_at, run_duration, wait_duration
            FROM jobs
            WHERE job_type = 'ISSUE'
              AND data->>'issue_number' = $1
              AND status <> 'FINISHED'
            ORDER BY enqueued_at DESC
            LIMIT 1
            "#,
        )
        .bind(issue_number.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Job::try_from).transpose()?)
    }

    pub async fn ids_by_status(&self, status: JobStatus) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE status = $1 ORDER BY enqueued_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

async fn notify_pending(tx: &mut Transaction<'_, Postgres>, job_id: Uuid) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(JOBS_CHANNEL)
        .bind(job_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn thread_conflict(err: StoreError, data: &JobData) -> StoreError {
    match (&err, data) {
        (StoreError::Database(sqlx::Error::Database(db)), JobData::Issue(issue))
            if db.constraint() == Some(THREAD_INDEX) =>
        {
            StoreError::DuplicateThread(issue.issue_number)
        }
        _ => err,
    }
}
