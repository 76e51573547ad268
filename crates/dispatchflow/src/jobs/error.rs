use uuid::Uuid;

/// Row or payload that does not fit the typed job model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown job status `{0}`")]
    UnknownStatus(String),

    #[error("unknown job type `{0}`")]
    UnknownJobType(String),

    #[error("malformed data for job {job_id}: {source}")]
    Payload {
        job_id: Uuid,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Lock contention outlasted the bounded retry policy.
    #[error("{operation} still contended after {attempts} attempts")]
    Contended {
        operation: &'static str,
        attempts: u32,
    },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("cannot set job status to RUNNING outside of claim_next")]
    RunningViaUpdate,

    #[error("issue #{0} already has an unfinished job")]
    DuplicateThread(i64),

    #[error("job {0} is RUNNING and cannot be reset")]
    ResetWhileRunning(Uuid),

    #[error("job {0} changed concurrently, reload and try again")]
    Conflict(Uuid),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("could not encode job data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_contended(&self) -> bool {
        matches!(self, StoreError::Contended { .. })
    }
}
