pub mod error;
pub mod error_codes;
pub mod model;
pub mod repo;
pub mod retry;
pub mod token;

pub use error::{ModelError, StoreError};
pub use error_codes::{ErrorCode, JobError};
pub use model::{
    IssueJobData, IssueStatus, Job, JobData, JobPatch, JobStatus, JobType, OutputFile, Transition,
};
pub use repo::{JobsRepo, JOBS_CHANNEL, ORPHANED_ERROR};
pub use retry::ContentionPolicy;
pub use token::{CachedToken, TokenRepo};
