use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ScriptNotFound,
    InvalidSubject,
    BadArgument,
    TooManyArguments,
    Subprocess,
    ReactionFailed,
    CommentFailed,
    UploadFailed,
    GitFailed,
    ChangeRequestFailed,
    Panic,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScriptNotFound => "SCRIPT_NOT_FOUND",
            Self::InvalidSubject => "INVALID_SUBJECT",
            Self::BadArgument => "BAD_ARGUMENT",
            Self::TooManyArguments => "TOO_MANY_ARGUMENTS",
            Self::Subprocess => "SUBPROCESS",
            Self::ReactionFailed => "REACTION_FAILED",
            Self::CommentFailed => "COMMENT_FAILED",
            Self::UploadFailed => "UPLOAD_FAILED",
            Self::GitFailed => "GIT_FAILED",
            Self::ChangeRequestFailed => "CHANGE_REQUEST_FAILED",
            Self::Panic => "PANIC",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether the originating thread should be told about the failure.
    /// Not when the thread itself is what could not be reached.
    pub fn notifies_thread(&self) -> bool {
        !matches!(self, Self::CommentFailed | Self::ReactionFailed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one stage of a job. The message is what ends up in the job's
/// `error` field, verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JobError {}
