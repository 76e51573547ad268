//! Collects a script's declared arguments from the issue thread, one
//! question per round trip.

use crate::jobs::{ErrorCode, IssueStatus, Job, JobError, JobPatch, Transition};
use crate::remote::RemoteSurface;
use crate::scripts::{ArgKind, ArgSpec};

const PUBLISH_HOW_TO: &str = "\
To publish a Google Sheet CSV so the script can access it, follow these steps:

- Open the sheet in Google Sheets
- Click File -> Share -> Publish to web
- Specify a single sheet to publish (if you have multiple sheets)
- Specify output format: Comma-separated values (.csv)
- Click Publish
- Copy the link in the text box
- Paste the link in your comment

You can unpublish the sheet after the script has finished running.
";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("Too many arguments: `{script}` takes {expected} but the job already has {supplied}")]
    TooManyArguments {
        script: String,
        supplied: usize,
        expected: usize,
    },

    #[error("argument reply is empty")]
    EmptyReply,
}

/// The first declared argument the job has no value for yet, with its index.
pub fn next_missing_argument<'a>(
    job: &Job,
    specs: &'a [ArgSpec],
) -> Result<Option<(usize, &'a ArgSpec)>, ConversationError> {
    let data = job.issue();
    let supplied = data.arguments.len();
    if supplied > specs.len() {
        return Err(ConversationError::TooManyArguments {
            script: data.script_name.clone(),
            supplied,
            expected: specs.len(),
        });
    }
    Ok(specs.get(supplied).map(|spec| (supplied, spec)))
}

pub fn render_prompt(spec: &ArgSpec) -> String {
    let mut prompt = format!(
        "### Script argument: {}\n\n{}\n\nExample:\n```\n{}\n```\n\n",
        spec.title, spec.description, spec.example
    );
    if let ArgKind::File { file_type } = &spec.kind {
        prompt.push_str(&format!(
            "This argument is a `{file_type}` file. Reply with a link to it, not its contents.\n"
        ));
        prompt.push_str(PUBLISH_HOW_TO);
        prompt.push('\n');
    }
    prompt.push_str("Please reply to this comment with the argument, or delete this issue to cancel the job.\n");
    prompt
}

/// Posts the prompt for argument `index` and parks the job until a reply
/// arrives. A prompt that cannot be delivered is a `COMMENT_FAILED` error.
pub async fn request_argument(
    remote: &dyn RemoteSurface,
    job: &Job,
    index: usize,
    spec: &ArgSpec,
) -> Result<Transition, JobError> {
    let issue_number = job.issue().issue_number;
    remote
        .add_comment(issue_number, &render_prompt(spec))
        .await
        .map_err(|e| JobError::new(ErrorCode::CommentFailed, format!("Failed to add comment: {e}")))?;

    tracing::info!(job_id = %job.id, param = %spec.param, index, "waiting for argument");
    Ok(Transition::paused(JobPatch {
        argument_index: Some(index),
        ..JobPatch::default()
    }))
}

/// Drops a leading quote of the prompt and the code fences people wrap
/// answers in. A reply that is nothing but `>` lines is kept as written.
pub fn strip_reply(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    let quoted = lines
        .iter()
        .take_while(|line| line.trim_start().starts_with('>') || line.trim().is_empty())
        .count();
    let has_quote = lines[..quoted].iter().any(|line| !line.trim().is_empty());
    let body = if has_quote && quoted < lines.len() {
        &lines[quoted..]
    } else {
        &lines[..]
    };
    body.join("\n")
        .trim_matches(|c: char| c == '`' || c.is_whitespace())
        .to_string()
}

/// Appends a reply to the job's arguments and sends it back to the queue.
pub fn record_argument(
    job: &Job,
    specs: &[ArgSpec],
    raw_value: &str,
) -> Result<Transition, ConversationError> {
    let data = job.issue();
    if data.arguments.len() >= specs.len() {
        return Err(ConversationError::TooManyArguments {
            script: data.script_name.clone(),
            supplied: data.arguments.len() + 1,
            expected: specs.len(),
        });
    }

    let value = strip_reply(raw_value);
    if value.is_empty() {
        return Err(ConversationError::EmptyReply);
    }

    let mut arguments = data.arguments.clone();
    arguments.push(value);
    Ok(Transition::pending(JobPatch {
        arguments: Some(arguments),
        issue_status: Some(IssueStatus::Comment),
        ..JobPatch::default()
    }))
}
