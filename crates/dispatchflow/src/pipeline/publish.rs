use std::path::Path;

use uuid::Uuid;

use crate::checkout::{Checkouts, PushOutcome};
use crate::config::SubjectConfig;
use crate::jobs::{ErrorCode, Job, JobError, OutputFile};
use crate::remote::RemoteSurface;

/// What happened to the content checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeReport {
    /// Read job; the checkout is not published.
    Untouched,
    NoChanges,
    ChangeRequest { branch: String, url: String },
    Compare { branch: String, url: String },
}

impl ChangeReport {
    pub fn branch(&self) -> Option<&str> {
        match self {
            ChangeReport::ChangeRequest { branch, .. } | ChangeReport::Compare { branch, .. } => {
                Some(branch.as_str())
            }
            ChangeReport::Untouched | ChangeReport::NoChanges => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ChangeReport::ChangeRequest { url, .. } | ChangeReport::Compare { url, .. } => {
                Some(url.as_str())
            }
            ChangeReport::Untouched | ChangeReport::NoChanges => None,
        }
    }
}

/// Uploads every file under `<output_dir>/<job_id>/` in name order. The
/// first failed upload stops the rest.
pub async fn upload_outputs(
    remote: &dyn RemoteSurface,
    output_dir: &Path,
    job_id: Uuid,
) -> Result<Vec<OutputFile>, JobError> {
    let dir = output_dir.join(job_id.to_string());
    let read_err = |e: std::io::Error| {
        JobError::new(
            ErrorCode::UploadFailed,
            format!("Failed to read output directory {}: {e}", dir.display()),
        )
    };

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(read_err(e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let destination = format!("{job_id}/{name}");
        let url = remote
            .upload_artifact(job_id, &dir.join(&name), &destination)
            .await
            .map_err(|e| {
                JobError::new(
                    ErrorCode::UploadFailed,
                    format!("Failed to upload file `{name}`: {e}"),
                )
            })?;
        files.push(OutputFile { file: name, url });
    }
    Ok(files)
}

/// Pushes the script's edits to a branch named after the job and, when the
/// thread asked for it, opens a pull request. The caller holds the
/// checkout lease.
pub async fn publish_changes(
    remote: &dyn RemoteSurface,
    checkouts: &dyn Checkouts,
    subject: &SubjectConfig,
    job: &Job,
) -> Result<ChangeReport, JobError> {
    let branch = job.id.to_string();
    let token = remote.access_token().await.map_err(|e| {
        JobError::new(
            ErrorCode::GitFailed,
            format!("Failed to get a token to push branch `{branch}`: {e}"),
        )
    })?;

    match checkouts
        .push_branch_and_diff(&subject.name, &branch, &token)
        .await
    {
        PushOutcome::NoChanges => Ok(ChangeReport::NoChanges),
        PushOutcome::Failed { stage, message } => Err(JobError::new(
            ErrorCode::GitFailed,
            format!("Failed to publish branch `{branch}` at `{stage}`: {message}"),
        )),
        PushOutcome::Pushed if job.issue().create_pull_request => {
            let url = remote
                .open_change_request(&subject.remote_repo, &branch, job.issue().issue_number)
                .await
                .map_err(|e| {
                    JobError::new(
                        ErrorCode::ChangeRequestFailed,
                        format!("Branch `{branch}` was pushed but the pull request failed: {e}"),
                    )
                })?;
            Ok(ChangeReport::ChangeRequest { branch, url })
        }
        PushOutcome::Pushed => {
            let url = remote.compare_url(&subject.remote_repo, &branch);
            Ok(ChangeReport::Compare { branch, url })
        }
    }
}

pub fn render_summary(
    stdout: &str,
    files: &[OutputFile],
    change: &ChangeReport,
    limit: usize,
) -> String {
    let mut body = String::from("### Output");

    let shown = truncate_chars(stdout.trim_end(), limit);
    if !shown.is_empty() {
        body.push_str(&format!("\n\n```\n{shown}\n```"));
    }

    if !files.is_empty() {
        body.push_str("\n\n");
        let links: Vec<String> = files
            .iter()
            .map(|f| format!("- [{}]({})", f.file, f.url))
            .collect();
        body.push_str(&links.join("\n"));
    }

    match change {
        ChangeReport::Untouched => {}
        ChangeReport::NoChanges => body.push_str("\n\nNo changes were made to the content."),
        ChangeReport::ChangeRequest { branch, url } => body.push_str(&format!(
            "\n\nChanges pushed to branch `{branch}`: [pull request]({url})"
        )),
        ChangeReport::Compare { branch, url } => body.push_str(&format!(
            "\n\nChanges pushed to branch `{branch}`: [compare and open a pull request]({url})"
        )),
    }
    body
}

pub fn render_error(job_id: Uuid, message: &str) -> String {
    let quoted: Vec<String> = message
        .trim_end()
        .lines()
        .map(|line| format!("> {line}"))
        .collect();
    format!(
        "### Error running script:\n\n{}\n\nPlease contact the team for assistance, quoting the job ID: {job_id}",
        quoted.join("\n")
    )
}

fn truncate_chars(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{kept}\n... output truncated, {} more characters", total - limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{IssueJobData, IssueStatus, JobStatus};
    use crate::test_support::{issue_job, FakeCheckouts, FakeRemote};

    fn subject() -> SubjectConfig {
        SubjectConfig {
            name: "phy".into(),
            checkout_path: "/nonexistent".into(),
            remote_repo: "acme/content".into(),
        }
    }

    fn write_job(create_pull_request: bool) -> Job {
        issue_job(
            JobStatus::Running,
            IssueJobData::new(3, IssueStatus::Opened, "compress_svgs", "phy", create_pull_request),
        )
    }

    #[tokio::test]
    async fn uploads_in_name_order_and_stops_at_first_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let dir = tmp.path().join(id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["c.csv", "a.csv", "b.csv"] {
            std::fs::write(dir.join(name), name).unwrap();
        }

        let remote = FakeRemote::default();
        let files = upload_outputs(&remote, tmp.path(), id).await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.file.as_str()).collect();
        assert_eq!(names, ["a.csv", "b.csv", "c.csv"]);
        assert_eq!(files[0].url, format!("https://results.example/{id}/a.csv"));

        let remote = FakeRemote::default().failing_upload("b.csv");
        let err = upload_outputs(&remote, tmp.path(), id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UploadFailed);
        assert!(err.message.contains("`b.csv`"));
        assert_eq!(remote.uploads(), vec![format!("{id}/a.csv")]);
    }

    #[tokio::test]
    async fn missing_output_dir_means_no_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let files = upload_outputs(&FakeRemote::default(), tmp.path(), Uuid::new_v4())
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn clean_tree_reports_no_changes() {
        let checkouts = FakeCheckouts::new(PushOutcome::NoChanges);
        let report = publish_changes(&FakeRemote::default(), &checkouts, &subject(), &write_job(true))
            .await
            .unwrap();
        assert_eq!(report, ChangeReport::NoChanges);
        assert_eq!(report.branch(), None);
    }

    #[tokio::test]
    async fn pushed_branch_opens_a_pull_request_when_asked() {
        let job = write_job(true);
        let remote = FakeRemote::default();
        let checkouts = FakeCheckouts::new(PushOutcome::Pushed);

        let report = publish_changes(&remote, &checkouts, &subject(), &job).await.unwrap();
        assert_eq!(report.branch(), Some(job.id.to_string().as_str()));
        assert_eq!(report.url(), Some("https://github.com/acme/content/pull/1"));
        assert_eq!(
            remote.change_requests(),
            vec![("acme/content".to_string(), job.id.to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn pushed_branch_without_pull_request_links_a_comparison() {
        let job = write_job(false);
        let remote = FakeRemote::default();
        let checkouts = FakeCheckouts::new(PushOutcome::Pushed);

        let report = publish_changes(&remote, &checkouts, &subject(), &job).await.unwrap();
        assert_eq!(
            report.url(),
            Some(format!("https://github.com/acme/content/compare/{}?expand=1", job.id).as_str())
        );
        assert!(remote.change_requests().is_empty());
    }

    #[tokio::test]
    async fn git_failures_name_the_stage_and_branch() {
        let job = write_job(true);
        let checkouts = FakeCheckouts::new(PushOutcome::Failed {
            stage: "push",
            message: "rejected".into(),
        });

        let err = publish_changes(&FakeRemote::default(), &checkouts, &subject(), &job)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GitFailed);
        assert!(err.message.contains(&job.id.to_string()));
        assert!(err.message.contains("`push`"));
    }

    #[test]
    fn summary_lists_output_and_links() {
        let files = vec![OutputFile {
            file: "links.csv".into(),
            url: "https://r/links.csv".into(),
        }];
        let body = render_summary("ok\n", &files, &ChangeReport::Untouched, 100);
        assert_eq!(body, "### Output\n\n```\nok\n```\n\n- [links.csv](https://r/links.csv)");

        let body = render_summary("", &[], &ChangeReport::NoChanges, 100);
        assert_eq!(body, "### Output\n\nNo changes were made to the content.");
    }

    #[test]
    fn long_output_is_truncated_on_char_boundaries() {
        let body = render_summary("ééééé", &[], &ChangeReport::Untouched, 3);
        assert!(body.contains("ééé\n... output truncated, 2 more characters"));
    }

    #[test]
    fn error_comment_quotes_every_line() {
        let id = Uuid::new_v4();
        let body = render_error(id, "line one\nline two\n");
        assert!(body.starts_with("### Error running script:\n\n> line one\n> line two\n\n"));
        assert!(body.ends_with(&id.to_string()));
    }
}
