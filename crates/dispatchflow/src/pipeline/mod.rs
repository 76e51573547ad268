//! Turns a claimed job into its next state: ask for an argument, or run the
//! script and publish what it produced.

pub mod args;
pub mod publish;
pub mod runner;

use std::path::PathBuf;
use std::sync::Arc;

use crate::checkout::{CheckoutLocks, Checkouts};
use crate::config::{Config, SubjectConfig};
use crate::conversation;
use crate::jobs::{ErrorCode, IssueStatus, Job, JobData, JobError, JobPatch, Transition};
use crate::remote::RemoteSurface;
use crate::scripts::{OutputKind, ScriptInfo, ScriptRegistry};

pub use args::{materialize_arguments, ArgumentError, ScratchDir};
pub use publish::ChangeReport;
pub use runner::ScriptRunner;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub output_dir: PathBuf,
    pub input_dir: PathBuf,
    pub comment_output_limit: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            input_dir: config.input_dir.clone(),
            comment_output_limit: config.comment_output_limit,
        }
    }
}

pub struct Pipeline {
    registry: Arc<ScriptRegistry>,
    subjects: Vec<SubjectConfig>,
    runner: ScriptRunner,
    remote: Arc<dyn RemoteSurface>,
    checkouts: Arc<dyn Checkouts>,
    locks: CheckoutLocks,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ScriptRegistry>,
        subjects: Vec<SubjectConfig>,
        runner: ScriptRunner,
        remote: Arc<dyn RemoteSurface>,
        checkouts: Arc<dyn Checkouts>,
        settings: PipelineSettings,
    ) -> Self {
        let locks = CheckoutLocks::new(subjects.iter().map(|s| s.name.as_str()));
        Self {
            registry,
            subjects,
            runner,
            remote,
            checkouts,
            locks,
            settings,
        }
    }

    pub fn from_config(
        config: &Config,
        registry: Arc<ScriptRegistry>,
        remote: Arc<dyn RemoteSurface>,
        checkouts: Arc<dyn Checkouts>,
    ) -> Self {
        Self::new(
            registry,
            config.subjects.clone(),
            ScriptRunner::new(
                &config.scripts_dir,
                &config.script_interpreter,
                &config.script_suffix,
            ),
            remote,
            checkouts,
            PipelineSettings::from_config(config),
        )
    }

    pub fn remote(&self) -> &Arc<dyn RemoteSurface> {
        &self.remote
    }

    pub fn checkouts(&self) -> &Arc<dyn Checkouts> {
        &self.checkouts
    }

    /// Never fails: every problem becomes a FAILED transition.
    pub async fn handle(&self, job: &Job) -> Transition {
        match &job.data {
            JobData::Issue(_) => self.handle_issue(job).await,
        }
    }

    async fn handle_issue(&self, job: &Job) -> Transition {
        let data = job.issue();

        if data.issue_status == IssueStatus::Opened {
            if let Err(e) = self.remote.add_reaction(data.issue_number, "rocket").await {
                let err = JobError::new(
                    ErrorCode::ReactionFailed,
                    format!("Failed to add initial reaction: {e}"),
                );
                return self.fail(job, err, JobPatch::default()).await;
            }
        }

        let Some(info) = self.registry.get(&data.script_name) else {
            let err = JobError::new(
                ErrorCode::ScriptNotFound,
                format!("Script `{}` does not exist", data.script_name),
            );
            return self.fail(job, err, JobPatch::default()).await;
        };
        let Some(subject) = self.subjects.iter().find(|s| s.name == data.subject) else {
            let err = JobError::new(
                ErrorCode::InvalidSubject,
                format!("Invalid subject `{}`", data.subject),
            );
            return self.fail(job, err, JobPatch::default()).await;
        };

        match conversation::next_missing_argument(job, &info.arguments) {
            Err(e) => {
                let err = JobError::new(ErrorCode::TooManyArguments, e.to_string());
                self.fail(job, err, JobPatch::default()).await
            }
            Ok(Some((index, spec))) => {
                match conversation::request_argument(self.remote.as_ref(), job, index, spec).await {
                    Ok(transition) => transition,
                    Err(err) => self.fail(job, err, JobPatch::default()).await,
                }
            }
            Ok(None) => self.execute(job, info, subject).await,
        }
    }

    async fn execute(&self, job: &Job, info: &ScriptInfo, subject: &SubjectConfig) -> Transition {
        let data = job.issue();

        // dropped on every return below, taking downloaded files with it
        let scratch = ScratchDir::new(&self.settings.input_dir, job.id);
        let args = match materialize_arguments(
            self.remote.as_ref(),
            &scratch,
            &info.arguments,
            &data.arguments,
        )
        .await
        {
            Ok(args) => args,
            Err(e) => {
                let err = JobError::new(ErrorCode::BadArgument, e.to_string());
                return self.fail(job, err, JobPatch::default()).await;
            }
        };

        let restore = (info.output == OutputKind::Write).then(|| job.id.to_string());
        let Some(lease) = self
            .locks
            .acquire(&subject.name, self.checkouts.clone(), restore)
            .await
        else {
            let err = JobError::new(
                ErrorCode::InvalidSubject,
                format!("No checkout configured for subject `{}`", subject.name),
            );
            return self.fail(job, err, JobPatch::default()).await;
        };

        self.refresh_checkouts(job).await;

        let stdout = match self
            .runner
            .run(&self.registry, &data.script_name, job.id, &subject.name, &args)
            .await
        {
            Ok(stdout) => stdout,
            Err(err) => {
                lease.release().await;
                return self.fail(job, err, JobPatch::default()).await;
            }
        };

        let change = match info.output {
            OutputKind::Read => Ok(ChangeReport::Untouched),
            OutputKind::Write => {
                publish::publish_changes(self.remote.as_ref(), self.checkouts.as_ref(), subject, job)
                    .await
            }
        };
        lease.release().await;

        let mut patch = JobPatch {
            result: Some(stdout.clone()),
            ..JobPatch::default()
        };
        let change = match change {
            Ok(change) => change,
            Err(err) => return self.fail(job, err, patch).await,
        };
        patch.branch = change.branch().map(str::to_string);
        patch.change_url = change.url().map(str::to_string);

        let files = match publish::upload_outputs(
            self.remote.as_ref(),
            &self.settings.output_dir,
            job.id,
        )
        .await
        {
            Ok(files) => files,
            Err(err) => return self.fail(job, err, patch).await,
        };
        if !files.is_empty() {
            patch.output_files = Some(files.clone());
        }

        let summary = publish::render_summary(
            &stdout,
            &files,
            &change,
            self.settings.comment_output_limit,
        );
        match self.remote.add_comment(data.issue_number, &summary).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id, script = %data.script_name, "job finished");
                Transition::finished(patch)
            }
            Err(e) => {
                // the script worked, but nobody was told
                let err = JobError::new(ErrorCode::CommentFailed, format!("Failed to add comment: {e}"));
                self.fail(job, err, patch).await
            }
        }
    }

    async fn refresh_checkouts(&self, job: &Job) {
        let token = match self.remote.access_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "no token, running against stale checkouts");
                return;
            }
        };
        if let Err(e) = self.checkouts.refresh(&token).await {
            tracing::warn!(job_id = %job.id, error = %e, "checkout refresh failed");
        }
    }

    /// Records `err` on the job and tells the thread when it can.
    async fn fail(&self, job: &Job, err: JobError, mut patch: JobPatch) -> Transition {
        tracing::warn!(job_id = %job.id, code = %err.code, error = %err.message, "job failed");

        if err.code.notifies_thread() {
            let body = publish::render_error(job.id, &err.message);
            if let Err(e) = self.remote.add_comment(job.issue().issue_number, &body).await {
                patch.notify_error = Some(format!("Failed to add comment: {e}"));
            }
        }
        patch.error = Some(err.message);
        Transition::failed_with(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::PushOutcome;
    use crate::jobs::{IssueJobData, JobStatus};
    use crate::scripts::{ArgKind, ArgSpec};
    use crate::test_support::{issue_job, FakeCheckouts, FakeRemote};

    struct Harness {
        _tmp: tempfile::TempDir,
        output_dir: PathBuf,
        remote: Arc<FakeRemote>,
        checkouts: Arc<FakeCheckouts>,
        pipeline: Pipeline,
    }

    fn text_arg(param: &str) -> ArgSpec {
        ArgSpec {
            param: param.into(),
            kind: ArgKind::Text,
            title: param.into(),
            description: "d".into(),
            example: "e".into(),
        }
    }

    fn harness(remote: FakeRemote, push: PushOutcome) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let scripts = tmp.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        std::fs::write(scripts.join("greet.sh"), "printf ok\n").unwrap();
        std::fs::write(scripts.join("fail.sh"), "echo broken >&2\nexit 1\n").unwrap();
        std::fs::write(scripts.join("edit.sh"), "printf edited\n").unwrap();

        let mut registry = ScriptRegistry::new();
        registry.insert(
            "greet",
            ScriptInfo {
                description: "two args".into(),
                arguments: vec![text_arg("a"), text_arg("b")],
                output: OutputKind::Read,
            },
        );
        registry.insert(
            "fail",
            ScriptInfo {
                description: "always fails".into(),
                arguments: vec![],
                output: OutputKind::Read,
            },
        );
        registry.insert(
            "edit",
            ScriptInfo {
                description: "write job".into(),
                arguments: vec![],
                output: OutputKind::Write,
            },
        );

        let remote = Arc::new(remote);
        let checkouts = Arc::new(FakeCheckouts::new(push));
        let output_dir = tmp.path().join("output");
        let pipeline = Pipeline::new(
            Arc::new(registry),
            vec![SubjectConfig {
                name: "phy".into(),
                checkout_path: tmp.path().join("data/phy"),
                remote_repo: "acme/content".into(),
            }],
            ScriptRunner::new(&scripts, "sh", ".sh"),
            remote.clone(),
            checkouts.clone(),
            PipelineSettings {
                output_dir: output_dir.clone(),
                input_dir: tmp.path().join("input"),
                comment_output_limit: 1000,
            },
        );
        Harness {
            _tmp: tmp,
            output_dir,
            remote,
            checkouts,
            pipeline,
        }
    }

    fn job(script: &str, arguments: &[&str], status: IssueStatus) -> Job {
        let mut data = IssueJobData::new(42, status, script, "phy", false);
        data.arguments = arguments.iter().map(|s| s.to_string()).collect();
        issue_job(JobStatus::Running, data)
    }

    #[tokio::test]
    async fn new_thread_gets_a_reaction_and_a_question() {
        let h = harness(FakeRemote::default(), PushOutcome::NoChanges);
        let t = h.pipeline.handle(&job("greet", &[], IssueStatus::Opened)).await;

        assert_eq!(t.status, JobStatus::Paused);
        assert_eq!(t.patch.argument_index, Some(0));
        assert_eq!(h.remote.reactions(), vec![(42, "rocket".to_string())]);
        assert!(h.remote.comments()[0].1.contains("### Script argument: a"));
    }

    #[tokio::test]
    async fn complete_arguments_run_and_finish() {
        let h = harness(FakeRemote::default(), PushOutcome::NoChanges);
        let t = h
            .pipeline
            .handle(&job("greet", &["x", "y"], IssueStatus::Comment))
            .await;

        assert_eq!(t.status, JobStatus::Finished);
        assert_eq!(t.patch.result.as_deref(), Some("ok"));
        assert!(h.remote.reactions().is_empty());
        let comments = h.remote.comments();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].1.starts_with("### Output"));
    }

    #[tokio::test]
    async fn unknown_script_fails_with_a_comment() {
        let h = harness(FakeRemote::default(), PushOutcome::NoChanges);
        let t = h.pipeline.handle(&job("nope", &[], IssueStatus::Opened)).await;

        assert_eq!(t.status, JobStatus::Failed);
        assert_eq!(t.patch.error.as_deref(), Some("Script `nope` does not exist"));
        assert!(h.remote.comments()[0].1.starts_with("### Error running script:"));
    }

    #[tokio::test]
    async fn unknown_subject_is_rejected() {
        let h = harness(FakeRemote::default(), PushOutcome::NoChanges);
        let mut j = job("fail", &[], IssueStatus::Comment);
        if let JobData::Issue(data) = &mut j.data {
            data.subject = "bio".into();
        }
        let t = h.pipeline.handle(&j).await;
        assert_eq!(t.patch.error.as_deref(), Some("Invalid subject `bio`"));
    }

    #[tokio::test]
    async fn script_stderr_is_the_error() {
        let h = harness(FakeRemote::default(), PushOutcome::NoChanges);
        let t = h.pipeline.handle(&job("fail", &[], IssueStatus::Comment)).await;

        assert_eq!(t.status, JobStatus::Failed);
        assert_eq!(t.patch.error.as_deref(), Some("broken\n"));
        assert!(h.remote.comments()[0].1.contains("> broken"));
    }

    #[tokio::test]
    async fn failed_error_comment_keeps_the_original_error() {
        let h = harness(FakeRemote::default().failing_comments(), PushOutcome::NoChanges);
        let t = h.pipeline.handle(&job("fail", &[], IssueStatus::Comment)).await;

        assert_eq!(t.status, JobStatus::Failed);
        assert_eq!(t.patch.error.as_deref(), Some("broken\n"));
        assert!(t.patch.notify_error.unwrap().starts_with("Failed to add comment"));
    }

    #[tokio::test]
    async fn undeliverable_summary_fails_a_successful_run() {
        let h = harness(FakeRemote::default().failing_comments(), PushOutcome::NoChanges);
        let t = h
            .pipeline
            .handle(&job("greet", &["x", "y"], IssueStatus::Comment))
            .await;

        assert_eq!(t.status, JobStatus::Failed);
        assert_eq!(t.patch.result.as_deref(), Some("ok"));
        assert!(t.patch.error.unwrap().starts_with("Failed to add comment"));
    }

    #[tokio::test]
    async fn undeliverable_prompt_fails_without_a_second_comment() {
        let h = harness(FakeRemote::default().failing_comments(), PushOutcome::NoChanges);
        let t = h.pipeline.handle(&job("greet", &["x"], IssueStatus::Comment)).await;

        assert_eq!(t.status, JobStatus::Failed);
        assert!(t.patch.error.unwrap().starts_with("Failed to add comment"));
        assert_eq!(t.patch.argument_index, None);
        assert_eq!(t.patch.notify_error, None);
    }

    #[tokio::test]
    async fn failed_reaction_fails_silently() {
        let h = harness(FakeRemote::default().failing_reactions(), PushOutcome::NoChanges);
        let t = h.pipeline.handle(&job("greet", &[], IssueStatus::Opened)).await;

        assert_eq!(t.status, JobStatus::Failed);
        assert!(t.patch.error.unwrap().starts_with("Failed to add initial reaction"));
        assert!(h.remote.comments().is_empty());
    }

    #[tokio::test]
    async fn write_job_without_changes_finishes_without_a_branch() {
        let h = harness(FakeRemote::default(), PushOutcome::NoChanges);
        let j = job("edit", &[], IssueStatus::Comment);
        let t = h.pipeline.handle(&j).await;

        assert_eq!(t.status, JobStatus::Finished);
        assert_eq!(t.patch.branch, None);
        assert!(h.remote.comments()[0].1.contains("No changes were made"));
        assert_eq!(
            h.checkouts.events(),
            vec![
                "refresh".to_string(),
                format!("push phy {}", j.id),
                format!("restore phy {}", j.id),
            ]
        );
    }

    #[tokio::test]
    async fn failed_push_still_restores_the_checkout() {
        let h = harness(
            FakeRemote::default(),
            PushOutcome::Failed {
                stage: "push",
                message: "denied".into(),
            },
        );
        let j = job("edit", &[], IssueStatus::Comment);
        let t = h.pipeline.handle(&j).await;

        assert_eq!(t.status, JobStatus::Failed);
        assert_eq!(t.patch.result.as_deref(), Some("edited"));
        assert!(t.patch.error.unwrap().contains(&j.id.to_string()));
        assert_eq!(
            h.checkouts.events().last(),
            Some(&format!("restore phy {}", j.id))
        );
    }

    #[tokio::test]
    async fn pushed_changes_are_linked() {
        let h = harness(FakeRemote::default(), PushOutcome::Pushed);
        let j = job("edit", &[], IssueStatus::Comment);
        let t = h.pipeline.handle(&j).await;

        assert_eq!(t.status, JobStatus::Finished);
        assert_eq!(t.patch.branch, Some(j.id.to_string()));
        assert!(t.patch.change_url.unwrap().contains("/compare/"));
    }

    #[tokio::test]
    async fn artifacts_are_uploaded_and_listed() {
        let h = harness(FakeRemote::default(), PushOutcome::NoChanges);
        let j = job("greet", &["x", "y"], IssueStatus::Comment);
        let dir = h.output_dir.join(j.id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("report.csv"), "a,b\n").unwrap();

        let t = h.pipeline.handle(&j).await;
        assert_eq!(t.status, JobStatus::Finished);
        let files = t.patch.output_files.unwrap();
        assert_eq!(files[0].file, "report.csv");
        assert!(h.remote.comments()[0].1.contains("- [report.csv]("));
    }
}
