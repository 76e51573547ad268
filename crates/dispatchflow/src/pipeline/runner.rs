use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use uuid::Uuid;

use crate::jobs::{ErrorCode, JobError};
use crate::scripts::ScriptRegistry;

/// Spawns registry scripts as `<interpreter> <scripts_dir>/<name><suffix>`.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    scripts_dir: PathBuf,
    interpreter: String,
    suffix: String,
}

impl ScriptRunner {
    pub fn new(
        scripts_dir: impl Into<PathBuf>,
        interpreter: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            interpreter: interpreter.into(),
            suffix: suffix.into(),
        }
    }

    pub fn script_path(&self, script_name: &str) -> PathBuf {
        self.scripts_dir
            .join(format!("{script_name}{}", self.suffix))
    }

    /// Runs the script to completion. Stdout on exit 0, stderr otherwise.
    pub async fn run(
        &self,
        registry: &ScriptRegistry,
        script_name: &str,
        job_id: Uuid,
        subject: &str,
        args: &[String],
    ) -> Result<String, JobError> {
        let path = self.script_path(script_name);
        if registry.get(script_name).is_none() || !path.is_file() {
            return Err(JobError::new(
                ErrorCode::ScriptNotFound,
                format!("Script `{script_name}` does not exist"),
            ));
        }

        tracing::info!(job_id = %job_id, script = script_name, subject, "running script");
        let output = Command::new(&self.interpreter)
            .arg(&path)
            .arg("-j")
            .arg(job_id.to_string())
            .arg("--subject")
            .arg(subject)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                JobError::new(
                    ErrorCode::Subprocess,
                    format!("Failed to start `{}`: {e}", self.interpreter),
                )
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        tracing::warn!(job_id = %job_id, script = script_name, status = %output.status, "script failed");
        let message = if stderr.trim().is_empty() {
            format!("Script `{script_name}` exited with {}", output.status)
        } else {
            stderr
        };
        Err(JobError::new(ErrorCode::Subprocess, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts::{OutputKind, ScriptInfo};

    fn registry_with(names: &[&str]) -> ScriptRegistry {
        let mut registry = ScriptRegistry::new();
        for name in names {
            registry.insert(
                *name,
                ScriptInfo {
                    description: "test".into(),
                    arguments: vec![],
                    output: OutputKind::Read,
                },
            );
        }
        registry
    }

    fn runner_with(dir: &std::path::Path, scripts: &[(&str, &str)]) -> ScriptRunner {
        for (name, body) in scripts {
            std::fs::write(dir.join(format!("{name}.sh")), body).unwrap();
        }
        ScriptRunner::new(dir, "sh", ".sh")
    }

    #[tokio::test]
    async fn stdout_on_success() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with(tmp.path(), &[("echo_args", "echo \"$@\"\n")]);
        let id = Uuid::new_v4();

        let out = runner
            .run(
                &registry_with(&["echo_args"]),
                "echo_args",
                id,
                "phy",
                &["--eps".into(), "a;b".into()],
            )
            .await
            .unwrap();
        assert_eq!(out, format!("-j {id} --subject phy --eps a;b\n"));
    }

    #[tokio::test]
    async fn stderr_becomes_the_error_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with(tmp.path(), &[("boom", "echo 'bad input' >&2\nexit 3\n")]);

        let err = runner
            .run(&registry_with(&["boom"]), "boom", Uuid::new_v4(), "phy", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Subprocess);
        assert_eq!(err.message, "bad input\n");
    }

    #[tokio::test]
    async fn unknown_script_never_spawns() {
        let tmp = tempfile::tempdir().unwrap();
        // on disk but not registered
        let runner = runner_with(tmp.path(), &[("stray", "exit 0\n")]);

        for name in ["stray", "missing"] {
            let err = runner
                .run(&registry_with(&["missing"]), name, Uuid::new_v4(), "phy", &[])
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::ScriptNotFound);
            assert_eq!(err.message, format!("Script `{name}` does not exist"));
        }
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_subprocess_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.sh"), "exit 0\n").unwrap();
        let runner = ScriptRunner::new(tmp.path(), "definitely-not-an-interpreter", ".sh");

        let err = runner
            .run(&registry_with(&["x"]), "x", Uuid::new_v4(), "phy", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Subprocess);
    }
}
