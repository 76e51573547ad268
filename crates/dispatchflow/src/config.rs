use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::retry::ContentionPolicy;

/// Runtime settings read from `DISPATCH_*` variables, falling back to the
/// legacy names the deployment already sets.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub admin_addr: Option<String>,
    pub api_token: Option<String>,
    pub migrate_on_startup: bool,

    pub poll_interval_ms: u64,
    pub claim_retry_attempts: u32,
    pub claim_retry_delay_ms: u64,

    pub scripts_dir: PathBuf,
    pub script_interpreter: String,
    pub script_suffix: String,
    pub script_registry_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub input_dir: PathBuf,
    pub data_dir: PathBuf,
    pub subjects: Vec<SubjectConfig>,
    pub baseline_branch: String,

    pub results_repo: String,
    pub github_api_url: String,
    pub github_app_id: Option<String>,
    pub github_installation_id: Option<String>,
    pub github_key_path: PathBuf,
    pub bot_name: String,
    pub bot_email: String,
    pub comment_output_limit: usize,
}

/// A content repository scripts can be pointed at, e.g. `phy`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectConfig {
    pub name: String,
    pub checkout_path: PathBuf,
    pub remote_repo: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("DISPATCH_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let admin_addr = env_or_fallback("DISPATCH_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let api_token = env_or_fallback("DISPATCH_API_TOKEN", "API_TOKEN");

        let migrate_on_startup = env_bool("DISPATCH_MIGRATE_ON_STARTUP").unwrap_or(false);

        let poll_interval_ms = env_parse("DISPATCH_POLL_INTERVAL_MS", "NO_JOB_SLEEP_MS", 5_000);
        let claim_retry_attempts = env_parse("DISPATCH_CLAIM_RETRIES", "GET_NEXT_JOB_RETRIES", 10);
        let claim_retry_delay_ms =
            env_parse("DISPATCH_CLAIM_RETRY_DELAY_MS", "GET_NEXT_JOB_RETRY_DELAY_MS", 1_000);

        let data_dir = env_path("DISPATCH_DATA_DIR", "DATA_PATH", "./data");
        let scripts_dir = env_path("DISPATCH_SCRIPTS_DIR", "SCRIPTS_PATH", "./data/isaac-scripts");
        let script_interpreter = env_or_fallback("DISPATCH_SCRIPT_INTERPRETER", "SCRIPT_INTERPRETER")
            .unwrap_or_else(|| "python3".to_string());
        let script_suffix = env_or_fallback("DISPATCH_SCRIPT_SUFFIX", "SCRIPT_SUFFIX")
            .unwrap_or_else(|| "_script.py".to_string());
        let script_registry_path =
            env_or_fallback("DISPATCH_SCRIPT_REGISTRY", "SCRIPT_REGISTRY").map(PathBuf::from);
        let output_dir = env_path("DISPATCH_OUTPUT_DIR", "OUTPUT_PATH", "./output");
        let input_dir = env_path("DISPATCH_INPUT_DIR", "INPUT_PATH", "./input");

        let subjects = match env_or_fallback("DISPATCH_SUBJECTS", "SUBJECTS") {
            Some(raw) => parse_subjects(&raw)?,
            None => default_subjects(&data_dir),
        };

        let baseline_branch = env_or_fallback("DISPATCH_BASELINE_BRANCH", "BASELINE_BRANCH")
            .unwrap_or_else(|| "master".to_string());

        let results_repo = env_or_fallback("DISPATCH_RESULTS_REPO", "REPO_PATH")
            .unwrap_or_else(|| "isaacphysics/isaac-dispatched-scripts".to_string());
        let github_api_url = env_or_fallback("DISPATCH_GITHUB_API_URL", "GITHUB_API_URL")
            .unwrap_or_else(|| "https://api.github.com".to_string());
        let github_app_id = env_or_fallback("DISPATCH_GITHUB_APP_ID", "GITHUB_APP_IDENTIFIER");
        let github_installation_id =
            env_or_fallback("DISPATCH_GITHUB_INSTALLATION_ID", "GITHUB_INSTALLATION_ID");
        let github_key_path = env_path("DISPATCH_GITHUB_KEY_PATH", "KEY_PATH", "./key.pem");

        let bot_name = env_or_fallback("DISPATCH_BOT_NAME", "BOT_USERNAME")
            .unwrap_or_else(|| "isaac-script-dispatcher[bot]".to_string());
        let bot_email = env_or_fallback("DISPATCH_BOT_EMAIL", "BOT_EMAIL").unwrap_or_else(|| {
            "129531963+isaac-script-dispatcher[bot]@users.noreply.github.com".to_string()
        });

        let comment_output_limit =
            env_parse("DISPATCH_COMMENT_OUTPUT_LIMIT", "COMMENT_OUTPUT_LIMIT", 60_000);

        Ok(Self {
            database_url,
            worker_id,
            admin_addr,
            api_token,
            migrate_on_startup,
            poll_interval_ms,
            claim_retry_attempts,
            claim_retry_delay_ms,
            scripts_dir,
            script_interpreter,
            script_suffix,
            script_registry_path,
            output_dir,
            input_dir,
            data_dir,
            subjects,
            baseline_branch,
            results_repo,
            github_api_url,
            github_app_id,
            github_installation_id,
            github_key_path,
            bot_name,
            bot_email,
            comment_output_limit,
        })
    }

    pub fn contention_policy(&self) -> ContentionPolicy {
        ContentionPolicy {
            max_attempts: self.claim_retry_attempts.max(1),
            delay: Duration::from_millis(self.claim_retry_delay_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }
}

pub fn default_subjects(data_dir: &std::path::Path) -> Vec<SubjectConfig> {
    vec![
        SubjectConfig {
            name: "phy".to_string(),
            checkout_path: data_dir.join("rutherford-content"),
            remote_repo: "isaacphysics/rutherford-content".to_string(),
        },
        SubjectConfig {
            name: "ada".to_string(),
            checkout_path: data_dir.join("ada-content"),
            remote_repo: "isaacphysics/ada-content".to_string(),
        },
    ]
}

/// Parses `name=checkout_path@owner/repo` entries separated by `;`.
pub fn parse_subjects(raw: &str) -> anyhow::Result<Vec<SubjectConfig>> {
    let mut subjects = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, rest) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("subject entry `{entry}` is missing `=`"))?;
        let (path, repo) = rest
            .rsplit_once('@')
            .ok_or_else(|| anyhow::anyhow!("subject entry `{entry}` is missing `@owner/repo`"))?;
        if name.trim().is_empty() || path.trim().is_empty() || !repo.contains('/') {
            anyhow::bail!("subject entry `{entry}` is malformed");
        }
        subjects.push(SubjectConfig {
            name: name.trim().to_string(),
            checkout_path: PathBuf::from(path.trim()),
            remote_repo: repo.trim().to_string(),
        });
    }
    if subjects.is_empty() {
        anyhow::bail!("DISPATCH_SUBJECTS is set but names no subjects");
    }
    Ok(subjects)
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str, default: T) -> T {
    env_or_fallback(primary, fallback)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(primary: &str, fallback: &str, default: &str) -> PathBuf {
    env_or_fallback(primary, fallback)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
