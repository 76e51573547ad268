use std::path::{Path, PathBuf};

use url::Url;
use uuid::Uuid;

use crate::remote::{RemoteError, RemoteSurface};
use crate::scripts::{ArgKind, ArgSpec};

const ALLOWED_FILE_HOST: &str = "docs.google.com";

#[derive(Debug, thiserror::Error)]
pub enum ArgumentError {
    #[error("Expected {expected} arguments but the job has {supplied}")]
    Count { expected: usize, supplied: usize },

    #[error("Argument `{param}` is not a valid URL: {value}")]
    NotAUrl { param: String, value: String },

    #[error("URL is not a Google Docs URL: {0}")]
    DisallowedHost(String),

    #[error("The Google Docs URL is not a CSV export, or doesn't have `single` set to `true`: {0}")]
    NotTabularExport(String),

    #[error("Failed to download `{param}`: {source}")]
    Download {
        param: String,
        #[source]
        source: RemoteError,
    },

    #[error("Failed to prepare {}: {source}", path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Job-scoped directory for downloaded argument files. Removed when dropped.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(input_dir: &Path, job_id: Uuid) -> Self {
        Self {
            path: input_dir.join(job_id.to_string()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "could not remove scratch dir")
            }
        }
    }
}

/// Only published, single-sheet CSV exports are accepted.
pub fn validate_file_url(param: &str, raw: &str) -> Result<Url, ArgumentError> {
    let url = Url::parse(raw).map_err(|_| ArgumentError::NotAUrl {
        param: param.to_string(),
        value: raw.to_string(),
    })?;

    if url.scheme() != "https" || url.host_str() != Some(ALLOWED_FILE_HOST) {
        return Err(ArgumentError::DisallowedHost(raw.to_string()));
    }

    let mut single = false;
    let mut csv = false;
    for (key, value) in url.query_pairs() {
        match (key.as_ref(), value.as_ref()) {
            ("single", "true") => single = true,
            ("output", "csv") => csv = true,
            _ => {}
        }
    }
    if !(single && csv) {
        return Err(ArgumentError::NotTabularExport(raw.to_string()));
    }
    Ok(url)
}

/// Turns the raw replies into `--param value` pairs, downloading file
/// arguments into `scratch` and passing their local path instead.
pub async fn materialize_arguments(
    remote: &dyn RemoteSurface,
    scratch: &ScratchDir,
    specs: &[ArgSpec],
    raw_values: &[String],
) -> Result<Vec<String>, ArgumentError> {
    if specs.len() != raw_values.len() {
        return Err(ArgumentError::Count {
            expected: specs.len(),
            supplied: raw_values.len(),
        });
    }

    let mut flat = Vec::with_capacity(specs.len() * 2);
    for (spec, raw) in specs.iter().zip(raw_values) {
        flat.push(format!("--{}", spec.param));
        match &spec.kind {
            ArgKind::Text => flat.push(raw.clone()),
            ArgKind::File { file_type } => {
                let url = validate_file_url(&spec.param, raw)?;
                tokio::fs::create_dir_all(scratch.path())
                    .await
                    .map_err(|source| ArgumentError::Scratch {
                        path: scratch.path().to_path_buf(),
                        source,
                    })?;
                let dest = scratch.path().join(format!("{}.{}", spec.param, file_type));
                remote
                    .download_file(&url, &dest)
                    .await
                    .map_err(|source| ArgumentError::Download {
                        param: spec.param.clone(),
                        source,
                    })?;
                flat.push(dest.to_string_lossy().into_owned());
            }
        }
    }
    Ok(flat)
}
