use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use crate::remote::{AppTokenProvider, RemoteError, RemoteSurface};

pub enum TokenSource {
    App(AppTokenProvider),
    /// Personal access token; handy against a sandbox repository.
    Static(String),
}

#[derive(Debug, Clone)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

/// GitHub REST implementation of [`RemoteSurface`].
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    results_repo: String,
    baseline_branch: String,
    committer: Committer,
    tokens: TokenSource,
}

#[derive(Debug, Deserialize)]
struct HtmlUrl {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: HtmlUrl,
}

impl GithubClient {
    pub fn new(
        http: reqwest::Client,
        api_url: impl Into<String>,
        results_repo: impl Into<String>,
        baseline_branch: impl Into<String>,
        committer: Committer,
        tokens: TokenSource,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            results_repo: results_repo.into(),
            baseline_branch: baseline_branch.into(),
            committer,
            tokens,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.api_url).map_err(|e| RemoteError::Malformed {
            operation: "building request",
            detail: format!("bad api url {}: {e}", self.api_url),
        })?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Malformed {
                operation: "building request",
                detail: format!("api url {} cannot be a base", self.api_url),
            })?
            .pop_if_empty()
            .extend(segments.iter().flat_map(|s| s.split('/')));
        Ok(url)
    }

    async fn authed(&self, method: Method, url: Url) -> Result<RequestBuilder, RemoteError> {
        let token = self.access_token().await?;
        Ok(self
            .http
            .request(method, url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", self.committer.name.as_str()))
    }
}

async fn expect_status(
    operation: &'static str,
    request: RequestBuilder,
    accepted: &[u16],
) -> Result<Response, RemoteError> {
    let response = request
        .send()
        .await
        .map_err(|source| RemoteError::Transport { operation, source })?;

    let status = response.status().as_u16();
    if accepted.contains(&status) {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        operation,
        status,
        body,
    })
}

#[async_trait]
impl RemoteSurface for GithubClient {
    async fn access_token(&self) -> Result<String, RemoteError> {
        match &self.tokens {
            TokenSource::App(provider) => provider.token().await,
            TokenSource::Static(token) => Ok(token.clone()),
        }
    }

    async fn add_reaction(&self, issue_number: i64, reaction: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&[
            "repos",
            &self.results_repo,
            "issues",
            &issue_number.to_string(),
            "reactions",
        ])?;
        let request = self
            .authed(Method::POST, url)
            .await?
            .json(&json!({ "content": reaction }));
        // 200 means the reaction was already there
        expect_status("add reaction", request, &[200, 201]).await?;
        Ok(())
    }

    async fn add_comment(&self, issue_number: i64, body: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&[
            "repos",
            &self.results_repo,
            "issues",
            &issue_number.to_string(),
            "comments",
        ])?;
        let request = self
            .authed(Method::POST, url)
            .await?
            .json(&json!({ "body": body }));
        expect_status("add comment", request, &[201]).await?;
        Ok(())
    }

    async fn upload_artifact(
        &self,
        job_id: Uuid,
        local: &Path,
        destination: &str,
    ) -> Result<String, RemoteError> {
        const OP: &str = "upload artifact";

        let bytes = tokio::fs::read(local)
            .await
            .map_err(|source| RemoteError::Io {
                operation: OP,
                source,
            })?;
        let url = self.endpoint(&["repos", &self.results_repo, "contents", "outputs", destination])?;
        let request = self.authed(Method::PUT, url).await?.json(&json!({
            "message": format!("Output files for job {job_id}"),
            "content": STANDARD.encode(bytes),
            "branch": self.baseline_branch,
            "committer": {
                "name": self.committer.name,
                "email": self.committer.email,
            },
        }));

        let response = expect_status(OP, request, &[201]).await?;
        let body: ContentsResponse = response.json().await.map_err(|e| RemoteError::Malformed {
            operation: OP,
            detail: e.to_string(),
        })?;
        Ok(body.content.html_url)
    }

    async fn open_change_request(
        &self,
        repo: &str,
        branch: &str,
        issue_number: i64,
    ) -> Result<String, RemoteError> {
        const OP: &str = "open pull request";

        let url = self.endpoint(&["repos", repo, "pulls"])?;
        let request = self.authed(Method::POST, url).await?.json(&json!({
            "title": format!("[Script] Output for issue {issue_number}"),
            "head": branch,
            "base": self.baseline_branch,
            "body": format!(
                "This pull request was automatically generated.\n\n\
                 These changes were requested in the issue: https://github.com/{}/issues/{issue_number}\n\n\
                 `Job id: {branch}`",
                self.results_repo
            ),
        }));

        let response = expect_status(OP, request, &[201]).await?;
        let body: HtmlUrl = response.json().await.map_err(|e| RemoteError::Malformed {
            operation: OP,
            detail: e.to_string(),
        })?;
        Ok(body.html_url)
    }

    async fn download_file(&self, url: &Url, dest: &Path) -> Result<(), RemoteError> {
        const OP: &str = "download file";

        let response = expect_status(OP, self.http.get(url.clone()), &[200]).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|source| RemoteError::Transport {
                operation: OP,
                source,
            })?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|source| RemoteError::Io {
                operation: OP,
                source,
            })
    }
}
