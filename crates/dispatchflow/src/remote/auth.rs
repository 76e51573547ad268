use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::jobs::{CachedToken, TokenRepo};
use crate::remote::RemoteError;

/// Tokens expiring sooner than this are replaced before use.
pub const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Hands out GitHub App installation tokens, cached in the `app_token` row.
pub struct AppTokenProvider {
    tokens: TokenRepo,
    http: reqwest::Client,
    api_url: String,
    app_id: String,
    installation_id: String,
    key_path: PathBuf,
    refresh_lock: Mutex<()>,
}

impl AppTokenProvider {
    pub fn new(
        tokens: TokenRepo,
        http: reqwest::Client,
        api_url: impl Into<String>,
        app_id: impl Into<String>,
        installation_id: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tokens,
            http,
            api_url: api_url.into(),
            app_id: app_id.into(),
            installation_id: installation_id.into(),
            key_path: key_path.into(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub async fn token(&self) -> Result<String, RemoteError> {
        let _guard = self.refresh_lock.lock().await;
        let now = Utc::now();

        let cached = self
            .tokens
            .get()
            .await
            .map_err(|e| RemoteError::Auth(format!("reading cached token: {e}")))?;
        if let Some(cached) = cached {
            if !cached.expires_within(Duration::seconds(REFRESH_MARGIN_SECS), now) {
                return Ok(cached.token);
            }
        }

        tracing::info!("installation token missing or expiring, requesting a new one");
        let fresh = self.request_installation_token().await?;
        let cached = CachedToken {
            token: fresh.token,
            created_at: now,
            expires_at: fresh.expires_at,
        };
        self.tokens
            .save(&cached)
            .await
            .map_err(|e| RemoteError::Auth(format!("caching token: {e}")))?;
        Ok(cached.token)
    }

    async fn request_installation_token(&self) -> Result<InstallationToken, RemoteError> {
        const OP: &str = "installation token";

        let jwt = self.app_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url.trim_end_matches('/'),
            self.installation_id
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|source| RemoteError::Transport {
                operation: OP,
                source,
            })?;

        let status = response.status();
        if status.as_u16() != 201 {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                operation: OP,
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<InstallationToken>()
            .await
            .map_err(|e| RemoteError::Malformed {
                operation: OP,
                detail: e.to_string(),
            })
    }

    fn app_jwt(&self) -> Result<String, RemoteError> {
        let pem = std::fs::read(&self.key_path).map_err(|source| RemoteError::Io {
            operation: "reading app private key",
            source,
        })?;
        let key = EncodingKey::from_rsa_pem(&pem)
            .map_err(|e| RemoteError::Auth(format!("invalid app private key: {e}")))?;
        app_jwt_with(&key, &self.app_id, Utc::now())
    }
}

fn app_jwt_with(key: &EncodingKey, app_id: &str, now: DateTime<Utc>) -> Result<String, RemoteError> {
    // backdated a minute for clock drift; GitHub caps lifetime at ten minutes
    let claims = AppClaims {
        iat: (now - Duration::seconds(60)).timestamp(),
        exp: (now + Duration::seconds(540)).timestamp(),
        iss: app_id.to_string(),
    };
    encode(&Header::new(Algorithm::RS256), &claims, key)
        .map_err(|e| RemoteError::Auth(format!("signing app JWT: {e}")))
}
