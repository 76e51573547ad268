use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

/// The single cached credential row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CachedToken {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// True when the token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at < now + margin
    }
}

#[derive(Clone)]
pub struct TokenRepo {
    pool: PgPool,
}

impl TokenRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self) -> anyhow::Result<Option<CachedToken>> {
        let token = sqlx::query_as::<_, CachedToken>(
            "SELECT token, created_at, expires_at FROM app_token ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    /// Replaces whatever is cached with `token`.
    pub async fn save(&self, token: &CachedToken) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM app_token")
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO app_token (token, created_at, expires_at) VALUES ($1, $2, $3)")
            .bind(&token.token)
            .bind(token.created_at)
            .bind(token.expires_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
