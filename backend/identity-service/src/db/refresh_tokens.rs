/// Refresh token store
use crate::error::{IdentityError, Result};
use crate::models::RefreshToken;
use async_trait::async_trait;
use crypto_core::hash::sha256_hex;
use db_pool::{PgTx, Scope};
use sqlx::PgPool;
use transactional_outbox::now_millis;
use uuid::Uuid;

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    type Tx: Send;

    /// Persist an already built record.
    async fn insert(&self, scope: Scope<'_, Self::Tx>, token: &RefreshToken) -> Result<()>;

    /// Look a record up by the raw token string.
    ///
    /// # Errors
    ///
    /// `TokenNotFound` when no record matches.
    async fn get_by_token(&self, scope: Scope<'_, Self::Tx>, token: &str) -> Result<RefreshToken>;

    /// Set `is_revoked`. Returns false when the token was already revoked or
    /// does not exist.
    async fn revoke(&self, scope: Scope<'_, Self::Tx>, token: &str) -> Result<bool>;

    /// Revoke every live token of a user. Returns how many were revoked.
    async fn revoke_all_for_user(&self, scope: Scope<'_, Self::Tx>, user_id: Uuid) -> Result<u64>;

    /// Build and persist a record for `token` owned by `user_id`.
    ///
    /// # Errors
    ///
    /// * `InvalidToken` - nil user id or empty token
    /// * `TokenExpired` - `expires_at` (epoch millis) already passed
    async fn create(
        &self,
        scope: Scope<'_, Self::Tx>,
        user_id: Uuid,
        token: &str,
        expires_at: i64,
    ) -> Result<RefreshToken> {
        let record = RefreshToken::new(user_id, token, expires_at)?;
        self.insert(scope, &record).await?;
        Ok(record)
    }
}

/// PostgreSQL-backed [`RefreshTokenRepository`]
#[derive(Clone)]
pub struct PgRefreshTokenRepository {
    pool: PgPool,
}

impl PgRefreshTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenRepository for PgRefreshTokenRepository {
    type Tx = PgTx;

    async fn insert(&self, scope: Scope<'_, PgTx>, token: &RefreshToken) -> Result<()> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (
                id, user_id, token_hash, expires_at, is_revoked, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.is_revoked)
        .bind(token.created_at)
        .bind(token.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn get_by_token(&self, scope: Scope<'_, PgTx>, token: &str) -> Result<RefreshToken> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;

        sqlx::query_as::<_, RefreshToken>(
            r#"
            SELECT id, user_id, token_hash, expires_at, is_revoked, created_at, updated_at
            FROM refresh_tokens
            WHERE token_hash = $1
            "#,
        )
        .bind(sha256_hex(token))
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(IdentityError::TokenNotFound)
    }

    async fn revoke(&self, scope: Scope<'_, PgTx>, token: &str) -> Result<bool> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;

        // Never clears the flag: only unrevoked rows match
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, updated_at = $2
            WHERE token_hash = $1 AND is_revoked = FALSE
            "#,
        )
        .bind(sha256_hex(token))
        .bind(now_millis())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_for_user(&self, scope: Scope<'_, PgTx>, user_id: Uuid) -> Result<u64> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;

        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, updated_at = $2
            WHERE user_id = $1 AND is_revoked = FALSE
            "#,
        )
        .bind(user_id)
        .bind(now_millis())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }
}
