use crate::error::{IdentityError, Result};
use crypto_core::hash::sha256_hex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use transactional_outbox::now_millis;
use uuid::Uuid;

/// A persisted refresh credential.
///
/// Only the SHA-256 digest of the token string is stored. Once `is_revoked`
/// is set the record is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    /// Epoch milliseconds
    pub expires_at: i64,
    pub is_revoked: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RefreshToken {
    /// New record for `token`, valid until `expires_at` (epoch millis).
    ///
    /// # Errors
    ///
    /// * `InvalidToken` - nil user id or empty token
    /// * `TokenExpired` - `expires_at` is not in the future
    pub fn new(user_id: Uuid, token: &str, expires_at: i64) -> Result<Self> {
        if user_id.is_nil() || token.is_empty() {
            return Err(IdentityError::InvalidToken);
        }

        let now = now_millis();
        if expires_at <= now {
            return Err(IdentityError::TokenExpired);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            token_hash: sha256_hex(token),
            expires_at,
            is_revoked: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Validity at `now` (epoch millis). Checks run in a fixed order so the
    /// reported error is deterministic: identity, token, revocation, expiry.
    pub fn validate(&self, now: i64) -> Result<()> {
        if self.id.is_nil() || self.user_id.is_nil() {
            return Err(IdentityError::InvalidToken);
        }
        if self.token_hash.is_empty() {
            return Err(IdentityError::InvalidToken);
        }
        if self.is_revoked {
            return Err(IdentityError::TokenRevoked);
        }
        if self.expires_at <= now {
            return Err(IdentityError::TokenExpired);
        }
        Ok(())
    }

    pub fn matches(&self, token: &str) -> bool {
        self.token_hash == sha256_hex(token)
    }
}
