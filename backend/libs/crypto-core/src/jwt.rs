/// Symmetric JWT codec for identity tokens
///
/// Access and refresh tokens share one payload shape and one signing path
/// (HS256 with a shared secret). Only their lifetime and persistence differ:
/// refresh tokens are additionally stored by the identity service.
///
/// ## Usage
///
/// ```rust
/// use crypto_core::jwt::{JwtTokenMaker, TokenMaker};
///
/// let maker = JwtTokenMaker::new("0123456789abcdef0123456789abcdef");
/// let pair = maker
///     .create_token_pair("8a7a2c9e-7f44-4b8e-9a55-1e0d4c2f3b10", "alice", 900)
///     .expect("token pair");
///
/// let payload = maker.verify_token(&pair.access_token).expect("valid token");
/// assert_eq!(payload.username, "alice");
/// ```
use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Minimum accepted length of the shared signing secret, in bytes.
pub const MIN_SECRET_KEY_SIZE: usize = 32;

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is invalid")]
    Invalid,

    #[error("token has expired")]
    Expired,

    #[error("secret key must be at least {MIN_SECRET_KEY_SIZE} bytes")]
    SecretTooShort,

    #[error("failed to sign token: {0}")]
    Signing(String),
}

pub type TokenResult<T> = Result<T, TokenError>;

// ============================================================================
// Data Structures
// ============================================================================

/// Claims carried by every token this codec issues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Random token id
    #[serde(rename = "jti")]
    pub id: Uuid,
    /// Subject id (user id)
    #[serde(rename = "sub")]
    pub user_id: String,
    /// Subject name
    pub username: String,
    /// Issued at (Unix timestamp, seconds)
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// Expiration time (Unix timestamp, seconds)
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

impl TokenPayload {
    pub fn new(user_id: &str, username: &str, ttl_seconds: i64) -> Self {
        let issued_at = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            issued_at,
            expires_at: issued_at.saturating_add(ttl_seconds),
        }
    }

    pub fn is_expired_at(&self, now_seconds: i64) -> bool {
        now_seconds > self.expires_at
    }

    /// Expiry first, then the required claims.
    pub fn validate(&self) -> TokenResult<()> {
        if self.is_expired_at(Utc::now().timestamp()) {
            return Err(TokenError::Expired);
        }
        if self.id.is_nil() || self.user_id.is_empty() || self.username.is_empty() {
            return Err(TokenError::Invalid);
        }
        Ok(())
    }
}

/// Freshly issued access + refresh tokens
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub access_payload: TokenPayload,
    pub refresh_token: String,
    pub refresh_payload: TokenPayload,
}

// ============================================================================
// Token Maker
// ============================================================================

/// Issues and verifies signed tokens.
pub trait TokenMaker: Send + Sync {
    /// Sign a new token for the subject that expires `ttl_seconds` from now.
    fn create_token(
        &self,
        user_id: &str,
        username: &str,
        ttl_seconds: i64,
    ) -> TokenResult<(String, TokenPayload)>;

    /// Decode and validate a token.
    ///
    /// Fails with [`TokenError::Expired`] once `now > exp` and with
    /// [`TokenError::Invalid`] for anything else that is wrong with it.
    fn verify_token(&self, token: &str) -> TokenResult<TokenPayload>;

    fn create_access_token(
        &self,
        user_id: &str,
        username: &str,
        ttl_seconds: i64,
    ) -> TokenResult<(String, TokenPayload)> {
        self.create_token(user_id, username, ttl_seconds)
    }

    fn create_refresh_token(
        &self,
        user_id: &str,
        username: &str,
        ttl_seconds: i64,
    ) -> TokenResult<(String, TokenPayload)> {
        self.create_token(user_id, username, ttl_seconds)
    }

    /// Both tokens of a pair carry the same ttl; the stored refresh record
    /// owns the longer lifetime.
    fn create_token_pair(
        &self,
        user_id: &str,
        username: &str,
        ttl_seconds: i64,
    ) -> TokenResult<TokenPair> {
        let (access_token, access_payload) =
            self.create_access_token(user_id, username, ttl_seconds)?;
        let (refresh_token, refresh_payload) =
            self.create_refresh_token(user_id, username, ttl_seconds)?;

        Ok(TokenPair {
            access_token,
            access_payload,
            refresh_token,
            refresh_payload,
        })
    }
}

/// HS256 implementation of [`TokenMaker`]
#[derive(Clone)]
pub struct JwtTokenMaker {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for JwtTokenMaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenMaker")
            .field("algorithm", &JWT_ALGORITHM)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl JwtTokenMaker {
    /// Build a maker from the shared secret.
    ///
    /// # Panics
    ///
    /// Panics if `secret` is shorter than [`MIN_SECRET_KEY_SIZE`] bytes. A short
    /// secret is a startup misconfiguration; use [`JwtTokenMaker::try_new`] to
    /// handle it as an error instead.
    pub fn new(secret: &str) -> Self {
        assert!(
            secret.len() >= MIN_SECRET_KEY_SIZE,
            "JWT secret key must be at least {MIN_SECRET_KEY_SIZE} bytes"
        );
        Self::from_secret(secret.as_bytes())
    }

    pub fn try_new(secret: &str) -> TokenResult<Self> {
        if secret.len() < MIN_SECRET_KEY_SIZE {
            return Err(TokenError::SecretTooShort);
        }
        Ok(Self::from_secret(secret.as_bytes()))
    }

    fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation
    }
}

impl TokenMaker for JwtTokenMaker {
    fn create_token(
        &self,
        user_id: &str,
        username: &str,
        ttl_seconds: i64,
    ) -> TokenResult<(String, TokenPayload)> {
        let payload = TokenPayload::new(user_id, username, ttl_seconds);
        let token = encode(&Header::new(JWT_ALGORITHM), &payload, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        Ok((token, payload))
    }

    fn verify_token(&self, token: &str) -> TokenResult<TokenPayload> {
        let data = decode::<TokenPayload>(token, &self.decoding_key, &Self::validation())
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                other => {
                    debug!(reason = ?other, "Token rejected");
                    TokenError::Invalid
                }
            })?;

        data.claims.validate()?;
        Ok(data.claims)
    }
}

// ============================================================================
// Tests
// ============================================================================
