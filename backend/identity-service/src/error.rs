use crypto_core::TokenError;
use thiserror::Error;
use tonic::{Code, Status};
use transactional_outbox::OutboxError;

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Coarse classification a transport layer maps to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    AlreadyExists,
    NotFound,
    TokenInvalid,
    TokenExpired,
    TokenRevoked,
    InvalidCredentials,
    Internal,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Invalid password: {0}")]
    InvalidPassword(String),

    #[error("Invalid phone number: {0}")]
    InvalidPhoneNumber(String),

    #[error("Invalid country code: {0}")]
    InvalidCountryCode(String),

    #[error("Email or phone number is required")]
    EmailOrPhoneRequired,

    #[error("Token is required")]
    TokenRequired,

    #[error("User already exists")]
    UserAlreadyExists,

    #[error("User not found")]
    UserNotFound,

    #[error("Token not found")]
    TokenNotFound,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Outbox error: {0}")]
    Outbox(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::InvalidEmail(_)
            | IdentityError::InvalidUsername(_)
            | IdentityError::InvalidPassword(_)
            | IdentityError::InvalidPhoneNumber(_)
            | IdentityError::InvalidCountryCode(_)
            | IdentityError::EmailOrPhoneRequired
            | IdentityError::TokenRequired => ErrorKind::InvalidInput,
            IdentityError::UserAlreadyExists => ErrorKind::AlreadyExists,
            IdentityError::UserNotFound | IdentityError::TokenNotFound => ErrorKind::NotFound,
            IdentityError::InvalidToken => ErrorKind::TokenInvalid,
            IdentityError::TokenExpired => ErrorKind::TokenExpired,
            IdentityError::TokenRevoked => ErrorKind::TokenRevoked,
            IdentityError::InvalidCredentials => ErrorKind::InvalidCredentials,
            IdentityError::Database(_) | IdentityError::Outbox(_) | IdentityError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Convert to gRPC Status for wire protocol
    pub fn to_status(&self) -> Status {
        match self.kind() {
            ErrorKind::InvalidInput => Status::new(Code::InvalidArgument, self.to_string()),
            ErrorKind::AlreadyExists => Status::new(Code::AlreadyExists, self.to_string()),
            ErrorKind::NotFound => Status::new(Code::NotFound, self.to_string()),
            ErrorKind::TokenInvalid | ErrorKind::TokenExpired | ErrorKind::TokenRevoked => {
                Status::new(Code::Unauthenticated, self.to_string())
            }
            ErrorKind::InvalidCredentials => {
                Status::new(Code::Unauthenticated, "Invalid credentials")
            }
            // Don't leak internal details
            ErrorKind::Internal => Status::new(Code::Internal, "Internal server error"),
        }
    }
}

/// Unique indexes of the `users` table.
const USER_UNIQUE_CONSTRAINTS: &[&str] = &[
    "users_pkey",
    "idx_users_email",
    "idx_users_username",
    "idx_users_phone",
];

/// SQLSTATE 23505 raised by one of the `users` unique indexes.
fn is_user_conflict(code: Option<&str>, constraint: Option<&str>) -> bool {
    code == Some("23505") && constraint.is_some_and(|c| USER_UNIQUE_CONSTRAINTS.contains(&c))
}

// Conversions from external error types
impl From<sqlx::Error> for IdentityError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if is_user_conflict(db_err.code().as_deref(), db_err.constraint()) {
                tracing::debug!("Unique violation: {}", db_err);
                return IdentityError::UserAlreadyExists;
            }
        }
        tracing::error!("Database error: {}", err);
        IdentityError::Database(err.to_string())
    }
}

impl From<TokenError> for IdentityError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => IdentityError::TokenExpired,
            TokenError::Invalid => IdentityError::InvalidToken,
            TokenError::SecretTooShort | TokenError::Signing(_) => {
                tracing::error!("Token codec error: {}", err);
                IdentityError::Internal(err.to_string())
            }
        }
    }
}

impl From<OutboxError> for IdentityError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::DatabaseError(db_err) => db_err.into(),
            other => {
                tracing::error!("Outbox error: {}", other);
                IdentityError::Outbox(other.to_string())
            }
        }
    }
}

// gRPC Status conversion
impl From<IdentityError> for Status {
    fn from(err: IdentityError) -> Self {
        err.to_status()
    }
}
