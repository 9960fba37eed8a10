/// Identity Service Library
///
/// Registration, login and refresh-token handling with transactional login
/// notifications.
///
/// ## Modules
///
/// - `config`: Service configuration
/// - `db`: User and refresh token repositories, migrations
/// - `error`: Error types and status mapping
/// - `models`: Data models and outbox payloads
/// - `security`: Token codec re-exports, password hashing
/// - `services`: Identity orchestration and the login notification worker
/// - `validators`: Input validation
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod security;
pub mod services;
pub mod validators;

// Re-export commonly used types
pub use error::{ErrorKind, IdentityError, Result};
pub use services::IdentityService;
