/// Security primitives for identity-service
///
/// - **crypto-core::jwt**: HS256 token codec shared with other services
/// - **password**: Argon2id password hashing
pub use crypto_core::jwt::{JwtTokenMaker, TokenMaker, TokenPair, TokenPayload};

pub mod password;

pub use password::{hash_password, verify_password};
