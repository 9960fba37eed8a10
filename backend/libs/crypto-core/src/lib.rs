//! Token signing and hashing primitives shared by identity services.

pub mod hash;
pub mod jwt;

pub use jwt::{
    JwtTokenMaker, TokenError, TokenMaker, TokenPair, TokenPayload, TokenResult,
    MIN_SECRET_KEY_SIZE,
};
