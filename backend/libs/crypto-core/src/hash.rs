use sha2::{Digest, Sha256};

/// Compute SHA256 hash of input bytes
pub fn sha256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// Lowercase hex SHA256 digest of a token string.
///
/// Refresh tokens are stored and looked up by this digest so the raw bearer
/// value never reaches the database.
pub fn sha256_hex(token: &str) -> String {
    hex::encode(sha256(token.as_bytes()))
}
