use crate::error::{IdentityError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Input validation for identity requests.
///
/// Every check runs before storage is touched.

// These patterns are hardcoded and always valid, so we use expect() with explicit reasoning
static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-]{3,30}$")
        .expect("hardcoded username regex is invalid - fix source code")
});

static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| {
    // E.164
    Regex::new(r"^\+[1-9]\d{1,14}$").expect("hardcoded phone regex is invalid - fix source code")
});

const PASSWORD_MIN_LEN: usize = 8;
const PASSWORD_MAX_LEN: usize = 32;

/// Validate email shape: one `@` with a non-empty local part and a dotted domain.
pub fn validate_email(email: &str) -> Result<()> {
    let invalid = |reason: &str| Err(IdentityError::InvalidEmail(reason.to_string()));

    if email.len() < 5 || email.len() > 254 {
        return invalid("length must be between 5 and 254 characters");
    }
    if email.matches('@').count() != 1 {
        return invalid("must contain exactly one '@'");
    }
    let Some((local, domain)) = email.split_once('@') else {
        return invalid("must contain exactly one '@'");
    };
    if local.is_empty() || domain.is_empty() {
        return invalid("'@' must not be at the start or end");
    }
    if domain.len() < 2 || domain.len() > 253 || !domain.contains('.') {
        return invalid("domain is malformed");
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return invalid("domain is malformed");
    }
    Ok(())
}

/// Validate username: 3-30 chars of letters, digits, `_` and `-`; no leading,
/// trailing or doubled separators.
pub fn validate_username(username: &str) -> Result<()> {
    let invalid = |reason: &str| Err(IdentityError::InvalidUsername(reason.to_string()));

    if !USERNAME_REGEX.is_match(username) {
        return invalid("must be 3-30 letters, digits, '_' or '-'");
    }
    if username.starts_with(['_', '-']) || username.ends_with(['_', '-']) {
        return invalid("must not start or end with '_' or '-'");
    }
    if username.contains("__") || username.contains("--") {
        return invalid("must not contain consecutive '_' or '-'");
    }
    Ok(())
}

/// Validate password complexity
/// - 8 to 32 characters
/// - At least three of: uppercase, lowercase, digit, special character
pub fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if !(PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN).contains(&len) {
        return Err(IdentityError::InvalidPassword(format!(
            "length must be between {} and {} characters",
            PASSWORD_MIN_LEN, PASSWORD_MAX_LEN
        )));
    }

    let classes = [
        password.chars().any(|c| c.is_ascii_uppercase()),
        password.chars().any(|c| c.is_ascii_lowercase()),
        password.chars().any(|c| c.is_ascii_digit()),
        password.chars().any(|c| !c.is_alphanumeric()),
    ];

    if classes.iter().filter(|present| **present).count() < 3 {
        return Err(IdentityError::InvalidPassword(
            "must contain at least three of uppercase, lowercase, digit and special characters"
                .to_string(),
        ));
    }
    Ok(())
}

/// Validate an E.164 phone number (`+` followed by 9-14 digits).
pub fn validate_phone_number(phone: &str) -> Result<()> {
    if phone.len() < 10 || phone.len() > 15 || !PHONE_REGEX.is_match(phone) {
        return Err(IdentityError::InvalidPhoneNumber(
            "must be in E.164 format".to_string(),
        ));
    }
    Ok(())
}

/// Validate a two-letter country code.
pub fn validate_country_code(code: &str) -> Result<()> {
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(IdentityError::InvalidCountryCode(
            "must be two letters".to_string(),
        ));
    }
    Ok(())
}
