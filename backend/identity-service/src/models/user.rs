use crate::error::{IdentityError, Result};
use crate::security::hash_password;
use crate::validators;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use transactional_outbox::now_millis;
use uuid::Uuid;

/// User model - core identity entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub country_code: Option<String>,
    pub phone_number: Option<String>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Epoch milliseconds
    pub created_at: i64,
    /// Epoch milliseconds
    pub updated_at: i64,
}

impl User {
    /// Build a new user from a registration request: validates every field
    /// and hashes the password.
    pub fn register(req: &RegisterRequest) -> Result<Self> {
        req.validate()?;
        let password_hash = hash_password(&req.password)?;
        let now = now_millis();

        Ok(Self {
            id: Uuid::new_v4(),
            email: non_empty(&req.email),
            country_code: non_empty(&req.country_code),
            phone_number: non_empty(&req.phone_number),
            username: req.username.clone(),
            password_hash,
            created_at: now,
            updated_at: now,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}

/// User registration request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub country_code: Option<String>,
    pub phone_number: Option<String>,
}

impl RegisterRequest {
    /// Either an email or a complete phone (country code + number) is required.
    pub fn validate(&self) -> Result<()> {
        let email = non_empty(&self.email);
        let country_code = non_empty(&self.country_code);
        let phone_number = non_empty(&self.phone_number);

        if email.is_none() && (country_code.is_none() || phone_number.is_none()) {
            return Err(IdentityError::EmailOrPhoneRequired);
        }

        validators::validate_username(&self.username)?;
        validators::validate_password(&self.password)?;
        if let Some(email) = &email {
            validators::validate_email(email)?;
        }
        if let Some(code) = &country_code {
            validators::validate_country_code(code)?;
        }
        if let Some(phone) = &phone_number {
            validators::validate_phone_number(phone)?;
        }
        Ok(())
    }
}

/// How a user identifies at login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginIdentifier {
    Email(String),
    Phone {
        country_code: String,
        phone_number: String,
    },
}

/// User login request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub identifier: LoginIdentifier,
    pub password: String,
}

impl LoginRequest {
    pub fn with_email(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            identifier: LoginIdentifier::Email(email.into()),
            password: password.into(),
        }
    }

    /// Shape checks only; whether the account exists is decided later.
    pub fn validate(&self) -> Result<()> {
        match &self.identifier {
            LoginIdentifier::Email(email) if email.is_empty() => {
                return Err(IdentityError::EmailOrPhoneRequired)
            }
            LoginIdentifier::Email(email) => validators::validate_email(email)?,
            LoginIdentifier::Phone {
                country_code,
                phone_number,
            } => {
                if country_code.is_empty() || phone_number.is_empty() {
                    return Err(IdentityError::EmailOrPhoneRequired);
                }
                validators::validate_country_code(country_code)?;
                validators::validate_phone_number(phone_number)?;
            }
        }
        if self.password.is_empty() {
            return Err(IdentityError::InvalidPassword(
                "password is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Issued credentials returned by register and login
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
}
