//! Registration, login and token refresh.
//!
//! The only component that combines the token codec, the user and refresh
//! token stores, the outbox and the transaction coordinator. Token issuance is
//! pure and always happens outside of a transaction; a failed transaction just
//! drops the issued pair.

use crate::db::{RefreshTokenRepository, UserRepository};
use crate::error::{IdentityError, Result};
use crate::models::{
    AuthResponse, EventName, LoginIdentifier, LoginNotificationParams, LoginRequest,
    RefreshResponse, RegisterRequest, User,
};
use crate::security::{verify_password, TokenMaker, TokenPair, TokenPayload};
use chrono::Utc;
use db_pool::{Scope, TransactionCoordinator, TransactionManager};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use transactional_outbox::{now_millis, OutboxEvent, OutboxRepository};
use uuid::Uuid;

type Users<Tx> = Arc<dyn UserRepository<Tx = Tx>>;
type RefreshTokens<Tx> = Arc<dyn RefreshTokenRepository<Tx = Tx>>;
type Outbox<Tx> = Arc<dyn OutboxRepository<Tx = Tx>>;

/// Token lifetimes in seconds
#[derive(Debug, Clone, Copy)]
pub struct TokenTtl {
    pub access_secs: i64,
    pub refresh_secs: i64,
}

pub struct IdentityService<M: TransactionManager> {
    coordinator: TransactionCoordinator<M>,
    users: Users<M::Tx>,
    refresh_tokens: RefreshTokens<M::Tx>,
    outbox: Outbox<M::Tx>,
    tokens: Arc<dyn TokenMaker>,
    ttl: TokenTtl,
    span: Span,
}

impl<M: TransactionManager> IdentityService<M> {
    pub fn new(
        coordinator: TransactionCoordinator<M>,
        users: Users<M::Tx>,
        refresh_tokens: RefreshTokens<M::Tx>,
        outbox: Outbox<M::Tx>,
        tokens: Arc<dyn TokenMaker>,
        ttl: TokenTtl,
    ) -> Self {
        let span = info_span!("identity_service");
        info!(
            parent: &span,
            access_token_ttl_secs = ttl.access_secs,
            refresh_token_ttl_secs = ttl.refresh_secs,
            "IdentityService initialized"
        );

        Self {
            coordinator,
            users,
            refresh_tokens,
            outbox,
            tokens,
            ttl,
            span,
        }
    }

    /// Log under the given span instead of the default `identity_service` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn issue_pair(&self, user: &User) -> Result<TokenPair> {
        let pair = self.tokens.create_token_pair(
            &user.id.to_string(),
            &user.username,
            self.ttl.access_secs,
        )?;
        Ok(pair)
    }

    fn refresh_expiry(&self) -> i64 {
        now_millis() + self.ttl.refresh_secs * 1000
    }

    /// Create a user and issue its first token pair.
    ///
    /// The user row and the refresh token row are written in one transaction:
    /// if the refresh token cannot be stored the user does not exist either.
    pub async fn register(&self, req: RegisterRequest) -> Result<AuthResponse> {
        async {
            let user = User::register(&req).map_err(|e| {
                warn!(error = %e, "Registration rejected");
                e
            })?;
            let pair = self.issue_pair(&user)?;
            let expires_at = self.refresh_expiry();

            let users = Arc::clone(&self.users);
            let refresh_tokens = Arc::clone(&self.refresh_tokens);
            let new_user = user.clone();
            let refresh_token = pair.refresh_token.clone();

            self.coordinator
                .with_transaction(move |mut scope| {
                    Box::pin(async move {
                        users.create(scope.reborrow(), &new_user).await?;
                        refresh_tokens
                            .create(scope.reborrow(), new_user.id, &refresh_token, expires_at)
                            .await?;
                        Ok::<_, IdentityError>(())
                    })
                })
                .await?;

            info!(user_id = %user.id, username = %user.username, "User registration completed");

            Ok(AuthResponse {
                user,
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
            })
        }
        .instrument(self.span.clone())
        .await
    }

    /// Authenticate and issue a token pair.
    ///
    /// The refresh token and the `login` outbox event commit together; if the
    /// event cannot be written the login fails.
    pub async fn login(&self, req: LoginRequest) -> Result<AuthResponse> {
        async {
            req.validate()?;
            let user = self.authenticate(&req).await?;
            let pair = self.issue_pair(&user)?;
            let expires_at = self.refresh_expiry();

            let params = LoginNotificationParams::for_user(&user, Utc::now());
            let event = OutboxEvent::new(EventName::Login.as_str(), &params)?;
            let event_id = event.id;

            let refresh_tokens = Arc::clone(&self.refresh_tokens);
            let outbox = Arc::clone(&self.outbox);
            let user_id = user.id;
            let refresh_token = pair.refresh_token.clone();

            self.coordinator
                .with_transaction(move |mut scope| {
                    Box::pin(async move {
                        refresh_tokens
                            .create(scope.reborrow(), user_id, &refresh_token, expires_at)
                            .await?;
                        outbox.insert(scope.reborrow(), &event).await?;
                        Ok::<_, IdentityError>(())
                    })
                })
                .await?;

            info!(user_id = %user.id, event_id = %event_id, "User login completed");

            Ok(AuthResponse {
                user,
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
            })
        }
        .instrument(self.span.clone())
        .await
    }

    async fn authenticate(&self, req: &LoginRequest) -> Result<User> {
        let found = match &req.identifier {
            LoginIdentifier::Email(email) => {
                self.users.find_by_email(Scope::Ambient, email).await?
            }
            LoginIdentifier::Phone {
                country_code,
                phone_number,
            } => {
                self.users
                    .find_by_phone(Scope::Ambient, country_code, phone_number)
                    .await?
            }
        };

        // Unknown account and wrong password are indistinguishable to the caller
        let Some(user) = found else {
            warn!("Login for unknown identifier");
            return Err(IdentityError::InvalidCredentials);
        };

        if !verify_password(&req.password, &user.password_hash)? {
            warn!(user_id = %user.id, "Invalid password provided");
            return Err(IdentityError::InvalidCredentials);
        }

        Ok(user)
    }

    /// Exchange a refresh token for a new access token. The refresh token
    /// itself is not rotated.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshResponse> {
        async {
            if refresh_token.is_empty() {
                return Err(IdentityError::TokenRequired);
            }

            let record = self
                .refresh_tokens
                .get_by_token(Scope::Ambient, refresh_token)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Refresh token lookup failed");
                    e
                })?;
            debug!(token_id = %record.id, user_id = %record.user_id, "Retrieved refresh token");

            record.validate(now_millis()).map_err(|e| {
                warn!(token_id = %record.id, error = %e, "Refresh token rejected");
                e
            })?;

            let user = self
                .users
                .find_by_id(Scope::Ambient, record.user_id)
                .await?
                .ok_or(IdentityError::UserNotFound)?;

            let (access_token, _) = self.tokens.create_access_token(
                &user.id.to_string(),
                &user.username,
                self.ttl.access_secs,
            )?;

            info!(user_id = %user.id, token_id = %record.id, "Token refresh completed");

            Ok(RefreshResponse { access_token })
        }
        .instrument(self.span.clone())
        .await
    }

    /// Revoke a refresh token. Revoking an already revoked token succeeds.
    pub async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<()> {
        async {
            if refresh_token.is_empty() {
                return Err(IdentityError::TokenRequired);
            }

            if self
                .refresh_tokens
                .revoke(Scope::Ambient, refresh_token)
                .await?
            {
                info!("Refresh token revoked");
                return Ok(());
            }

            // Nothing updated: either unknown or already revoked
            let record = self
                .refresh_tokens
                .get_by_token(Scope::Ambient, refresh_token)
                .await?;
            debug!(token_id = %record.id, "Refresh token was already revoked");
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Revoke every refresh token of a user, e.g. on password change.
    pub async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64> {
        async {
            let revoked = self
                .refresh_tokens
                .revoke_all_for_user(Scope::Ambient, user_id)
                .await?;
            info!(user_id = %user_id, revoked, "Refresh tokens revoked for user");
            Ok(revoked)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Verify an access token and return its claims.
    pub fn verify_access_token(&self, token: &str) -> Result<TokenPayload> {
        if token.is_empty() {
            return Err(IdentityError::TokenRequired);
        }
        Ok(self.tokens.verify_token(token)?)
    }
}
