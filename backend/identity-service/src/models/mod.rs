/// Data models for identity and authentication
pub mod login_event;
pub mod refresh_token;
pub mod user;

pub use login_event::{EventMetadata, EventName, LoginEvent, LoginNotificationParams};
pub use refresh_token::RefreshToken;
pub use user::{
    AuthResponse, LoginIdentifier, LoginRequest, RefreshResponse, RegisterRequest, User,
};
