/// Business logic for identity-service
pub mod identity;
pub mod notification;

pub use identity::{IdentityService, TokenTtl};
pub use notification::{login_worker_config, spawn_login_worker, LoginTaskBuilder};
