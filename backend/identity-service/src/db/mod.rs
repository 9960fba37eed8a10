/// Database operations for identity service
pub mod refresh_tokens;
pub mod users;

use db_pool::{create_pool, DbConfig};
use sqlx::migrate::Migrator;
use sqlx::PgPool;

pub use refresh_tokens::{PgRefreshTokenRepository, RefreshTokenRepository};
pub use users::{PgUserRepository, UserRepository};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Create the pool and bring the schema up to date.
pub async fn init_pool(config: DbConfig) -> Result<PgPool, sqlx::Error> {
    config.log_config();
    let pool = create_pool(config).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
