/// User database operations for identity-service
use crate::error::Result;
use crate::models::User;
use async_trait::async_trait;
use db_pool::{PgTx, Scope};
use sqlx::PgPool;
use uuid::Uuid;

const USER_COLUMNS: &str =
    "id, email, country_code, phone_number, username, password_hash, created_at, updated_at";

#[async_trait]
pub trait UserRepository: Send + Sync {
    type Tx: Send;

    /// Insert a new user. Unique violations surface as `UserAlreadyExists`.
    async fn create(&self, scope: Scope<'_, Self::Tx>, user: &User) -> Result<()>;

    async fn find_by_id(&self, scope: Scope<'_, Self::Tx>, id: Uuid) -> Result<Option<User>>;

    async fn find_by_email(&self, scope: Scope<'_, Self::Tx>, email: &str)
        -> Result<Option<User>>;

    async fn find_by_phone(
        &self,
        scope: Scope<'_, Self::Tx>,
        country_code: &str,
        phone_number: &str,
    ) -> Result<Option<User>>;
}

/// PostgreSQL-backed [`UserRepository`]
#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    type Tx = PgTx;

    async fn create(&self, scope: Scope<'_, PgTx>, user: &User) -> Result<()> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;

        sqlx::query(
            r#"
            INSERT INTO users (
                id, email, country_code, phone_number, username, password_hash, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.country_code)
        .bind(&user.phone_number)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, scope: Scope<'_, PgTx>, id: Uuid) -> Result<Option<User>> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(user)
    }

    async fn find_by_email(&self, scope: Scope<'_, PgTx>, email: &str) -> Result<Option<User>> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE email = $1",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(user)
    }

    async fn find_by_phone(
        &self,
        scope: Scope<'_, PgTx>,
        country_code: &str,
        phone_number: &str,
    ) -> Result<Option<User>> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE country_code = $1 AND phone_number = $2",
            USER_COLUMNS
        ))
        .bind(country_code)
        .bind(phone_number)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(user)
    }
}
