// Shared fixtures for identity-service integration tests.
//
// `MemoryStore` stands in for PostgreSQL: a transaction works on a snapshot of
// the tables that replaces the shared state on commit and is dropped on
// rollback, so atomicity is observable without a database.

#![allow(dead_code)]

use async_trait::async_trait;
use crypto_core::JwtTokenMaker;
use db_pool::{Scope, TransactionCoordinator, TransactionManager, TxOptions};
use identity_service::db::{RefreshTokenRepository, UserRepository};
use identity_service::models::{RefreshToken, User};
use identity_service::services::{IdentityService, TokenTtl};
use identity_service::{IdentityError, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use transactional_outbox::{
    OutboxError, OutboxEvent, OutboxRepository, OutboxResult, OutboxStatus, Task, TaskInfo,
    TaskOptions, TaskQueue,
};
use uuid::Uuid;

pub const SECRET: &str = "integration-test-secret-0123456789abcdef";
pub const ACCESS_TTL_SECS: i64 = 900;
pub const REFRESH_TTL_SECS: i64 = 604_800;

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub users: Vec<User>,
    pub refresh_tokens: Vec<RefreshToken>,
    pub outbox: Vec<OutboxEvent>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    fail_refresh_token_insert: AtomicBool,
    fail_outbox_insert: AtomicBool,
    commits: Mutex<usize>,
    rollbacks: Mutex<usize>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Tables {
        self.inner.tables.lock().unwrap().clone()
    }

    pub fn fail_refresh_token_insert(&self) {
        self.inner
            .fail_refresh_token_insert
            .store(true, Ordering::SeqCst);
    }

    pub fn fail_outbox_insert(&self) {
        self.inner.fail_outbox_insert.store(true, Ordering::SeqCst);
    }

    pub fn rollbacks(&self) -> usize {
        *self.inner.rollbacks.lock().unwrap()
    }

    /// Direct write outside any transaction.
    pub fn update_refresh_tokens(&self, f: impl Fn(&mut RefreshToken)) {
        let mut tables = self.inner.tables.lock().unwrap();
        tables.refresh_tokens.iter_mut().for_each(f);
    }

    fn with_tables<T>(&self, scope: Scope<'_, Tables>, f: impl FnOnce(&mut Tables) -> T) -> T {
        match scope {
            Scope::Transaction(tx) => f(tx),
            Scope::Ambient => f(&mut self.inner.tables.lock().unwrap()),
        }
    }
}

fn unique_violation() -> IdentityError {
    IdentityError::UserAlreadyExists
}

#[async_trait]
impl TransactionManager for MemoryStore {
    type Tx = Tables;

    async fn begin(&self, _options: TxOptions) -> std::result::Result<Tables, sqlx::Error> {
        Ok(self.snapshot())
    }

    async fn commit(&self, tx: Tables) -> std::result::Result<(), sqlx::Error> {
        *self.inner.tables.lock().unwrap() = tx;
        *self.inner.commits.lock().unwrap() += 1;
        Ok(())
    }

    async fn rollback(&self, _tx: Tables) -> std::result::Result<(), sqlx::Error> {
        *self.inner.rollbacks.lock().unwrap() += 1;
        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    type Tx = Tables;

    async fn create(&self, scope: Scope<'_, Tables>, user: &User) -> Result<()> {
        self.with_tables(scope, |tables| {
            let taken = tables.users.iter().any(|u| {
                u.id == user.id
                    || u.username == user.username
                    || (u.email.is_some() && u.email == user.email)
                    || (u.phone_number.is_some()
                        && u.phone_number == user.phone_number
                        && u.country_code == user.country_code)
            });
            if taken {
                return Err(unique_violation());
            }
            tables.users.push(user.clone());
            Ok(())
        })
    }

    async fn find_by_id(&self, scope: Scope<'_, Tables>, id: Uuid) -> Result<Option<User>> {
        Ok(self.with_tables(scope, |tables| {
            tables.users.iter().find(|u| u.id == id).cloned()
        }))
    }

    async fn find_by_email(&self, scope: Scope<'_, Tables>, email: &str) -> Result<Option<User>> {
        Ok(self.with_tables(scope, |tables| {
            tables
                .users
                .iter()
                .find(|u| u.email.as_deref() == Some(email))
                .cloned()
        }))
    }

    async fn find_by_phone(
        &self,
        scope: Scope<'_, Tables>,
        country_code: &str,
        phone_number: &str,
    ) -> Result<Option<User>> {
        Ok(self.with_tables(scope, |tables| {
            tables
                .users
                .iter()
                .find(|u| {
                    u.country_code.as_deref() == Some(country_code)
                        && u.phone_number.as_deref() == Some(phone_number)
                })
                .cloned()
        }))
    }
}

#[async_trait]
impl RefreshTokenRepository for MemoryStore {
    type Tx = Tables;

    async fn insert(&self, scope: Scope<'_, Tables>, token: &RefreshToken) -> Result<()> {
        if self.inner.fail_refresh_token_insert.load(Ordering::SeqCst) {
            return Err(IdentityError::Database("refresh_tokens unavailable".into()));
        }
        self.with_tables(scope, |tables| tables.refresh_tokens.push(token.clone()));
        Ok(())
    }

    async fn get_by_token(&self, scope: Scope<'_, Tables>, token: &str) -> Result<RefreshToken> {
        self.with_tables(scope, |tables| {
            tables
                .refresh_tokens
                .iter()
                .find(|t| t.matches(token))
                .cloned()
        })
        .ok_or(IdentityError::TokenNotFound)
    }

    async fn revoke(&self, scope: Scope<'_, Tables>, token: &str) -> Result<bool> {
        Ok(self.with_tables(scope, |tables| {
            match tables
                .refresh_tokens
                .iter_mut()
                .find(|t| t.matches(token) && !t.is_revoked)
            {
                Some(record) => {
                    record.is_revoked = true;
                    true
                }
                None => false,
            }
        }))
    }

    async fn revoke_all_for_user(&self, scope: Scope<'_, Tables>, user_id: Uuid) -> Result<u64> {
        Ok(self.with_tables(scope, |tables| {
            let mut revoked = 0;
            for record in tables
                .refresh_tokens
                .iter_mut()
                .filter(|t| t.user_id == user_id && !t.is_revoked)
            {
                record.is_revoked = true;
                revoked += 1;
            }
            revoked
        }))
    }
}

#[async_trait]
impl OutboxRepository for MemoryStore {
    type Tx = Tables;

    async fn insert(&self, scope: Scope<'_, Tables>, event: &OutboxEvent) -> OutboxResult<()> {
        if self.inner.fail_outbox_insert.load(Ordering::SeqCst) {
            return Err(OutboxError::Other(anyhow::anyhow!("outbox_events unavailable")));
        }
        self.with_tables(scope, |tables| tables.outbox.push(event.clone()));
        Ok(())
    }

    async fn find_pending(&self, event_name: &str, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let mut pending: Vec<_> = self
            .snapshot()
            .outbox
            .into_iter()
            .filter(|e| e.event_name == event_name && e.status == OutboxStatus::Pending)
            .collect();
        pending.sort_by_key(|e| (e.created_at, e.id));
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn mark_success(&self, event_id: Uuid) -> OutboxResult<bool> {
        Ok(self.settle(event_id, OutboxStatus::Success, None))
    }

    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<bool> {
        Ok(self.settle(event_id, OutboxStatus::Failed, Some(error)))
    }

    async fn record_failure(
        &self,
        event_id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> OutboxResult<OutboxStatus> {
        let mut tables = self.inner.tables.lock().unwrap();
        let event = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == event_id && e.status == OutboxStatus::Pending)
            .ok_or(OutboxError::EventNotFound(event_id))?;
        event.attempts += 1;
        event.last_error = Some(error.to_string());
        if event.attempts >= max_attempts {
            event.status = OutboxStatus::Failed;
        }
        Ok(event.status)
    }

    async fn pending_stats(&self, event_name: &str) -> OutboxResult<(i64, i64)> {
        let pending = self
            .snapshot()
            .outbox
            .iter()
            .filter(|e| e.event_name == event_name && e.status == OutboxStatus::Pending)
            .count();
        Ok((pending as i64, 0))
    }
}

impl MemoryStore {
    fn settle(&self, event_id: Uuid, status: OutboxStatus, error: Option<&str>) -> bool {
        let mut tables = self.inner.tables.lock().unwrap();
        match tables
            .outbox
            .iter_mut()
            .find(|e| e.id == event_id && e.status == OutboxStatus::Pending)
        {
            Some(event) => {
                event.status = status;
                event.last_error = error.map(str::to_string);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Task queue
// ============================================================================

/// Accepts each task id once, like the Redis queue.
#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<(String, Task)>>,
    ids: Mutex<HashSet<String>>,
}

impl RecordingQueue {
    pub fn tasks(&self) -> Vec<(String, Task)> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: Task, options: TaskOptions) -> OutboxResult<TaskInfo> {
        let id = options
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !self.ids.lock().unwrap().insert(id.clone()) {
            return Err(OutboxError::TaskIdConflict(id));
        }
        self.tasks.lock().unwrap().push((id.clone(), task));
        Ok(TaskInfo {
            id,
            queue: options.queue.unwrap_or_else(|| "default".to_string()),
        })
    }
}

// ============================================================================
// Service wiring
// ============================================================================

pub fn token_maker() -> Arc<JwtTokenMaker> {
    Arc::new(JwtTokenMaker::new(SECRET))
}

pub fn service(store: &MemoryStore) -> IdentityService<MemoryStore> {
    IdentityService::new(
        TransactionCoordinator::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        token_maker(),
        TokenTtl {
            access_secs: ACCESS_TTL_SECS,
            refresh_secs: REFRESH_TTL_SECS,
        },
    )
}
