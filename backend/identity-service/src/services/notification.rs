//! Login notification delivery.
//!
//! `login` outbox rows are turned into `login` tasks for the notification
//! sender by a [`LoginTaskBuilder`] running inside an outbox worker.

use crate::config::LoginWorkerSettings;
use crate::models::{EventMetadata, EventName, LoginEvent, LoginNotificationParams};
use std::sync::Arc;
use tokio::sync::watch;
use transactional_outbox::{
    now_millis, OutboxError, OutboxEvent, OutboxMetrics, OutboxProcessor,
    OutboxProcessorConfig, OutboxRepository, OutboxResult, OutboxWorkerHandle, Task, TaskBuilder,
    TaskQueue,
};

/// Builds the `login` task from a stored [`LoginNotificationParams`] payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoginTaskBuilder;

impl TaskBuilder for LoginTaskBuilder {
    fn build(&self, event: &OutboxEvent) -> OutboxResult<Task> {
        let params: LoginNotificationParams = serde_json::from_value(event.payload.clone())
            .map_err(|e| OutboxError::InvalidPayload(e.to_string()))?;

        if params.user_id.is_empty() {
            return Err(OutboxError::InvalidPayload("userID is empty".to_string()));
        }

        let login_event = LoginEvent {
            event_metadata: EventMetadata {
                event_id: event.id.to_string(),
                event_name: EventName::Login.as_str().to_string(),
                published_at: now_millis(),
            },
            user_id: params.user_id,
            email: params.email.unwrap_or_default(),
            username: params.username,
            login_at: params.login_at,
        };

        Ok(Task::new(
            EventName::Login.as_str(),
            serde_json::to_value(&login_event)?,
        ))
    }
}

/// Worker configuration for `login` events.
pub fn login_worker_config(settings: &LoginWorkerSettings) -> OutboxProcessorConfig {
    OutboxProcessorConfig {
        poll_interval: settings.interval(),
        batch_size: settings.batch_size,
        max_retry: settings.max_retries,
        max_attempts: settings.max_attempts,
        shutdown_grace: settings.shutdown_grace(),
        ..OutboxProcessorConfig::new(EventName::Login.as_str())
    }
}

/// Start the login notification worker.
pub fn spawn_login_worker<R, Q>(
    outbox: Arc<R>,
    queue: Arc<Q>,
    settings: &LoginWorkerSettings,
    metrics: Option<OutboxMetrics>,
    shutdown: watch::Receiver<bool>,
) -> OutboxWorkerHandle
where
    R: OutboxRepository + ?Sized + 'static,
    Q: TaskQueue + ?Sized + 'static,
{
    let mut processor = OutboxProcessor::new(
        outbox,
        queue,
        Arc::new(LoginTaskBuilder),
        login_worker_config(settings),
    );
    if let Some(metrics) = metrics {
        processor = processor.with_metrics(metrics);
    }
    processor.spawn(shutdown)
}
