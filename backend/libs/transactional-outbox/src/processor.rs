//! Outbox worker: drains pending events of one name into a [`TaskQueue`].
//!
//! The worker is one long-lived task. It processes rows sequentially, oldest
//! first, and only observes cancellation between rows, so an enqueue that is
//! already in flight always completes and gets its status recorded.
//!
//! Shutdown is cooperative: either the process-wide shutdown signal flips to
//! `true` (or its sender goes away) or [`OutboxWorkerHandle::stop`] is called.
//! The worker then runs one more drain pass bounded by
//! [`OutboxProcessorConfig::shutdown_grace`] and exits. The grace period is
//! measured from the moment the worker noticed the stop, not from whatever
//! deadline the caller is under; callers put their own hard limit around
//! [`OutboxWorkerHandle::join`].

use crate::error::{OutboxError, OutboxResult};
use crate::metrics::OutboxMetrics;
use crate::queue::{Task, TaskOptions, TaskQueue};
use crate::{OutboxEvent, OutboxRepository, OutboxStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Turns a stored event into the task handed to the queue.
///
/// Return [`OutboxError::InvalidPayload`] (or a serde error) for payloads that
/// can never be delivered; the worker marks such rows `failed` right away.
pub trait TaskBuilder: Send + Sync {
    fn build(&self, event: &OutboxEvent) -> OutboxResult<Task>;
}

#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Only events with this name are polled
    pub event_name: String,
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Retry budget passed to the queue consumer with every task
    pub max_retry: u32,
    /// Failed enqueues tolerated before a row becomes `failed`
    pub max_attempts: i32,
    /// Upper bound of the final drain pass
    pub shutdown_grace: Duration,
    /// Target queue; the broker default when `None`
    pub queue: Option<String>,
}

impl OutboxProcessorConfig {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            poll_interval: Duration::from_secs(10),
            batch_size: 1000,
            max_retry: 5,
            max_attempts: 5,
            shutdown_grace: Duration::from_secs(10),
            queue: None,
        }
    }
}

/// Result of handling a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Handed to the queue (or found already handed over) and marked `success`
    Delivered,
    /// Enqueue failed; the row stays pending for the next poll
    Retrying,
    /// Row marked `failed`
    Failed,
}

/// Counters of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Rows that hit a storage error while recording their outcome
    pub errored: usize,
    /// Rows left untouched because the stop condition was set mid-batch
    pub skipped: usize,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.fetched == 0
    }
}

/// When a batch has to stop early.
pub(crate) enum StopCondition<'a> {
    /// Polling mode: shutdown signal or explicit stop
    Signals {
        shutdown: &'a watch::Receiver<bool>,
        stop: &'a watch::Receiver<bool>,
    },
    /// Drain mode: grace deadline
    Deadline(Instant),
    Never,
}

impl StopCondition<'_> {
    fn is_set(&self) -> bool {
        match self {
            StopCondition::Signals { shutdown, stop } => {
                shutdown_requested(shutdown) || *stop.borrow()
            }
            StopCondition::Deadline(deadline) => Instant::now() >= *deadline,
            StopCondition::Never => false,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            StopCondition::Deadline(deadline) => Some(*deadline),
            _ => None,
        }
    }
}

/// A dropped shutdown sender counts as shutdown.
fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

pub struct OutboxProcessor<R: ?Sized, Q: ?Sized> {
    repository: Arc<R>,
    queue: Arc<Q>,
    builder: Arc<dyn TaskBuilder>,
    config: OutboxProcessorConfig,
    metrics: Option<OutboxMetrics>,
    span: Span,
}

impl<R, Q> OutboxProcessor<R, Q>
where
    R: OutboxRepository + ?Sized,
    Q: TaskQueue + ?Sized,
{
    pub fn new(
        repository: Arc<R>,
        queue: Arc<Q>,
        builder: Arc<dyn TaskBuilder>,
        config: OutboxProcessorConfig,
    ) -> Self {
        let span = info_span!("outbox_worker", event_name = %config.event_name);
        Self {
            repository,
            queue,
            builder,
            config,
            metrics: None,
            span,
        }
    }

    /// Update Prometheus metrics after every polling cycle.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Log under the given span instead of the default `outbox_worker` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &OutboxProcessorConfig {
        &self.config
    }

    /// Start the polling loop on the runtime.
    ///
    /// `shutdown` is the process-wide signal; the returned handle adds a
    /// worker-local stop and lets the caller wait for completion.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> OutboxWorkerHandle
    where
        R: 'static,
        Q: 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let span = self.span.clone();
        let task = tokio::spawn(self.run(shutdown, stop_rx).instrument(span));

        OutboxWorkerHandle {
            stop: stop_tx,
            task,
        }
    }

    /// Poll and process one batch, ignoring cancellation.
    pub async fn poll_once(&self) -> BatchReport {
        let span = self.span.clone();
        async {
            let report = self.process_batch(&StopCondition::Never).await;
            self.refresh_metrics().await;
            report
        }
        .instrument(span)
        .await
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, mut stop: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "Outbox worker starting"
        );

        // First tick completes immediately, so the backlog is polled on start.
        let mut ticker = interval(self.config.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_open = true;

        loop {
            if shutdown_requested(&shutdown) || *stop.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                changed = stop.changed(), if stop_open => {
                    match changed {
                        // Handle dropped without stopping: keep running until shutdown
                        Err(_) => stop_open = false,
                        Ok(()) if *stop.borrow() => break,
                        Ok(()) => {}
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let gate = StopCondition::Signals {
                shutdown: &shutdown,
                stop: &stop,
            };
            let report = self.process_batch(&gate).await;
            log_report("Outbox poll finished", &report);
            self.refresh_metrics().await;
        }

        info!(
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Outbox worker stopping, draining pending events"
        );
        let deadline = Instant::now() + self.config.shutdown_grace;
        let report = self
            .process_batch(&StopCondition::Deadline(deadline))
            .await;
        log_report("Outbox drain finished", &report);
        self.refresh_metrics().await;

        info!("Outbox worker stopped");
    }

    async fn process_batch(&self, gate: &StopCondition<'_>) -> BatchReport {
        let mut report = BatchReport::default();

        let fetch = self
            .repository
            .find_pending(&self.config.event_name, i64::from(self.config.batch_size));
        let fetched = match gate.deadline() {
            Some(deadline) => match timeout_at(deadline, fetch).await {
                Ok(fetched) => fetched,
                Err(_) => {
                    warn!("Grace period elapsed while fetching pending events");
                    return report;
                }
            },
            None => fetch.await,
        };

        let events = match fetched {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to fetch pending events");
                return report;
            }
        };
        report.fetched = events.len();

        for (index, event) in events.into_iter().enumerate() {
            if gate.is_set() {
                report.skipped = report.fetched - index;
                info!(skipped = report.skipped, "Stop requested, abandoning rest of batch");
                break;
            }

            let event_id = event.id;
            match self.process_event(event).await {
                Ok(EventOutcome::Delivered) => report.delivered += 1,
                Ok(EventOutcome::Retrying) => report.retrying += 1,
                Ok(EventOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    report.errored += 1;
                    error!(event_id = %event_id, error = %e, "Failed to record event outcome");
                }
            }
        }

        report
    }

    /// Build, enqueue and settle a single event.
    ///
    /// The event id is the task id, so a row re-polled after a lost status
    /// update is answered with [`OutboxError::TaskIdConflict`] by the queue and
    /// settled without a second task.
    pub async fn process_event(&self, event: OutboxEvent) -> OutboxResult<EventOutcome> {
        let task = match self.builder.build(&event) {
            Ok(task) => task,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Undeliverable outbox payload");
                return self.settle_failed(event.id, &e.to_string()).await;
            }
        };

        let options = TaskOptions {
            task_id: Some(event.id.to_string()),
            max_retry: self.config.max_retry,
            queue: self.config.queue.clone(),
        };

        match self.queue.enqueue(task, options).await {
            Ok(info) => {
                info!(
                    event_id = %event.id,
                    task_id = %info.id,
                    queue = %info.queue,
                    "Task enqueued"
                );
                self.settle_delivered(event.id).await
            }
            Err(OutboxError::TaskIdConflict(task_id)) => {
                info!(event_id = %event.id, task_id = %task_id, "Task already enqueued");
                self.settle_delivered(event.id).await
            }
            Err(e) if e.is_fatal() => {
                error!(event_id = %event.id, error = %e, "Queue rejected outbox payload");
                self.settle_failed(event.id, &e.to_string()).await
            }
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    attempts = event.attempts + 1,
                    error = %e,
                    "Failed to enqueue task"
                );
                let status = self
                    .repository
                    .record_failure(event.id, &e.to_string(), self.config.max_attempts)
                    .await?;

                if status == OutboxStatus::Failed {
                    error!(
                        event_id = %event.id,
                        max_attempts = self.config.max_attempts,
                        "Attempt budget exhausted, event marked as failed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.failed.inc();
                    }
                    Ok(EventOutcome::Failed)
                } else {
                    if let Some(metrics) = &self.metrics {
                        metrics.retried.inc();
                    }
                    Ok(EventOutcome::Retrying)
                }
            }
        }
    }

    async fn settle_delivered(&self, event_id: Uuid) -> OutboxResult<EventOutcome> {
        if self.repository.mark_success(event_id).await? {
            if let Some(metrics) = &self.metrics {
                metrics.delivered.inc();
            }
        } else {
            debug!(event_id = %event_id, "Event already settled");
        }
        Ok(EventOutcome::Delivered)
    }

    async fn settle_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<EventOutcome> {
        if self.repository.mark_failed(event_id, error).await? {
            if let Some(metrics) = &self.metrics {
                metrics.failed.inc();
            }
        }
        Ok(EventOutcome::Failed)
    }

    async fn refresh_metrics(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match self.repository.pending_stats(&self.config.event_name).await {
            Ok((pending, age)) => {
                metrics.pending.set(pending);
                metrics.oldest_pending_age_seconds.set(age);
            }
            Err(e) => debug!(error = %e, "Failed to refresh outbox metrics"),
        }
    }
}

fn log_report(message: &'static str, report: &BatchReport) {
    if report.is_empty() {
        debug!("{}: nothing pending", message);
    } else {
        info!(
            fetched = report.fetched,
            delivered = report.delivered,
            retrying = report.retrying,
            failed = report.failed,
            errored = report.errored,
            skipped = report.skipped,
            "{}",
            message
        );
    }
}

/// Handle of a spawned worker.
///
/// Dropping the handle detaches the worker; it then runs until the shutdown
/// signal fires.
pub struct OutboxWorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl OutboxWorkerHandle {
    /// Ask the worker to drain and exit. Calling it again has no effect.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker to exit.
    pub async fn join(self) -> Result<(), JoinError> {
        let OutboxWorkerHandle { stop, task } = self;
        let result = task.await;
        drop(stop);
        result
    }

    /// [`stop`](Self::stop) followed by [`join`](Self::join).
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.stop();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MockTaskQueue, TaskInfo};
    use async_trait::async_trait;
    use db_pool::Scope;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    // ============================================
    // Test doubles
    // ============================================

    #[derive(Default)]
    struct MemoryOutbox {
        events: Mutex<Vec<OutboxEvent>>,
        fail_next_success: AtomicBool,
    }

    impl MemoryOutbox {
        fn with_events(events: Vec<OutboxEvent>) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(events),
                ..Default::default()
            })
        }

        fn get(&self, id: Uuid) -> OutboxEvent {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .unwrap()
        }

        fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut OutboxEvent) -> T) -> Option<T> {
            let mut events = self.events.lock().unwrap();
            events
                .iter_mut()
                .find(|e| e.id == id && e.status == OutboxStatus::Pending)
                .map(f)
        }
    }

    #[async_trait]
    impl OutboxRepository for MemoryOutbox {
        type Tx = ();

        async fn insert(&self, _scope: Scope<'_, ()>, event: &OutboxEvent) -> OutboxResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn find_pending(
            &self,
            event_name: &str,
            limit: i64,
        ) -> OutboxResult<Vec<OutboxEvent>> {
            let mut pending: Vec<_> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.event_name == event_name && e.status == OutboxStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by_key(|e| (e.created_at, e.id));
            pending.truncate(limit as usize);
            Ok(pending)
        }

        async fn mark_success(&self, event_id: Uuid) -> OutboxResult<bool> {
            if self.fail_next_success.swap(false, Ordering::SeqCst) {
                return Err(OutboxError::Other(anyhow::anyhow!("connection reset")));
            }
            Ok(self
                .update(event_id, |e| e.status = OutboxStatus::Success)
                .is_some())
        }

        async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<bool> {
            Ok(self
                .update(event_id, |e| {
                    e.status = OutboxStatus::Failed;
                    e.last_error = Some(error.to_string());
                })
                .is_some())
        }

        async fn record_failure(
            &self,
            event_id: Uuid,
            error: &str,
            max_attempts: i32,
        ) -> OutboxResult<OutboxStatus> {
            self.update(event_id, |e| {
                e.attempts += 1;
                e.last_error = Some(error.to_string());
                if e.attempts >= max_attempts {
                    e.status = OutboxStatus::Failed;
                }
                e.status
            })
            .ok_or(OutboxError::EventNotFound(event_id))
        }

        async fn pending_stats(&self, event_name: &str) -> OutboxResult<(i64, i64)> {
            let events = self.events.lock().unwrap();
            let pending = events
                .iter()
                .filter(|e| e.event_name == event_name && e.status == OutboxStatus::Pending)
                .count();
            Ok((pending as i64, 0))
        }
    }

    /// Queue that refuses a task id it has already accepted. A failed push
    /// claims nothing, so the id stays free for the next attempt.
    #[derive(Default)]
    struct DedupQueue {
        accepted: Mutex<Vec<Task>>,
        ids: Mutex<HashSet<String>>,
        fail_next_push: AtomicBool,
    }

    impl DedupQueue {
        fn accepted(&self) -> usize {
            self.accepted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TaskQueue for DedupQueue {
        async fn enqueue(&self, task: Task, options: TaskOptions) -> OutboxResult<TaskInfo> {
            let id = options.task_id.unwrap_or_default();
            if self.fail_next_push.swap(false, Ordering::SeqCst) {
                return Err(OutboxError::EnqueueFailed("connection dropped".into()));
            }
            if !self.ids.lock().unwrap().insert(id.clone()) {
                return Err(OutboxError::TaskIdConflict(id));
            }
            self.accepted.lock().unwrap().push(task);
            Ok(TaskInfo {
                id,
                queue: "default".into(),
            })
        }
    }

    struct PassThrough;

    impl TaskBuilder for PassThrough {
        fn build(&self, event: &OutboxEvent) -> OutboxResult<Task> {
            if event.payload.get("userID").is_none() {
                return Err(OutboxError::InvalidPayload("missing userID".into()));
            }
            Ok(Task::new(event.event_name.clone(), event.payload.clone()))
        }
    }

    fn login_event(user: &str, created_at: i64) -> OutboxEvent {
        let mut event = OutboxEvent::new("login", &serde_json::json!({ "userID": user })).unwrap();
        event.created_at = created_at;
        event
    }

    /// Sleeps before accepting every task.
    struct SlowQueue {
        delay: Duration,
        inner: DedupQueue,
    }

    #[async_trait]
    impl TaskQueue for SlowQueue {
        async fn enqueue(&self, task: Task, options: TaskOptions) -> OutboxResult<TaskInfo> {
            tokio::time::sleep(self.delay).await;
            self.inner.enqueue(task, options).await
        }
    }

    fn processor<Q: TaskQueue>(
        repo: Arc<MemoryOutbox>,
        queue: Arc<Q>,
    ) -> OutboxProcessor<MemoryOutbox, Q> {
        OutboxProcessor::new(
            repo,
            queue,
            Arc::new(PassThrough),
            OutboxProcessorConfig::new("login"),
        )
    }

    // ============================================
    // Single poll
    // ============================================

    #[tokio::test]
    async fn test_poll_delivers_oldest_first_and_marks_success() {
        let newer = login_event("2", 2_000);
        let older = login_event("1", 1_000);
        let repo = MemoryOutbox::with_events(vec![newer.clone(), older.clone()]);
        let queue = Arc::new(DedupQueue::default());

        let report = processor(repo.clone(), queue.clone()).poll_once().await;

        assert_eq!(report.delivered, 2);
        let accepted = queue.accepted.lock().unwrap();
        assert_eq!(accepted[0].payload["userID"], "1");
        assert_eq!(accepted[1].payload["userID"], "2");
        assert_eq!(repo.get(older.id).status, OutboxStatus::Success);
        assert_eq!(repo.get(newer.id).status, OutboxStatus::Success);
    }

    #[tokio::test]
    async fn test_repoll_before_status_update_enqueues_once() {
        // GIVEN: the first status update is lost after a successful enqueue
        let event = login_event("42", 1_000);
        let repo = MemoryOutbox::with_events(vec![event.clone()]);
        repo.fail_next_success.store(true, Ordering::SeqCst);
        let queue = Arc::new(DedupQueue::default());
        let worker = processor(repo.clone(), queue.clone());

        // WHEN
        let first = worker.poll_once().await;
        assert_eq!(first.errored, 1);
        assert_eq!(repo.get(event.id).status, OutboxStatus::Pending);

        let second = worker.poll_once().await;
        let third = worker.poll_once().await;

        // THEN: one task, row settled, no longer polled
        assert_eq!(second.delivered, 1);
        assert_eq!(queue.accepted(), 1);
        assert_eq!(repo.get(event.id).status, OutboxStatus::Success);
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_is_retried_and_delivered_once() {
        // GIVEN: the first push fails before anything reaches the queue
        let event = login_event("42", 1_000);
        let repo = MemoryOutbox::with_events(vec![event.clone()]);
        let queue = Arc::new(DedupQueue::default());
        queue.fail_next_push.store(true, Ordering::SeqCst);
        let worker = processor(repo.clone(), queue.clone());

        // WHEN
        let first = worker.poll_once().await;
        assert_eq!(first.retrying, 1);
        let stored = repo.get(event.id);
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.attempts, 1);

        let second = worker.poll_once().await;

        // THEN: the retry is accepted, not mistaken for an earlier delivery
        assert_eq!(second.delivered, 1);
        assert_eq!(queue.accepted(), 1);
        assert_eq!(repo.get(event.id).status, OutboxStatus::Success);
        assert!(worker.poll_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_metric_counts_only_own_event_name() {
        let login = login_event("42", 1_000);
        let welcome = OutboxEvent::new("welcome", &serde_json::json!({ "userID": "7" })).unwrap();
        let repo = MemoryOutbox::with_events(vec![login.clone(), welcome.clone()]);
        let mut queue = MockTaskQueue::new();
        queue
            .expect_enqueue()
            .times(1)
            .returning(|_, _| Err(OutboxError::EnqueueFailed("broker down".into())));
        let metrics = OutboxMetrics::new("outbox-processor-pending-by-name");

        let report = processor(repo.clone(), Arc::new(queue))
            .with_metrics(metrics.clone())
            .poll_once()
            .await;

        assert_eq!(report.fetched, 1);
        assert_eq!(metrics.pending.get(), 1);
        assert_eq!(metrics.retried.get(), 1);
        assert_eq!(repo.get(welcome.id).status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_poison_payload_is_failed_without_enqueue() {
        let poison = OutboxEvent::new("login", &serde_json::json!({ "nope": true })).unwrap();
        let repo = MemoryOutbox::with_events(vec![poison.clone()]);
        let mut queue = MockTaskQueue::new();
        queue.expect_enqueue().never();

        let report = processor(repo.clone(), Arc::new(queue)).poll_once().await;

        assert_eq!(report.failed, 1);
        let stored = repo.get(poison.id);
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("Invalid payload: missing userID"));
    }

    #[tokio::test]
    async fn test_enqueue_failures_exhaust_attempt_budget() {
        let event = login_event("42", 1_000);
        let repo = MemoryOutbox::with_events(vec![event.clone()]);
        let mut queue = MockTaskQueue::new();
        queue
            .expect_enqueue()
            .times(2)
            .returning(|_, _| Err(OutboxError::EnqueueFailed("broker down".into())));

        let mut config = OutboxProcessorConfig::new("login");
        config.max_attempts = 2;
        let worker = OutboxProcessor::new(repo.clone(), Arc::new(queue), Arc::new(PassThrough), config);

        assert_eq!(worker.poll_once().await.retrying, 1);
        assert_eq!(repo.get(event.id).status, OutboxStatus::Pending);

        assert_eq!(worker.poll_once().await.failed, 1);
        let stored = repo.get(event.id);
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.attempts, 2);

        assert!(worker.poll_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_task_carries_event_id_and_retry_budget() {
        let event = login_event("42", 1_000);
        let expected_id = event.id.to_string();
        let repo = MemoryOutbox::with_events(vec![event]);
        let mut queue = MockTaskQueue::new();
        queue
            .expect_enqueue()
            .withf(move |task, options| {
                task.name == "login"
                    && options.task_id.as_deref() == Some(expected_id.as_str())
                    && options.max_retry == 5
            })
            .times(1)
            .returning(|_, options| {
                Ok(TaskInfo {
                    id: options.task_id.unwrap_or_default(),
                    queue: "default".into(),
                })
            });

        let report = processor(repo, Arc::new(queue)).poll_once().await;
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_batch_stops_when_signal_already_set() {
        let repo = MemoryOutbox::with_events(vec![
            login_event("1", 1),
            login_event("2", 2),
            login_event("3", 3),
        ]);
        let queue = Arc::new(DedupQueue::default());
        let worker = processor(repo, queue.clone());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (_stop_tx, stop) = watch::channel(true);

        let report = worker
            .process_batch(&StopCondition::Signals {
                shutdown: &shutdown,
                stop: &stop,
            })
            .await;

        assert_eq!(report.fetched, 3);
        assert_eq!(report.skipped, 3);
        assert_eq!(queue.accepted(), 0);
    }

    // ============================================
    // Spawned worker
    // ============================================

    #[tokio::test]
    async fn test_shutdown_drains_pending_events() {
        let events = vec![login_event("1", 1), login_event("2", 2), login_event("3", 3)];
        let repo = MemoryOutbox::with_events(events.clone());
        let queue = Arc::new(DedupQueue::default());
        let (_shutdown_tx, shutdown) = watch::channel(true);

        let handle = processor(repo.clone(), queue.clone()).spawn(shutdown);
        handle.join().await.unwrap();

        assert_eq!(queue.accepted(), 3);
        for event in events {
            assert_eq!(repo.get(event.id).status, OutboxStatus::Success);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_is_polled_on_start() {
        let event = login_event("1", 1);
        let repo = MemoryOutbox::with_events(vec![event.clone()]);
        let queue = Arc::new(DedupQueue::default());
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let mut config = OutboxProcessorConfig::new("login");
        config.poll_interval = Duration::from_secs(3600);
        let started = Instant::now();
        let handle = OutboxProcessor::new(repo.clone(), queue.clone(), Arc::new(PassThrough), config)
            .spawn(shutdown);

        tokio::time::sleep(Duration::from_secs(1)).await;

        // Delivered by the first poll, long before the first interval elapses
        assert_eq!(queue.accepted(), 1);
        assert_eq!(repo.get(event.id).status, OutboxStatus::Success);
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert!(!handle.is_finished());

        handle.shutdown().await.unwrap();
        assert_eq!(queue.accepted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_at_grace_deadline() {
        // GIVEN: five pending events and a queue taking 4s per task
        let events: Vec<_> = (1..=5).map(|i| login_event(&i.to_string(), i)).collect();
        let repo = MemoryOutbox::with_events(events.clone());
        let queue = Arc::new(SlowQueue {
            delay: Duration::from_secs(4),
            inner: DedupQueue::default(),
        });
        let (_shutdown_tx, shutdown) = watch::channel(true);

        let mut config = OutboxProcessorConfig::new("login");
        config.shutdown_grace = Duration::from_secs(10);

        // WHEN: the worker starts already shut down and only drains
        let handle = OutboxProcessor::new(repo.clone(), queue.clone(), Arc::new(PassThrough), config)
            .spawn(shutdown);
        handle.join().await.unwrap();

        // THEN: rows started before the deadline finished, the rest wait
        assert_eq!(queue.inner.accepted(), 3);
        for event in &events[..3] {
            assert_eq!(repo.get(event.id).status, OutboxStatus::Success);
        }
        for event in &events[3..] {
            let stored = repo.get(event.id);
            assert_eq!(stored.status, OutboxStatus::Pending);
            assert_eq!(stored.attempts, 0);
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let repo = MemoryOutbox::with_events(vec![login_event("1", 1)]);
        let queue = Arc::new(DedupQueue::default());
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let mut config = OutboxProcessorConfig::new("login");
        config.poll_interval = Duration::from_secs(3600);
        let handle = OutboxProcessor::new(repo, queue.clone(), Arc::new(PassThrough), config)
            .spawn(shutdown);

        handle.stop();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("worker exits after stop")
            .unwrap();

        assert_eq!(queue.accepted(), 1);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_stops_worker() {
        let repo = MemoryOutbox::with_events(Vec::new());
        let queue = Arc::new(DedupQueue::default());
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = processor(repo, queue).spawn(shutdown);
        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("worker exits when shutdown sender is gone")
            .unwrap();
    }
}
