/// Identity Service Main Entry Point
///
/// Starts:
/// - PostgreSQL connection pool (migrations applied on start)
/// - Redis task queue client
/// - Identity service
/// - Login notification worker (background task)
use anyhow::{Context, Result};
use crypto_core::JwtTokenMaker;
use db_pool::{PgTransactionManager, TransactionCoordinator};
use identity_service::{
    config::{LogFormat, LogSettings, Settings},
    db::{init_pool, PgRefreshTokenRepository, PgUserRepository},
    services::{spawn_login_worker, IdentityService, TokenTtl},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use transactional_outbox::{OutboxMetrics, RedisTaskQueue, SqlxOutboxRepository};

/// Extra time granted to the worker on top of its own drain grace.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

fn init_tracing(log: &LogSettings) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log.filter.as_str())
        .with_target(false);

    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(&LogSettings::from_env());

    let settings = Settings::load().context("Failed to load configuration")?;
    info!("Starting identity-service");

    let pool = init_pool(settings.database.clone())
        .await
        .context("Failed to initialize database")?;
    info!("Database ready, migrations applied");

    let queue = RedisTaskQueue::connect(
        &settings.redis.url,
        settings.redis.namespace.clone(),
        settings.redis.queue.clone(),
        settings.redis.dedup_ttl(),
    )
    .await
    .context("Failed to connect task queue")?;
    info!(namespace = %settings.redis.namespace, queue = %settings.redis.queue, "Task queue connected");

    let outbox = Arc::new(SqlxOutboxRepository::new(pool.clone()));
    let token_maker = Arc::new(JwtTokenMaker::new(&settings.jwt.secret_key));

    let service = IdentityService::new(
        TransactionCoordinator::new(PgTransactionManager::new(pool.clone())),
        Arc::new(PgUserRepository::new(pool.clone())),
        Arc::new(PgRefreshTokenRepository::new(pool.clone())),
        outbox.clone(),
        token_maker,
        TokenTtl {
            access_secs: settings.jwt.access_token_ttl_secs,
            refresh_secs: settings.jwt.refresh_token_ttl_secs,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = if settings.worker.enabled {
        let handle = spawn_login_worker(
            outbox,
            Arc::new(queue),
            &settings.worker,
            Some(OutboxMetrics::new("identity-service")),
            shutdown_rx,
        );
        info!(
            interval_ms = settings.worker.interval_ms,
            batch_size = settings.worker.batch_size,
            "Login notification worker started"
        );
        Some(handle)
    } else {
        warn!("Login notification worker disabled");
        None
    };

    info!("identity-service ready");
    shutdown_signal().await;

    // Stop producing new batches, then give the drain pass a bounded window
    shutdown_tx.send_replace(true);
    if let Some(handle) = worker {
        let deadline = settings.worker.shutdown_grace() + SHUTDOWN_SLACK;
        match tokio::time::timeout(deadline, handle.join()).await {
            Ok(Ok(())) => info!("Login notification worker stopped"),
            Ok(Err(e)) => error!(error = %e, "Login notification worker crashed"),
            Err(_) => warn!(
                deadline_secs = deadline.as_secs(),
                "Login notification worker did not stop in time"
            ),
        }
    }

    drop(service);
    pool.close().await;
    info!("identity-service stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully...");
}
