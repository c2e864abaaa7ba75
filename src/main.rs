use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Duration as ChronoDuration;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rollcall::api::{self, AppState};
use rollcall::config::Config;
use rollcall::db;
use rollcall::jobs::sweeper;
use rollcall::queue::{QueueConfig, VerificationQueue, WorkerContext};
use rollcall::services::comparison::{FaceComparator, HttpFaceComparator};
use rollcall::services::record_api::{RecordApi, RecordApiClient, StaticTokenProvider};
use rollcall::services::reference_store::{HttpReferenceStore, ReferenceCache};
use rollcall::services::retry_tracker::RetryTracker;
use rollcall::services::session_manager::{SessionManager, SessionSettings};
use rollcall::services::submission::SubmissionCoordinator;
use rollcall::store::{PgSessionStore, SessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rollcall=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting rollcall server...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool.clone()));
    let http_timeout = Duration::from_secs(config.http_timeout_secs);

    // External collaborators
    let credentials = Arc::new(StaticTokenProvider::new(config.record_api_token.clone()));
    let record_api: Arc<dyn RecordApi> = Arc::new(RecordApiClient::new(
        &config.record_api_url,
        credentials,
        http_timeout,
    ));
    let comparator: Arc<dyn FaceComparator> = Arc::new(HttpFaceComparator::new(
        &config.comparison_api_url,
        config.comparison_api_key.clone(),
        http_timeout,
        config.comparison_rate_limit_per_sec,
    )?);
    let references = Arc::new(ReferenceCache::new(
        Arc::new(HttpReferenceStore::new(
            &config.reference_store_url,
            http_timeout,
        )),
        Duration::from_secs(config.reference_cache_ttl_secs),
        config.reference_cache_max_entries,
    ));

    // Coordination components
    let retries = Arc::new(RetryTracker::new(
        config.max_verification_attempts,
        ChronoDuration::seconds(config.retry_retention_secs as i64),
        store.clone(),
    ));
    let submissions = Arc::new(SubmissionCoordinator::new(
        record_api.clone(),
        config.submission_retry_attempts,
        Duration::from_millis(config.submission_retry_delay_ms),
    ));

    let (updates_tx, mut updates_rx) = mpsc::channel(config.update_channel_capacity);
    let queue = VerificationQueue::new(
        QueueConfig::from_config(&config),
        WorkerContext {
            store: store.clone(),
            comparator,
            references: references.clone(),
            submissions: submissions.clone(),
            retries: retries.clone(),
            updates: updates_tx,
            match_threshold: config.match_threshold,
        },
    );
    tracing::info!("Verification queue initialized");

    let (reports_tx, mut reports_rx) = mpsc::channel(64);
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        record_api.clone(),
        queue.clone(),
        retries.clone(),
        submissions.clone(),
        reports_tx,
        SessionSettings::from_config(&config),
    ));

    // Delivery sinks for the conversational front-end collaborator. The
    // transport itself lives outside this service; results are surfaced on
    // these channels and logged here.
    tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            tracing::info!(?update, "verification update");
        }
    });
    tokio::spawn(async move {
        while let Some(report) = reports_rx.recv().await {
            tracing::info!(
                session_id = %report.session_id,
                owner_id = %report.owner_id,
                "attendance report:\n{}",
                report.summary
            );
        }
    });

    // Fixed-interval sweep for stale state
    let mut scheduler = JobScheduler::new().await?;
    {
        let manager = manager.clone();
        let retries = retries.clone();
        let references = references.clone();
        let session_retention = ChronoDuration::seconds(config.session_retention_secs as i64);
        let retry_retention = ChronoDuration::seconds(config.retry_retention_secs as i64);
        let sweep = Job::new_async(config.sweep_schedule.as_str(), move |_id, _scheduler| {
            let manager = manager.clone();
            let retries = retries.clone();
            let references = references.clone();
            Box::pin(async move {
                if let Err(e) = sweeper::run_sweep(
                    &manager,
                    &retries,
                    &references,
                    session_retention,
                    retry_retention,
                )
                .await
                {
                    tracing::error!(error = %e, "sweep failed");
                }
            })
        })?;
        scheduler.add(sweep).await?;
    }
    scheduler.start().await?;
    tracing::info!(schedule = %config.sweep_schedule, "sweep scheduled");

    // Build application state
    let state = AppState {
        manager,
        queue: queue.clone(),
        references,
        submissions,
        record_api,
        config: config.clone(),
    };

    // Build router
    let app = Router::new()
        .merge(api::health::router())
        .merge(api::sessions::router())
        .merge(api::monitor::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, cleaning up...");
}
