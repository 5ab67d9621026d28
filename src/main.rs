use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use genfarm::config::AppConfig;
use genfarm::db::{self, account_pool::AccountPool, job_store::JobStore};
use genfarm::scripts::DreaminaScript;
use genfarm::services::allocator::AccountAllocator;
use genfarm::services::encryption::CredentialCipher;
use genfarm::services::executor::{ImageExecutor, TaskExecutor, VideoExecutor};
use genfarm::services::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing genfarm daemon");

    // Prometheus exporter, only when an address is configured
    if let Some(addr) = &config.metrics_addr {
        let addr: std::net::SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus metrics exporter");
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    // Register application metrics
    metrics::describe_counter!("genfarm_jobs_started_total", "Generation jobs dispatched");
    metrics::describe_counter!("genfarm_jobs_completed_total", "Generation jobs completed");
    metrics::describe_counter!("genfarm_jobs_failed_total", "Generation jobs failed");
    metrics::describe_counter!(
        "genfarm_quota_exhaustions_total",
        "Quota rejections observed from the remote system"
    );
    metrics::describe_gauge!("genfarm_jobs_queued", "Current queued job count");

    // Initialize database
    tracing::info!("Opening SQLite database");
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to open database");

    tracing::info!("Running database migrations");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize credential encryption
    let cipher =
        Arc::new(CredentialCipher::new(&config.encryption_key).expect("Failed to initialize encryption"));

    let jobs = JobStore::new(pool.clone());
    let accounts = AccountPool::new(pool, cipher);
    let allocator = AccountAllocator::new(accounts.clone(), jobs.clone());

    // Reconcile jobs left Running by an unclean shutdown before dispatching
    // anything new.
    let reset = jobs
        .reset_stale_running_jobs()
        .await
        .expect("Failed to reconcile stale running jobs");
    if reset > 0 {
        tracing::warn!(count = reset, "Requeued jobs left running by a previous instance");
    }

    // Wire the per-kind executors against the remote site's UI script
    let script: Arc<dyn genfarm::scripts::UiScript> = Arc::new(DreaminaScript);
    let executors: Vec<Arc<dyn TaskExecutor>> = vec![
        Arc::new(ImageExecutor::new(script.clone(), jobs.clone(), &config)),
        Arc::new(VideoExecutor::new(script, jobs.clone(), &config)),
    ];

    let scheduler = Scheduler::new(jobs, accounts, allocator, executors, &config);

    // Graceful shutdown on ctrl-c
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received ctrl-c, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(max_workers = config.max_workers, "Scheduler running");
    scheduler.run(shutdown_rx).await;

    tracing::info!("genfarm stopped");
}
