//! ChainPay Reconciler - multi-chain stablecoin payment reconciliation
//!
//! Polls public explorer APIs for transfers into the service's receiving
//! wallets, matches each one to the pending order expecting that exact
//! amount, and settles the order exactly once before notifying the merchant.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod callback;
mod chain;
mod config;
mod error;
mod lock;
mod matcher;
mod metrics;
mod notify;
mod scheduler;
mod state;

use callback::{CallbackDispatcher, CallbackWorker, HttpCallbackSender};
use chain::{ChainFamily, ChainRegistry};
use config::{CacheBackend, Settings};
use lock::{LockCache, LockStore, MemoryCache, RedisCache};
use matcher::OrderMatcher;
use metrics::MetricsServer;
use scheduler::{CallbackSweepJob, ExpirySweepJob, JobGuards, ScanJob, Scheduler};
use state::{OrderStore, PgStore, WalletDirectory};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting ChainPay Reconciler v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.reconciler.instance_id
    );

    // Initialize database connection
    let store = Arc::new(PgStore::new(&settings.database).await?);
    info!("Database connection established");
    store.run_migrations().await?;

    let orders: Arc<dyn OrderStore> = store.clone();
    let wallets: Arc<dyn WalletDirectory> = store;

    // Wallet lock cache
    let cache: Arc<dyn LockCache> = match settings.cache.backend {
        CacheBackend::Redis => {
            let url = settings.cache.redis_url.as_deref().unwrap_or_default();
            Arc::new(RedisCache::connect(url).await?)
        }
        CacheBackend::Memory => {
            warn!("Using the in-process lock cache - locks are not shared with the order issuer");
            Arc::new(MemoryCache::new())
        }
    };
    let locks = LockStore::new(cache);
    locks.health_check().await?;
    info!("Lock cache connected");

    // Chain adapters, selected once
    let registry = ChainRegistry::from_settings(&settings)?;

    // Callback delivery
    let (dispatcher, callback_rx) = CallbackDispatcher::new(orders.clone(), &settings.callback);
    let dispatcher = Arc::new(dispatcher);
    let callback_worker = Arc::new(CallbackWorker::new(
        dispatcher.clone(),
        orders.clone(),
        Arc::new(HttpCallbackSender::new(Duration::from_secs(
            settings.callback.timeout_secs,
        ))?),
        settings.callback.signing_token.clone(),
        Duration::from_millis(settings.callback.backoff_base_ms),
    ));

    let notifier = notify::from_config(&settings.notify)?;
    let matcher = Arc::new(OrderMatcher::new(
        locks.clone(),
        orders.clone(),
        dispatcher.clone(),
        notifier,
    ));

    // Periodic jobs, one guard per job type
    let mut scheduler = Scheduler::new(Arc::new(JobGuards::new()));
    for family in [ChainFamily::Tron, ChainFamily::Evm] {
        let job = ScanJob::new(
            family,
            registry.family(family),
            wallets.clone(),
            locks.clone(),
            matcher.clone(),
            settings.scan_interval(),
        );
        if !job.is_empty() {
            scheduler.register(Arc::new(job));
        }
    }
    scheduler.register(Arc::new(CallbackSweepJob::new(
        dispatcher.clone(),
        Duration::from_secs(settings.reconciler.callback_sweep_interval_secs),
    )));
    scheduler.register(Arc::new(ExpirySweepJob::new(
        orders.clone(),
        locks.clone(),
        chrono::Duration::minutes(settings.reconciler.order_expiration_minutes),
        Duration::from_secs(settings.reconciler.expiry_sweep_interval_secs),
    )));
    let scheduler = Arc::new(scheduler);

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            orders: orders.clone(),
            locks: locks.clone(),
            chains: registry.chains(),
            max_callback_attempts: settings.callback.max_attempts as i32,
            started_at: Instant::now(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let callback_handle = tokio::spawn(callback_worker.run(callback_rx));
    let scheduler_handle = tokio::spawn(scheduler.clone().run());

    info!("ChainPay Reconciler is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    scheduler.stop().await;

    // Abort background tasks
    scheduler_handle.abort();
    callback_handle.abort();
    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("ChainPay Reconciler stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,chainpay_reconciler=debug,payment_integrity=error,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
