use anyhow::{Context, Result};
use axum::http::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use task_bridge::config::{Config, StoreBackend};
use task_bridge::ingest::Ingestor;
use task_bridge::notify::{SharedNotifier, TelegramNotifier};
use task_bridge::pyrus::PyrusClient;
use task_bridge::scheduler::ReopenWindowScheduler;
use task_bridge::server::{AppState, build_router};
use task_bridge::store::{MemoryStore, RedisStore, SharedStore};
use task_bridge::windows::ReopenWindows;
use task_bridge::worker::EventWorker;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::from_env().context("load bridge config")?;
    if !config.webhook_verify_signature {
        warn!("webhook signature verification is disabled");
    }
    if config.frontend_api_key.is_none() {
        warn!("FRONTEND_API_KEY is not set; /users routes will reject every request");
    }

    let store: SharedStore = match config.store_backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.redis_url)
                .await
                .context("connect coordination store")?,
        ),
        StoreBackend::Memory => {
            warn!("using in-process coordination store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let client =
        PyrusClient::new(config.pyrus.clone(), store.clone()).context("initialize pyrus client")?;
    let notifier: SharedNotifier = Arc::new(
        TelegramNotifier::new(
            &config.telegram_api_base,
            &config.bot_token,
            Duration::from_secs(config.pyrus.http_timeout_seconds),
        )
        .context("initialize telegram notifier")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = EventWorker::new(&config, store.clone(), notifier.clone());
    let worker_alive = Arc::new(AtomicBool::new(true));
    let worker_alive_for_task = worker_alive.clone();
    let worker_shutdown = shutdown_rx.clone();
    let worker_handle = tokio::spawn(async move {
        worker.run(worker_shutdown).await;
        worker_alive_for_task.store(false, Ordering::SeqCst);
    });

    let scheduler =
        ReopenWindowScheduler::new(&config, client.clone(), store.clone(), notifier.clone());
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    let refresh_handle = (config.pyrus.token_refresh_interval_seconds > 0).then(|| {
        let client = client.clone();
        let interval = Duration::from_secs(config.pyrus.token_refresh_interval_seconds);
        let refresh_shutdown = shutdown_rx.clone();
        tokio::spawn(async move { client.run_token_refresh(interval, refresh_shutdown).await })
    });

    let state = Arc::new(AppState {
        ingestor: Ingestor::new(&config, store.clone()),
        windows: ReopenWindows::new(&config, client, store.clone()),
        store,
        worker_alive,
        config,
    });

    let period_ms = ip_refill_period_ms(state.config.ip_limit_per_minute);
    let mut governor_builder = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .use_headers();
    governor_builder
        .per_millisecond(period_ms)
        .burst_size(state.config.ip_limit_per_minute)
        .methods(vec![Method::POST]);
    let governor_config = Arc::new(
        governor_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("build governor config"))?,
    );

    let app = build_router(state.clone()).layer(GovernorLayer::new(governor_config));

    let listener = TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("bind {}", state.config.bind_addr))?;

    info!(bind = %state.config.bind_addr, "task bridge listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    server.await.context("serve task bridge")?;

    info!("shutting down background loops");
    let _ = shutdown_tx.send(true);
    if let Err(error) = worker_handle.await {
        warn!(error = %error, "event worker task ended abnormally");
    }
    if let Err(error) = scheduler_handle.await {
        warn!(error = %error, "scheduler task ended abnormally");
    }
    if let Some(handle) = refresh_handle
        && let Err(error) = handle.await
    {
        warn!(error = %error, "token refresh task ended abnormally");
    }

    Ok(())
}

fn ip_refill_period_ms(limit_per_minute: u32) -> u64 {
    if limit_per_minute == 0 {
        return 1;
    }

    let period = 60_000u64 / u64::from(limit_per_minute);
    period.max(1)
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
