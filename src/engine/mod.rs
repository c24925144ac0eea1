pub mod api;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod queue;
pub mod sandbox;
pub mod security;
pub mod service;
pub mod store;
pub mod testcases;
pub mod worker;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, anyhow};

use crate::engine::{
    api::routes,
    config::JudgeConfig,
    metrics::MetricsRegistry,
    monitor::ResourceMonitor,
    notify::{LogNotifier, VerdictNotifier, WebhookNotifier},
    queue::JobQueue,
    sandbox::LanguageTable,
    security::SecurityManager,
    service::{JudgingService, ServiceDeps},
    testcases::DirectoryTestCases,
    worker::WorkerPool,
};

pub async fn run() -> anyhow::Result<()> {
    let config = JudgeConfig::from_env().context("invalid configuration")?;
    init_tracing(&config);

    let queue = JobQueue::from_config(&config.queue)
        .await
        .context("queue backend init failed")?;
    queue.ping().await.context("queue backend unreachable")?;
    let store = store::from_config(&config.store)
        .await
        .context("submission store init failed")?;

    let languages = match &config.sandbox.languages_path {
        Some(path) => LanguageTable::from_file(path).map_err(|e| anyhow!(e))?,
        None => LanguageTable::builtin(),
    };
    let sandbox = sandbox::select(&config.sandbox)
        .await
        .context("sandbox backend init failed")?;
    let security = SecurityManager::new(config.security.clone())
        .context("security policy init failed")?;

    let notifier: Arc<dyn VerdictNotifier> = match &config.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.clone(), config.webhook_timeout_ms)
                .context("webhook client init failed")?,
        ),
        None => Arc::new(LogNotifier),
    };

    let deps = ServiceDeps {
        store,
        queue: queue.clone(),
        sandbox,
        security: Arc::new(security),
        languages: Arc::new(languages),
        testcases: Arc::new(DirectoryTestCases::new(config.testcases_root.clone())),
        notifier,
        metrics: Arc::new(MetricsRegistry::new()),
    };
    let service = Arc::new(JudgingService::new(deps, &config));

    let monitor = Arc::new(ResourceMonitor::new(&config.monitor));
    monitor.start().await;

    let pool = if config.role.runs_workers() {
        Some(
            WorkerPool::start(&config.workers, queue.clone(), service.clone())
                .await
                .context("worker pool start failed")?,
        )
    } else {
        None
    };

    if config.role.runs_api() {
        let app = routes(service, monitor.clone());
        let listener = tokio::net::TcpListener::bind(config.bind_addr)
            .await
            .context("failed to bind listener")?;
        let local = listener
            .local_addr()
            .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
        tracing::info!(bind = %local, role = ?config.role, "judging engine ready");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("http server error")?;
    } else {
        tracing::info!(role = ?config.role, "judging engine ready");
        shutdown_signal().await;
    }

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    monitor.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn init_tracing(config: &JudgeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
