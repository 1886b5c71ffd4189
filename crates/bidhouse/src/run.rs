use {
    crate::{
        arguments::Arguments,
        broadcast::Broadcaster,
        database::{Persisting, PoolConfig, Postgres},
        hotstore::{self, HotStore, HotStoring},
        leaderboard::LeaderboardReader,
        monitor::SessionMonitor,
        persister::BatchPersister,
        session_cache::SessionParamCache,
    },
    clap::Parser,
    observe::metrics::LivenessChecking,
    std::sync::Arc,
    tokio::task,
};

pub async fn start(args: impl Iterator<Item = String>) {
    let args = Arguments::parse_from(args);
    observe::tracing::initialize(&args.log_filter, args.log_stderr_threshold);
    tracing::info!("running bidhouse with validated arguments:\n{}", args);
    observe::metrics::setup_registry(Some("bidhouse".into()), None);
    run(args).await;
}

struct Liveness {
    hot: Arc<dyn HotStoring>,
}

#[async_trait::async_trait]
impl LivenessChecking for Liveness {
    async fn is_alive(&self) -> bool {
        self.hot.is_alive().await
    }
}

/// Hosts the background half of the pipeline: the batch persister, the
/// session monitor and the push fan-out. The request-facing half is the
/// [`crate::api::Api`] facade, mounted by the transport layer on the same
/// component set.
pub async fn run(args: Arguments) {
    // Startup order: durable pool, hot store pool, caches, broadcaster,
    // background jobs. Shutdown runs in reverse.
    let postgres = Postgres::new(
        &args.db_url,
        PoolConfig {
            size: args.durable_pool_size,
            overflow: args.durable_pool_overflow,
            timeout: args.durable_pool_timeout_seconds,
            proxied: args.proxy_mode,
        },
    )
    .await
    .expect("failed to connect to the durable store");
    let db: Arc<dyn Persisting> = Arc::new(postgres.clone());

    let hot: Arc<dyn HotStoring> = Arc::new(
        HotStore::new(
            &args.hot_store_url,
            args.hot_store_max_connections,
            hotstore::DEFAULT_OP_TIMEOUT,
        )
        .expect("failed to create the hot store pool"),
    );

    let sessions = Arc::new(SessionParamCache::new(hot.clone(), db.clone()));
    let broadcaster = Arc::new(Broadcaster::default());
    let reader = Arc::new(LeaderboardReader::new(hot.clone(), db.clone(), sessions));

    let persister = Arc::new(BatchPersister::new(
        hot.clone(),
        db.clone(),
        args.batch_interval_seconds,
        args.persister_max_consecutive_failures,
    ));
    let monitor = Arc::new(SessionMonitor::new(
        hot.clone(),
        db.clone(),
        persister.clone(),
        broadcaster.clone(),
        args.monitor_interval_seconds,
    ));

    let persister_job = task::spawn(persister.clone().run_forever());
    let monitor_job = task::spawn(monitor.run_forever());
    let broadcast_job = task::spawn(broadcaster.run_forever(reader, db));

    observe::metrics::serve_metrics(Arc::new(Liveness { hot }), args.metrics_address);

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for the shutdown signal");
    tracing::info!("shutting down");

    // Nothing may finalize or notify while we drain, and whatever is still
    // buffered in the hot store gets one last chance to reach the durable
    // store before the pools close.
    monitor_job.abort();
    broadcast_job.abort();
    persister_job.abort();
    if let Err(err) = persister.run_once().await {
        tracing::error!(?err, "final persist flush failed");
    }
    postgres.0.close().await;
}
