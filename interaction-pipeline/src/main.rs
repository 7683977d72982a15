use std::str::FromStr;
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use interaction_common::classifier::ClassifierRegistry;
use interaction_common::event;
use interaction_common::health::HealthRegistry;
use interaction_common::kv::{FailureCounter, KeyValueStore, MemoryStore, ProfileCache, RedisStore};
use interaction_common::metrics::setup_metrics_recorder;
use interaction_common::storage::{Backend, InteractionStore};
use interaction_pipeline::callback::CallbackDispatcher;
use interaction_pipeline::cleanup::RetentionCleaner;
use interaction_pipeline::config::Config;
use interaction_pipeline::dispatcher::EventDispatcher;
use interaction_pipeline::error::PipelineError;
use interaction_pipeline::handlers;
use interaction_pipeline::lifecycle::Coordinator;

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("failed to install SIGTERM handler, only SIGINT stops the pipeline: {}", e);
            if let Err(e) = ctrl_c.await {
                error!("failed to listen for SIGINT: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env()?;

    let backend = Backend::from_str(&config.database_driver)?;
    let store =
        InteractionStore::connect(backend, &config.database_url, config.max_db_connections)
            .await?;
    store.migrate().await?;

    let kv: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::new(url).await?),
        None => {
            info!("REDIS_URL not set, keeping failure counters and profiles in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let recorder_handle = setup_metrics_recorder()?;
    let liveness = HealthRegistry::new("liveness");
    let tasks = TaskTracker::new();
    let (producer, stream) = event::channel(config.event_buffer_size);

    let callbacks = CallbackDispatcher::new(
        config.callback_request_timeout.0,
        config.retry_policy.policy(),
        FailureCounter::new(kv.clone()),
        config.max_callback_failures,
    )
    .map_err(PipelineError::ClientError)?;

    let cleaner = Arc::new(RetentionCleaner::new(
        store.clone(),
        ProfileCache::new(kv),
        config.default_retention_interval_secs,
        config.retention_profile_fallback,
    ));

    let dispatcher = EventDispatcher::new(
        store.clone(),
        callbacks,
        cleaner,
        tasks.clone(),
        liveness.register("event_dispatcher", time::Duration::seconds(30)),
    )
    .classifiers(ClassifierRegistry::with_defaults())
    .insert_failure_policy(config.insert_failure_policy)
    .cleanup_interval(config.cleanup_interval())
    .max_concurrent_callbacks(config.max_concurrent_callbacks);

    let mut coordinator = Coordinator::new(store, tasks);
    coordinator.spawn_dispatcher(dispatcher, stream)?;

    // The router holds the only producer: once the listener stops, the stream closes.
    let app = handlers::app(
        producer,
        liveness,
        Some(recorder_handle),
        config.max_body_size,
        config.concurrency_limit,
    );
    coordinator.start(app, &config.bind()).await?;

    let dispatcher_stopped = coordinator.dispatcher_stopped();
    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        _ = dispatcher_stopped.cancelled() => error!("event dispatcher stopped before shutdown"),
    }

    let report = coordinator.shutdown(config.shutdown_timeout.0).await?;
    info!(
        persisted = report.dispatch.persisted,
        abandoned_tasks = report.abandoned_tasks,
        "interaction pipeline stopped"
    );

    Ok(())
}
