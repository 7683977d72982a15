//! # EventDispatcher
//!
//! The only consumer of the event stream. Every interaction is persisted through a single
//! storage session, strictly one at a time and in the order it was received, before any
//! callback for it is spawned. A timer on the same loop starts retention cleanups, which run
//! on their own tasks and their own sessions.
use std::sync::Arc;
use std::time;

use interaction_common::classifier::ClassifierRegistry;
use interaction_common::event::{EventStream, InteractionRecord};
use interaction_common::health::{ComponentStatus, HealthHandle};
use interaction_common::storage::{InteractionStore, Session};
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackDispatcher;
use crate::cleanup::Cleaner;
use crate::config::InsertFailurePolicy;
use crate::error::DispatchError;

const DEFAULT_CLEANUP_INTERVAL: time::Duration = time::Duration::from_secs(1800);
const DEFAULT_LIVENESS_INTERVAL: time::Duration = time::Duration::from_secs(10);
const DEFAULT_MAX_CONCURRENT_CALLBACKS: usize = 1024;

/// What happened during one run of the dispatcher loop.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct DispatchSummary {
    pub persisted: u64,
    pub skipped: u64,
    pub callbacks_dispatched: u64,
    pub callbacks_suppressed: u64,
    pub cleanups_started: u64,
}

pub struct EventDispatcher {
    store: InteractionStore,
    callbacks: Arc<CallbackDispatcher>,
    cleaner: Arc<dyn Cleaner>,
    /// Every callback and cleanup task is spawned here so shutdown can wait for them.
    tasks: TaskTracker,
    liveness: HealthHandle,
    classifiers: ClassifierRegistry,
    insert_failure_policy: InsertFailurePolicy,
    cleanup_interval: time::Duration,
    liveness_interval: time::Duration,
    /// Bounds the number of callbacks in flight. Dispatch waits for a permit.
    callback_permits: Arc<Semaphore>,
}

impl EventDispatcher {
    pub fn new(
        store: InteractionStore,
        callbacks: CallbackDispatcher,
        cleaner: Arc<dyn Cleaner>,
        tasks: TaskTracker,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            callbacks: Arc::new(callbacks),
            cleaner,
            tasks,
            liveness,
            classifiers: ClassifierRegistry::with_defaults(),
            insert_failure_policy: InsertFailurePolicy::Fatal,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            callback_permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_CALLBACKS)),
        }
    }

    /// Decides which insert failures are duplicates of an already stored record.
    pub fn classifiers(mut self, classifiers: ClassifierRegistry) -> Self {
        self.classifiers = classifiers;
        self
    }

    pub fn insert_failure_policy(mut self, policy: InsertFailurePolicy) -> Self {
        self.insert_failure_policy = policy;
        self
    }

    /// Time between retention cleanups. The first one starts after a full interval.
    pub fn cleanup_interval(mut self, interval: time::Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// How often the loop reports healthy while idle.
    pub fn liveness_interval(mut self, interval: time::Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Callbacks allowed in flight at once. While all of them are taken the loop stops reading
    /// the stream, but keeps reporting healthy every liveness interval.
    pub fn max_concurrent_callbacks(mut self, max: usize) -> Self {
        self.callback_permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Consume `stream` until it is closed and drained, or until a persistence failure stops
    /// the loop under `InsertFailurePolicy::Fatal`.
    pub async fn run(self, mut stream: EventStream) -> Result<DispatchSummary, DispatchError> {
        let result = self.dispatch_loop(&mut stream).await;

        match &result {
            Ok(summary) => {
                info!(
                    persisted = summary.persisted,
                    skipped = summary.skipped,
                    callbacks = summary.callbacks_dispatched,
                    "event stream closed, dispatcher finished"
                );
                self.liveness.report_status(ComponentStatus::Finished);
            }
            Err(error) => {
                error!("event dispatcher stopped: {}", error);
                // Producers get an error from now on instead of filling a buffer nobody reads.
                stream.close();
                self.liveness.report_status(ComponentStatus::Unhealthy);
            }
        }

        result
    }

    async fn dispatch_loop(
        &self,
        stream: &mut EventStream,
    ) -> Result<DispatchSummary, DispatchError> {
        let mut session = self
            .store
            .session()
            .await
            .map_err(DispatchError::SessionError)?;
        let mut summary = DispatchSummary::default();

        let cleanup_running = Arc::new(Semaphore::new(1));
        let mut cleanup_timer =
            tokio::time::interval_at(Instant::now() + self.cleanup_interval, self.cleanup_interval);
        cleanup_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness_timer = tokio::time::interval(self.liveness_interval);
        liveness_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                record = stream.next() => {
                    let Some(record) = record else {
                        return Ok(summary);
                    };
                    self.process(&mut session, record, &mut summary).await?;
                    self.liveness.report_healthy();
                }
                _ = cleanup_timer.tick() => {
                    self.spawn_cleanup(&cleanup_running, &mut summary);
                }
                _ = liveness_timer.tick() => {
                    self.liveness.report_healthy();
                }
            }
        }
    }

    async fn process(
        &self,
        session: &mut Session,
        record: InteractionRecord,
        summary: &mut DispatchSummary,
    ) -> Result<(), DispatchError> {
        let kind = record.kind();
        let user_id = record.user_id();
        metrics::counter!("interaction_events_total", "kind" => kind).increment(1);

        if let Err(error) = session.insert(&record).await {
            let backend = self.store.backend().name();
            if error
                .sqlx_error()
                .is_some_and(|e| self.classifiers.is_duplicate(e, backend))
            {
                // Already stored, nothing to persist or notify.
                info!(user_id, kind, "ignoring duplicate interaction");
                summary.skipped += 1;
                return Ok(());
            }

            metrics::counter!("interaction_persist_failures_total", "kind" => kind).increment(1);

            match self.insert_failure_policy {
                InsertFailurePolicy::Fatal => return Err(DispatchError::PersistError { kind, error }),
                InsertFailurePolicy::Skip => {
                    error!(user_id, kind, "dropping interaction that failed to persist: {}", error);
                    summary.skipped += 1;
                    return Ok(());
                }
            }
        }
        summary.persisted += 1;

        let Some(url) = record.callback_target() else {
            return Ok(());
        };

        if self.callbacks.is_suppressed(user_id).await {
            debug!(user_id, "too many failed callbacks, not dispatching");
            metrics::counter!("callback_skipped_total").increment(1);
            summary.callbacks_suppressed += 1;
            return Ok(());
        }

        let permit = loop {
            let acquire = self.callback_permits.clone().acquire_owned();
            match tokio::time::timeout(self.liveness_interval, acquire).await {
                Ok(Ok(permit)) => break permit,
                Ok(Err(error)) => {
                    warn!(user_id, "callback permits are gone, not dispatching: {}", error);
                    return Ok(());
                }
                // Saturated by slow callbacks, which is not the loop being stuck.
                Err(_) => self.liveness.report_healthy(),
            }
        };

        let callbacks = self.callbacks.clone();
        let url = url.to_owned();
        self.tasks.spawn(async move {
            if let Err(error) = callbacks.deliver(user_id, &url).await {
                debug!(user_id, "callback task finished with error: {}", error);
            }
            drop(permit);
        });
        summary.callbacks_dispatched += 1;

        Ok(())
    }

    /// Start a cleanup unless the previous one is still going.
    fn spawn_cleanup(&self, running: &Arc<Semaphore>, summary: &mut DispatchSummary) {
        let permit = match running.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("previous retention cleanup still running, skipping this one");
                return;
            }
        };

        let cleaner = self.cleaner.clone();
        self.tasks.spawn(async move {
            cleaner.cleanup().await;
            drop(permit);
        });
        summary.cleanups_started += 1;
    }
}
