use std::net::SocketAddr;
use std::time;

use axum::Router;
use interaction_common::event::EventStream;
use interaction_common::storage::InteractionStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::dispatcher::{DispatchSummary, EventDispatcher};
use crate::error::{DispatchError, LifecycleError};

struct Listener {
    shutdown: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub dispatch: DispatchSummary,
    /// False if the listener had to be aborted after the deadline.
    pub listener_stopped: bool,
    /// Callback or cleanup tasks still running when the deadline passed.
    pub abandoned_tasks: usize,
    pub storage_closed: bool,
}

/// Owns the listener, the dispatcher task and the storage pool, and tears them down in order.
pub struct Coordinator {
    store: InteractionStore,
    tasks: TaskTracker,
    dispatcher: Option<JoinHandle<Result<DispatchSummary, DispatchError>>>,
    dispatcher_stopped: CancellationToken,
    listener: Option<Listener>,
}

impl Coordinator {
    /// `tasks` must be the tracker the dispatcher spawns its callbacks and cleanups on.
    pub fn new(store: InteractionStore, tasks: TaskTracker) -> Self {
        Self {
            store,
            tasks,
            dispatcher: None,
            dispatcher_stopped: CancellationToken::new(),
            listener: None,
        }
    }

    pub fn spawn_dispatcher(
        &mut self,
        dispatcher: EventDispatcher,
        stream: EventStream,
    ) -> Result<(), LifecycleError> {
        if self.dispatcher.is_some() {
            return Err(LifecycleError::AlreadyStarted("event dispatcher"));
        }

        let stopped = self.dispatcher_stopped.clone();
        self.dispatcher = Some(tokio::spawn(async move {
            // Fires even if the dispatcher panics.
            let _stopped = stopped.drop_guard();
            dispatcher.run(stream).await
        }));

        Ok(())
    }

    /// Cancelled once the dispatcher returns, for whatever reason.
    pub fn dispatcher_stopped(&self) -> CancellationToken {
        self.dispatcher_stopped.clone()
    }

    /// Bind `bind` and serve `router` on it until shutdown.
    pub async fn start(&mut self, router: Router, bind: &str) -> Result<SocketAddr, LifecycleError> {
        if self.listener.is_some() {
            return Err(LifecycleError::AlreadyStarted("listener"));
        }

        let bind_error = |error| LifecycleError::BindError {
            bind: bind.to_owned(),
            error,
        };
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        info!("listening on {}", addr);
        self.listener = Some(Listener { shutdown, handle });

        Ok(addr)
    }

    /// Stop everything, in order: the listener, the dispatcher, outstanding tasks, storage.
    ///
    /// The event source must have stopped producing before this is called, otherwise the
    /// dispatcher never sees its stream close and this waits forever. The listener and the
    /// outstanding tasks each get up to `deadline`.
    pub async fn shutdown(
        &mut self,
        deadline: time::Duration,
    ) -> Result<ShutdownReport, LifecycleError> {
        let listener_stopped = match self.listener.take() {
            Some(listener) => stop_listener(listener, deadline).await,
            None => true,
        };

        let dispatch = match self.dispatcher.take() {
            Some(handle) => match handle.await {
                Ok(result) => result.map_err(LifecycleError::from),
                Err(error) => Err(LifecycleError::DispatcherJoinError(error)),
            },
            None => Err(LifecycleError::DispatcherNotStarted),
        };

        self.tasks.close();
        let abandoned_tasks = match tokio::time::timeout(deadline, self.tasks.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let abandoned = self.tasks.len();
                warn!(abandoned, "outstanding tasks did not finish before the deadline");
                abandoned
            }
        };

        // Abandoned cleanups may still hold a connection, so closing is bounded too.
        let storage_closed = match tokio::time::timeout(deadline, self.store.close()).await {
            Ok(()) => true,
            Err(_) => {
                warn!("storage pool did not close before the deadline");
                false
            }
        };

        let dispatch = dispatch?;
        info!(
            persisted = dispatch.persisted,
            abandoned_tasks, "pipeline shut down"
        );

        Ok(ShutdownReport {
            dispatch,
            listener_stopped,
            abandoned_tasks,
            storage_closed,
        })
    }
}

async fn stop_listener(listener: Listener, deadline: time::Duration) -> bool {
    listener.shutdown.cancel();
    let mut handle = listener.handle;

    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(error))) => {
            error!("listener failed: {}", error);
            true
        }
        Ok(Err(error)) => {
            error!("listener task failed: {}", error);
            true
        }
        Err(_) => {
            warn!("listener did not stop within {:?}, aborting", deadline);
            handle.abort();
            false
        }
    }
}
