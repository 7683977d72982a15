use interaction_common::kv::KvError;
use interaction_common::storage::StorageError;
use thiserror::Error;

/// Enumeration of errors related to delivering a single callback.
#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("error parsing callback url")]
    ParseUrlError(url::ParseError),
    #[error("callback could not be delivered after {attempts} attempts: {error}")]
    RetriesExhausted { attempts: u32, error: reqwest::Error },
}

/// Enumeration of errors that stop the event dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to open the dispatcher storage session: {0}")]
    SessionError(StorageError),
    #[error("failed to persist a {kind} interaction: {error}")]
    PersistError {
        kind: &'static str,
        error: StorageError,
    },
}

/// Enumeration of errors raised while starting or stopping the pipeline.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("failed to bind listener on {bind}: {error}")]
    BindError {
        bind: String,
        error: std::io::Error,
    },
    #[error("the {0} is already running")]
    AlreadyStarted(&'static str),
    #[error("the event dispatcher was never started")]
    DispatcherNotStarted,
    #[error("the event dispatcher failed: {0}")]
    DispatcherFailed(#[from] DispatchError),
    #[error("the event dispatcher task panicked or was cancelled: {0}")]
    DispatcherJoinError(tokio::task::JoinError),
}

/// Enumeration of errors that abort the pipeline process.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("key/value store error: {0}")]
    KvError(#[from] KvError),
    #[error("failed to build the callback client: {0}")]
    ClientError(reqwest::Error),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    LifecycleError(#[from] LifecycleError),
}
