//! # Event
//!
//! Interaction records and the closable stream that carries them from the listeners to the
//! dispatcher.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// A DNS resolution of one of a user's assigned identifiers.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct DnsInteraction {
    pub user_id: i64,
    pub domain: String,
    pub ip: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

/// An HTTP request hitting one of a user's assigned paths.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct HttpInteraction {
    pub user_id: i64,
    pub url: String,
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub content_type: String,
    pub method: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

/// Every kind of interaction the pipeline knows how to persist.
/// New kinds of interactions are added as new variants, so every consumer has to handle them.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InteractionRecord {
    Dns(DnsInteraction),
    Http(HttpInteraction),
}

impl InteractionRecord {
    pub fn user_id(&self) -> i64 {
        match self {
            InteractionRecord::Dns(dns) => dns.user_id,
            InteractionRecord::Http(http) => http.user_id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            InteractionRecord::Dns(dns) => dns.created_at,
            InteractionRecord::Http(http) => http.created_at,
        }
    }

    /// Short name of the variant, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            InteractionRecord::Dns(_) => "dns",
            InteractionRecord::Http(_) => "http",
        }
    }

    /// The URL to notify about this interaction.
    /// Only present when a non-empty callback was set and the record belongs to a real user.
    pub fn callback_target(&self) -> Option<&str> {
        let callback = match self {
            InteractionRecord::Dns(dns) => dns.callback.as_deref(),
            InteractionRecord::Http(http) => http.callback.as_deref(),
        };

        match callback {
            Some(url) if !url.is_empty() && self.user_id() > 0 => Some(url),
            _ => None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("the interaction event stream is closed")]
pub struct EventStreamClosed;

/// Create a bounded event stream.
/// The stream closes once every `EventProducer` has been dropped and all buffered records were read.
pub fn channel(capacity: usize) -> (EventProducer, EventStream) {
    let (sender, receiver) = mpsc::channel(capacity);

    (EventProducer { sender }, EventStream { receiver })
}

/// Producing half of the event stream, handed to every interaction listener.
#[derive(Clone, Debug)]
pub struct EventProducer {
    sender: mpsc::Sender<InteractionRecord>,
}

impl EventProducer {
    /// Enqueue a record, waiting for buffer space if the dispatcher is behind.
    pub async fn send(&self, record: InteractionRecord) -> Result<(), EventStreamClosed> {
        self.sender.send(record).await.map_err(|_| EventStreamClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consuming half of the event stream. There is exactly one, owned by the dispatcher.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::Receiver<InteractionRecord>,
}

impl EventStream {
    /// Next record in delivery order, or `None` once the stream is closed and drained.
    pub async fn next(&mut self) -> Option<InteractionRecord> {
        self.receiver.recv().await
    }

    /// Refuse any further records. Records already buffered can still be drained.
    pub fn close(&mut self) {
        self.receiver.close()
    }
}
