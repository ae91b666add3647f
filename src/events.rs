//! Domain event publication.
//!
//! Events announce lifecycle milestones to whatever sink is wired in. They
//! are strictly best-effort: a publish failure is logged by [`publish`] and
//! never retried, and never interrupts the operation that raised it.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event sink unavailable: {0}")]
    SinkUnavailable(String),
}

/// Common envelope fields on every event.
#[derive(Debug, Clone, Serialize)]
pub struct EventHeader {
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
}

impl EventHeader {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum Event {
    /// A clone workflow has begun.
    CloneStarted {
        header: EventHeader,
        source_cluster: String,
        target_cluster: String,
        workflow_id: String,
    },
    /// A clone workflow produced its target cluster.
    CloneCompleted {
        header: EventHeader,
        source_cluster: String,
        target_cluster: String,
        workflow_id: String,
    },
    /// A clone step failed; the task is left incomplete for redrive.
    CloneFailed {
        header: EventHeader,
        source_cluster: String,
        target_cluster: String,
        workflow_id: String,
        error_message: String,
    },
    /// A primary deployment was deleted ahead of promotion.
    PrimaryDeleted {
        header: EventHeader,
        cluster: String,
        deployment: String,
    },
    /// A replica was promoted to primary.
    FailoverPerformed {
        header: EventHeader,
        cluster: String,
        target: String,
    },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), EventError>;
}

/// Publish an event, logging (and swallowing) any failure.
pub async fn publish(publisher: &dyn EventPublisher, event: Event) {
    if let Err(e) = publisher.publish(event).await {
        warn!(error = %e, "failed to publish event");
    }
}

/// Publisher that emits events to the log stream.
#[derive(Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: Event) -> Result<(), EventError> {
        match serde_json::to_string(&event) {
            Ok(body) => info!(event = %body, "event published"),
            Err(e) => warn!(error = %e, "event could not be serialized"),
        }
        Ok(())
    }
}

/// Publisher that records events in memory, for tests.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<Event>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event lock poisoned").clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: Event) -> Result<(), EventError> {
        self.events.lock().expect("event lock poisoned").push(event);
        Ok(())
    }
}
