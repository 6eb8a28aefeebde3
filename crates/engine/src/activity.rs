//! Fire-and-forget activity log.
//!
//! Events go onto a bounded channel with `try_send`. A full or closed queue
//! drops the event; the caller never waits. A single worker task drains the
//! queue into an [`ActivitySink`]. Delivery is at most once.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vault_core::{FileId, OwnerId, RequestContext};
use vault_metadata::MetadataStore;
use vault_metadata::models::ActivityRow;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityAction {
    Upload,
    Download,
    Delete,
    TagAdd,
    TagRemove,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Delete => "delete",
            Self::TagAdd => "tag_add",
            Self::TagRemove => "tag_remove",
        }
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One activity record.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub owner_id: OwnerId,
    pub action: ActivityAction,
    pub file_id: Option<FileId>,
    pub trace_id: String,
    pub detail: Option<String>,
    pub at: OffsetDateTime,
}

impl ActivityEvent {
    pub fn new(ctx: &RequestContext, action: ActivityAction, file_id: Option<FileId>) -> Self {
        Self {
            owner_id: ctx.owner_id,
            action,
            file_id,
            trace_id: ctx.trace_id.as_str().to_string(),
            detail: None,
            at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for activity events.
#[async_trait]
pub trait ActivitySink: Send + Sync + 'static {
    async fn record(
        &self,
        event: &ActivityEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Writes events to the tracing log only.
pub struct TracingSink;

#[async_trait]
impl ActivitySink for TracingSink {
    async fn record(
        &self,
        event: &ActivityEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(
            target: "vault::activity",
            owner_id = %event.owner_id,
            action = %event.action,
            file_id = ?event.file_id,
            trace_id = %event.trace_id,
            detail = ?event.detail,
            "activity"
        );
        Ok(())
    }
}

/// Writes events to the metadata store's activity log.
pub struct MetadataSink {
    metadata: Arc<dyn MetadataStore>,
}

impl MetadataSink {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl ActivitySink for MetadataSink {
    async fn record(
        &self,
        event: &ActivityEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let row = ActivityRow {
            id: Uuid::new_v4(),
            owner_id: *event.owner_id.as_uuid(),
            action: event.action.as_str().to_string(),
            file_id: event.file_id.map(|id| *id.as_uuid()),
            trace_id: event.trace_id.clone(),
            detail: event.detail.clone(),
            created_at: event.at,
        };
        self.metadata.record_activity(&row).await?;
        Ok(())
    }
}

/// Handle for enqueueing activity events.
pub struct ActivityQueue {
    tx: Option<mpsc::Sender<ActivityEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl ActivityQueue {
    /// Start the worker task. Must be called from within a Tokio runtime.
    pub fn spawn(capacity: usize, sink: Arc<dyn ActivitySink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ActivityEvent>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.record(&event).await {
                    tracing::warn!(
                        owner_id = %event.owner_id,
                        action = %event.action,
                        error = %e,
                        "Dropping activity event after sink failure"
                    );
                }
            }
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// A queue that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            worker: None,
        }
    }

    /// Enqueue an event without waiting.
    pub fn emit(&self, event: ActivityEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    owner_id = %event.owner_id,
                    action = %event.action,
                    "Activity queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(
                    owner_id = %event.owner_id,
                    action = %event.action,
                    "Activity queue closed, dropping event"
                );
            }
        }
    }

    /// Stop accepting events and wait for queued ones to be written.
    pub async fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Activity worker panicked");
            }
        }
    }
}
