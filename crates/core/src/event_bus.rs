//! Engine event bus: trait for emitting lifecycle events from any module.
//!
//! Modules accept an `Arc<dyn EventSink>` and emit enrollment, queue and
//! engagement events. Production sinks forward them to the analytics
//! pipeline; tests use [`CaptureSink`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    // Subscriber lifecycle
    SubscriberEnrolled,
    SubscriberPaused,
    SubscriberResumed,
    SubscriberCompleted,
    SubscriberUnsubscribed,
    // Send queue
    EmailQueued,
    EmailSent,
    EmailRetried,
    EmailFailed,
    EmailCancelled,
    // Engagement
    EngagementRecorded,
}

/// A single engine lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    pub tenant_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub subscriber_id: Option<Uuid>,
    pub queue_item_id: Option<Uuid>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Builder for subscriber-scoped events.
pub fn make_event(
    event_type: EngineEventType,
    tenant_id: Uuid,
    campaign_id: Option<Uuid>,
    subscriber_id: Option<Uuid>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        tenant_id,
        campaign_id,
        subscriber_id,
        queue_item_id: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

impl EngineEvent {
    pub fn with_queue_item(mut self, queue_item_id: Uuid) -> Self {
        self.queue_item_id = Some(queue_item_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
