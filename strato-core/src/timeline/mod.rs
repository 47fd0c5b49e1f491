//! Event/audit timeline.
//!
//! Append-only record of control-plane-significant occurrences. Every append
//! is persisted and also published to a broadcast bus so live subscribers
//! (UI streams, debugging) can follow along with optional wildcard filters:
//!
//! - `"host.*"` - all host events
//! - `"vm.provisioned"` - one event type
//! - empty filter list - everything
//!
//! Retention pruning runs as a periodic sweep driven by the daemon; `append`
//! never prunes synchronously.

use crate::error::Result;
use crate::state::StateManager;
use crate::types::{EventFilter, EventRecord, EventSubjects, EventType};
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Maximum number of events buffered in the broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// Persistent event timeline with live pub/sub.
pub struct EventTimeline {
    state: Arc<StateManager>,
    sender: broadcast::Sender<EventRecord>,
    retention_days: AtomicU32,
}

impl EventTimeline {
    pub fn new(state: Arc<StateManager>, retention_days: u32) -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { state, sender, retention_days: AtomicU32::new(retention_days) }
    }

    /// Append an event to the timeline and publish it to subscribers.
    #[instrument(skip(self, subjects, detail), fields(event_type = %event_type))]
    pub async fn append(
        &self,
        event_type: EventType,
        subjects: EventSubjects,
        detail: impl Into<String>,
    ) -> Result<EventRecord> {
        let event = EventRecord {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.as_str().to_string(),
            subjects,
            detail: detail.into(),
            occurred_at: Utc::now(),
        };

        self.state.insert_event(&event).await?;
        metrics::counter!("strato_events_total", "event_type" => event.event_type.clone())
            .increment(1);

        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event.clone());
        Ok(event)
    }

    /// List events matching a filter, newest first.
    pub async fn list(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        self.state.list_events(filter).await
    }

    /// Current retention window in days.
    pub fn retention_days(&self) -> u32 {
        self.retention_days.load(Ordering::Relaxed)
    }

    /// Change the retention window. Takes effect on the next sweep.
    pub fn set_retention(&self, days: u32) {
        self.retention_days.store(days, Ordering::Relaxed);
    }

    /// Delete events older than the retention window. Returns the count
    /// pruned. Invoked by the daemon's periodic sweep.
    #[instrument(skip(self))]
    pub async fn prune_expired(&self) -> Result<u64> {
        let days = self.retention_days();
        let cutoff = Utc::now() - Duration::days(days as i64);
        let pruned = self.state.prune_events_before(cutoff).await?;
        if pruned > 0 {
            debug!(pruned, days, "Pruned expired events");
        }
        Ok(pruned)
    }

    /// Subscribe to live events, optionally filtered by event type patterns.
    pub fn subscribe(&self, filters: Vec<String>) -> EventSubscriber {
        EventSubscriber { receiver: self.sender.subscribe(), filters }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Live event subscriber with optional filtering.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<EventRecord>,
    filters: Vec<String>,
}

impl EventSubscriber {
    /// Receive the next matching event (blocking).
    pub async fn recv(&mut self) -> Option<EventRecord> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                    // Event doesn't match filters, continue
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event subscriber lagged by {} events", n);
                    // Continue receiving
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    /// Check if an event matches the filters.
    fn matches(&self, event: &EventRecord) -> bool {
        // Empty filters = all events
        if self.filters.is_empty() {
            return true;
        }

        for filter in &self.filters {
            if filter == &event.event_type {
                return true;
            }

            // Wildcard match (e.g. "vm.*")
            if let Some(prefix) = filter.strip_suffix(".*") {
                if event.event_type.starts_with(prefix) {
                    return true;
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    async fn timeline() -> EventTimeline {
        let state = Arc::new(StateManager::new_in_memory().await.unwrap());
        EventTimeline::new(state, 30)
    }

    #[tokio::test]
    async fn test_append_persists_and_publishes() {
        let timeline = timeline().await;
        let mut subscriber = timeline.subscribe(vec![]);

        timeline
            .append(EventType::VmProvisioned, EventSubjects::vm("h1", "vm-123"), "VM provisioned")
            .await
            .unwrap();

        let event =
            tokio::time::timeout(StdDuration::from_millis(100), subscriber.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_type, "vm.provisioned");
        assert_eq!(event.subjects.vm_id.as_deref(), Some("vm-123"));

        let listed = timeline.list(&EventFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event_type, "vm.provisioned");
    }

    #[tokio::test]
    async fn test_filter_match() {
        let timeline = timeline().await;
        let mut subscriber = timeline.subscribe(vec!["host.*".to_string()]);

        // Should NOT be received
        timeline.append(EventType::VmDeleted, EventSubjects::vm("h1", "v1"), "gone").await.unwrap();
        // Should be received
        timeline
            .append(EventType::HostRegistered, EventSubjects::host("h1"), "host registered")
            .await
            .unwrap();

        let event =
            tokio::time::timeout(StdDuration::from_millis(100), subscriber.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_type, "host.registered");
    }

    #[tokio::test]
    async fn test_list_newest_first_with_filters() {
        let timeline = timeline().await;
        timeline.append(EventType::HostRegistered, EventSubjects::host("h1"), "a").await.unwrap();
        timeline.append(EventType::HostUpdated, EventSubjects::host("h1"), "b").await.unwrap();
        timeline.append(EventType::VmProvisioned, EventSubjects::vm("h2", "v1"), "c").await.unwrap();

        let all = timeline.list(&EventFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_type, "vm.provisioned");

        let typed = timeline
            .list(&EventFilter { event_type: Some("host.updated".to_string()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(typed.len(), 1);

        let by_subject = timeline
            .list(&EventFilter { subject: Some("h1".to_string()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_subject.len(), 2);
    }

    #[tokio::test]
    async fn test_retention_setting() {
        let timeline = timeline().await;
        assert_eq!(timeline.retention_days(), 30);
        timeline.set_retention(7);
        assert_eq!(timeline.retention_days(), 7);

        // Nothing old enough to prune
        timeline.append(EventType::HostRegistered, EventSubjects::host("h1"), "x").await.unwrap();
        assert_eq!(timeline.prune_expired().await.unwrap(), 0);
        assert_eq!(timeline.list(&EventFilter::default()).await.unwrap().len(), 1);
    }
}
