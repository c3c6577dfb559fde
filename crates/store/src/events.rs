//! Event ingestion — the hot path. Non-validating beyond the required
//! event name; downstream consumers tolerate arbitrary properties.

use crate::repository::{EventQuery, EventRepository};
use chrono::Utc;
use pulse_core::types::AnalyticsEvent;
use pulse_core::{AnalyticsError, AnalyticsResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Incoming event payload from an emitting collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub event: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    pub page: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
}

/// Records behavioral events into the append-only log.
pub struct EventRecorder {
    repo: Arc<dyn EventRepository>,
}

impl EventRecorder {
    pub fn new(repo: Arc<dyn EventRepository>) -> Self {
        Self { repo }
    }

    /// Persist one event, stamping id and timestamp. Callers must not
    /// assume success without the returned identifier.
    pub fn record(&self, data: EventData) -> AnalyticsResult<AnalyticsEvent> {
        if data.event.trim().is_empty() {
            return Err(AnalyticsError::Validation(
                "event name must not be empty".into(),
            ));
        }

        let event = AnalyticsEvent {
            id: Uuid::new_v4(),
            user_id: data.user_id,
            session_id: data.session_id,
            event: data.event,
            category: data.category,
            properties: data.properties,
            page: data.page,
            referrer: data.referrer,
            user_agent: data.user_agent,
            timestamp: Utc::now(),
        };

        let event = self.repo.append(event)?;
        metrics::counter!("analytics.events.recorded").increment(1);
        debug!(event = %event.event, id = %event.id, "Event recorded");
        Ok(event)
    }

    pub fn query(&self, query: &EventQuery) -> AnalyticsResult<Vec<AnalyticsEvent>> {
        self.repo.query(query)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryEventStore;

    fn recorder() -> EventRecorder {
        EventRecorder::new(Arc::new(MemoryEventStore::new()))
    }

    #[test]
    fn test_record_assigns_id_and_timestamp() {
        let recorder = recorder();
        let event = recorder
            .record(EventData {
                event: "lesson_viewed".into(),
                user_id: Some("u1".into()),
                session_id: None,
                category: None,
                properties: HashMap::from([("lesson".into(), serde_json::json!("intro"))]),
                page: Some("/courses/rust/intro".into()),
                referrer: None,
                user_agent: None,
            })
            .unwrap();
        assert!(!event.id.is_nil());
        assert_eq!(event.event, "lesson_viewed");

        let stored = recorder.query(&EventQuery::for_event("lesson_viewed")).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, event.id);
    }

    #[test]
    fn test_empty_event_name_rejected() {
        let recorder = recorder();
        let result = recorder.record(EventData {
            event: "   ".into(),
            user_id: None,
            session_id: None,
            category: None,
            properties: HashMap::new(),
            page: None,
            referrer: None,
            user_agent: None,
        });
        assert!(matches!(result, Err(AnalyticsError::Validation(_))));
    }
}
