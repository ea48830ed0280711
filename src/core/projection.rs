//! Project projection: derived, read-only views rebuilt from the event
//! log (SPEC_FULL.md §4.7) — `/current`, `/history`, `/snapshots`,
//! `/annotations`.
//!
//! Nothing here is authoritative; a projection can always be discarded
//! and rebuilt by replaying `core::event_log::EventStore::query`. Expert
//! agents may only contribute `ANNOTATION_ADDED` events against this
//! surface — `FILE_MODIFIED`/`SNAPSHOT_TAKEN` are reserved for builder/
//! system agents (see `DESIGN.md`). Derived state is never hand-edited,
//! only replayed.

use crate::core::authenticator::Permission;
use crate::core::event_log::{Event, EventFilter, EventKind, EventStore};
use crate::error::LighthouseError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub agent_id: String,
    pub path: String,
    pub note: serde_json::Value,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub path: String,
    pub content: serde_json::Value,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathProjection {
    pub path: String,
    pub current: Option<serde_json::Value>,
    pub history: Vec<Event>,
    pub snapshots: Vec<Snapshot>,
    pub annotations: Vec<Annotation>,
}

/// Rebuilds path-scoped views by replaying `FILE_MODIFIED`, `SNAPSHOT_TAKEN`,
/// and `ANNOTATION_ADDED` events from the event log. Stateless beyond the
/// `EventStore` reference: every call re-derives from the authoritative
/// log rather than caching writes of its own.
pub struct ProjectionEngine<'a> {
    events: &'a EventStore,
}

impl<'a> ProjectionEngine<'a> {
    pub fn new(events: &'a EventStore) -> Self {
        Self { events }
    }

    fn replay(&self, path: &str) -> PathProjection {
        let filter = EventFilter {
            aggregate_id: Some(path.to_string()),
            kinds: Some(vec![
                EventKind::FileModified,
                EventKind::SnapshotTaken,
                EventKind::AnnotationAdded,
            ]),
            ..Default::default()
        };

        let mut projection = PathProjection {
            path: path.to_string(),
            ..Default::default()
        };

        for event in self.events.query(&filter) {
            match event.kind {
                EventKind::FileModified => {
                    projection.current = event.payload.get("content").cloned();
                }
                EventKind::SnapshotTaken => {
                    if let (Some(id), Some(content)) = (
                        event.payload.get("snapshot_id").and_then(|v| v.as_str()),
                        event.payload.get("content"),
                    ) {
                        projection.snapshots.push(Snapshot {
                            snapshot_id: id.to_string(),
                            path: path.to_string(),
                            content: content.clone(),
                            created_at_ms: event.created_at_ms,
                        });
                    }
                }
                EventKind::AnnotationAdded => {
                    if let Some(note) = event.payload.get("note") {
                        projection.annotations.push(Annotation {
                            agent_id: event
                                .payload
                                .get("agent_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            path: path.to_string(),
                            note: note.clone(),
                            created_at_ms: event.created_at_ms,
                        });
                    }
                }
                _ => {}
            }
            projection.history.push(event);
        }

        projection
    }

    pub fn current(&self, path: &str) -> Option<serde_json::Value> {
        self.replay(path).current
    }

    pub fn history(&self, path: &str) -> Vec<Event> {
        self.replay(path).history
    }

    pub fn snapshots(&self, path: &str) -> Vec<Snapshot> {
        self.replay(path).snapshots
    }

    pub fn annotations(&self, path: &str) -> Vec<Annotation> {
        self.replay(path).annotations
    }

    /// Appends an `ANNOTATION_ADDED` event. The caller must have already
    /// verified `SHADOW_WRITE` permission; this function additionally
    /// asserts it, so a permission regression upstream fails loudly here
    /// too rather than silently letting a write through.
    pub fn add_annotation(
        &self,
        caller_permission: Permission,
        path: &str,
        agent_id: &str,
        note: serde_json::Value,
    ) -> Result<(String, u64), LighthouseError> {
        if caller_permission != Permission::ShadowWrite {
            return Err(LighthouseError::Unauthorized(
                "annotations require SHADOW_WRITE; experts may never author FILE_MODIFIED or SNAPSHOT_TAKEN".to_string(),
            ));
        }

        self.events.append(crate::core::event_log::EventDraft {
            kind: EventKind::AnnotationAdded,
            aggregate_id: path.to_string(),
            payload: serde_json::json!({ "agent_id": agent_id, "note": note }),
            correlation_id: None,
            causation_id: None,
        })
    }

    /// Builds the full set of per-path projections currently known to the
    /// log, for operator/debug inspection (`lighthouse health` style
    /// surfaces).
    pub fn all_paths(&self) -> HashMap<String, PathProjection> {
        let mut out = HashMap::new();
        for event in self.events.query(&EventFilter {
            kinds: Some(vec![
                EventKind::FileModified,
                EventKind::SnapshotTaken,
                EventKind::AnnotationAdded,
            ]),
            ..Default::default()
        }) {
            out.entry(event.aggregate_id.clone())
                .or_insert_with(|| self.replay(&event.aggregate_id));
        }
        out
    }
}
