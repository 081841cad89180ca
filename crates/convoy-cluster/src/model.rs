//! Persisted coordination records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A declarative object delivered to one consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    /// Client that submitted the resource
    pub source: String,
    pub resource_type: String,
    /// Remote cluster the resource is delivered to
    pub consumer_name: String,
    pub version: i64,
    pub payload: Value,
    pub status: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(
        source: impl Into<String>,
        consumer_name: impl Into<String>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            resource_type: "Resource".to_string(),
            consumer_name: consumer_name.into(),
            version: 0,
            payload,
            status: Value::Null,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self
    }

    pub fn with_status(mut self, status: Value) -> Self {
        self.status = status;
        self
    }

    pub fn is_deleting(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether the agent reported the resource as removed from the remote side.
    ///
    /// The agent sets a `Deleted` condition with status `True` in the
    /// reconcile status once every manifest is gone.
    pub fn is_deleted_on_agent(&self) -> bool {
        self.status
            .pointer("/reconcileStatus/conditions")
            .and_then(Value::as_array)
            .map(|conditions| {
                conditions.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some("Deleted")
                        && c.get("status").and_then(Value::as_str) == Some("True")
                })
            })
            .unwrap_or(false)
    }

    /// Monotonic sequence id attached by the agent to each status report
    pub fn status_sequence_id(&self) -> Option<u64> {
        match self.status.get("sequenceId")? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Spec-side event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(EventType::Create),
            "update" => Some(EventType::Update),
            "delete" => Some(EventType::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending spec-side obligation for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    /// Set once every handler for the event succeeded
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(resource_id: Uuid, event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id,
            event_type,
            created_at: Utc::now(),
            reconciled_at: None,
        }
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled_at.is_some()
    }
}

/// Status-side event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventType {
    StatusUpdate,
    StatusDelete,
}

impl StatusEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusEventType::StatusUpdate => "status_update",
            StatusEventType::StatusDelete => "status_delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "status_update" => Some(StatusEventType::StatusUpdate),
            "status_delete" => Some(StatusEventType::StatusDelete),
            _ => None,
        }
    }
}

impl std::fmt::Display for StatusEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending obligation to fan an agent-reported status out to local subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub resource_source: String,
    pub resource_type: String,
    pub consumer_name: String,
    /// Spec snapshot, kept for deletes where the resource row is already gone
    pub payload: Value,
    /// Status snapshot, kept for deletes
    pub status: Value,
    pub status_event_type: StatusEventType,
    pub created_at: DateTime<Utc>,
}

impl StatusEvent {
    /// Status update for a resource whose row stays in place
    pub fn update(resource: &Resource) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id: resource.id,
            resource_source: resource.source.clone(),
            resource_type: resource.resource_type.clone(),
            consumer_name: resource.consumer_name.clone(),
            payload: Value::Null,
            status: Value::Null,
            status_event_type: StatusEventType::StatusUpdate,
            created_at: Utc::now(),
        }
    }

    /// Status delete carrying a snapshot of the removed resource
    pub fn delete(resource: &Resource) -> Self {
        Self {
            payload: resource.payload.clone(),
            status: resource.status.clone(),
            status_event_type: StatusEventType::StatusDelete,
            ..Self::update(resource)
        }
    }

    /// Rebuild the resource a status delete refers to
    pub fn snapshot_resource(&self) -> Resource {
        Resource {
            id: self.resource_id,
            source: self.resource_source.clone(),
            resource_type: self.resource_type.clone(),
            consumer_name: self.consumer_name.clone(),
            version: 0,
            payload: self.payload.clone(),
            status: self.status.clone(),
            created_at: self.created_at,
            updated_at: self.created_at,
            deleted_at: Some(self.created_at),
        }
    }
}

/// Records that an instance broadcast a status event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInstance {
    pub event_id: Uuid,
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
}

/// One control-plane replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deleted_condition() {
        let resource = Resource::new("svc", "cluster-1", json!({})).with_status(json!({
            "reconcileStatus": {
                "conditions": [
                    {"type": "Applied", "status": "True"},
                    {"type": "Deleted", "status": "True"}
                ]
            }
        }));
        assert!(resource.is_deleted_on_agent());

        let resource = resource.with_status(json!({
            "reconcileStatus": {"conditions": [{"type": "Deleted", "status": "False"}]}
        }));
        assert!(!resource.is_deleted_on_agent());
        assert!(!Resource::new("svc", "c", json!({})).is_deleted_on_agent());
    }

    #[test]
    fn test_sequence_id() {
        let r = Resource::new("svc", "c", json!({})).with_status(json!({"sequenceId": "42"}));
        assert_eq!(r.status_sequence_id(), Some(42));
        let r = r.with_status(json!({"sequenceId": 7}));
        assert_eq!(r.status_sequence_id(), Some(7));
        let r = r.with_status(json!({}));
        assert_eq!(r.status_sequence_id(), None);
    }

    #[test]
    fn test_status_delete_snapshot() {
        let resource = Resource::new("svc", "cluster-1", json!({"kind": "Deployment"}))
            .with_status(json!({"phase": "gone"}));
        let event = StatusEvent::delete(&resource);
        assert_eq!(event.status_event_type, StatusEventType::StatusDelete);

        let rebuilt = event.snapshot_resource();
        assert_eq!(rebuilt.id, resource.id);
        assert_eq!(rebuilt.payload, resource.payload);
        assert_eq!(rebuilt.status, resource.status);
        assert_eq!(rebuilt.consumer_name, "cluster-1");
        assert!(rebuilt.is_deleting());
    }

    #[test]
    fn test_event_type_round_trip() {
        for t in [EventType::Create, EventType::Update, EventType::Delete] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(
            StatusEventType::parse("status_delete"),
            Some(StatusEventType::StatusDelete)
        );
        assert_eq!(EventType::parse("resync"), None);
    }
}
