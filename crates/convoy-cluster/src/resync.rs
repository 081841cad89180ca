//! Hash-diff resync between agents and the server
//!
//! Resync compares snapshots rather than replaying a log, so it is
//! idempotent and safe to run on every reconnect.
//!
//! - Status resync (client -> server): the client sends the status hash
//!   it last saw per resource; statuses that differ are re-broadcast.
//! - Spec resync (agent -> server): the agent sends the spec version it
//!   holds per resource; newer or unknown specs are re-published and
//!   resources the server no longer has are published as deletes.

use crate::broadcast::Broadcaster;
use crate::broker::{ResourceAction, ResyncRequest, ResyncRequestHandler, SourceClient};
use crate::error::Result;
use crate::hash::sha256_hex;
use crate::model::Resource;
use crate::service::ResourceService;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Status hash a client reports for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatusHash {
    pub resource_id: Uuid,
    pub status_hash: String,
}

/// Spec version an agent holds for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVersion {
    pub resource_id: Uuid,
    pub resource_version: i64,
}

/// Hash identifying a resource's current status.
///
/// Agents may attach a precomputed `statusHash`; it wins when present.
pub fn status_hash(resource: &Resource) -> String {
    let status = &resource.status;
    let empty = match status {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if empty {
        return sha256_hex(b"");
    }
    if let Some(hash) = status.get("statusHash").and_then(Value::as_str) {
        return hash.to_string();
    }
    sha256_hex(status.to_string().as_bytes())
}

/// Resources whose status the client should receive again.
///
/// No hashes at all means the client knows nothing and gets everything.
/// A resource the client sent no hash for is skipped: the client dropped
/// it and a delete is already on its way.
pub fn stale_statuses<'a>(
    resources: &'a [Resource],
    client_hashes: &[ResourceStatusHash],
) -> Vec<&'a Resource> {
    if client_hashes.is_empty() {
        return resources.iter().collect();
    }
    let known: HashMap<Uuid, &str> = client_hashes
        .iter()
        .map(|h| (h.resource_id, h.status_hash.as_str()))
        .collect();
    resources
        .iter()
        .filter(|r| match known.get(&r.id) {
            Some(hash) => *hash != status_hash(r),
            None => false,
        })
        .collect()
}

/// Messages that bring an agent's specs in line with the server
pub fn spec_resync_actions(
    consumer: &str,
    resources: &[Resource],
    agent_versions: &[ResourceVersion],
) -> Vec<(ResourceAction, Resource)> {
    let held: HashMap<Uuid, i64> = agent_versions
        .iter()
        .map(|v| (v.resource_id, v.resource_version))
        .collect();
    let mut actions = Vec::new();

    for resource in resources {
        if resource.is_deleting() {
            actions.push((ResourceAction::Delete, resource.clone()));
            continue;
        }
        match held.get(&resource.id) {
            None => actions.push((ResourceAction::Create, resource.clone())),
            Some(&version) if resource.version == 0 || resource.version > version => {
                actions.push((ResourceAction::Update, resource.clone()))
            }
            Some(_) => {}
        }
    }

    let on_server: HashSet<Uuid> = resources.iter().map(|r| r.id).collect();
    for version in agent_versions {
        if on_server.contains(&version.resource_id) {
            continue;
        }
        let mut tombstone = Resource::new("", consumer, Value::Null);
        tombstone.id = version.resource_id;
        tombstone.version = version.resource_version;
        tombstone.deleted_at = Some(Utc::now());
        actions.push((ResourceAction::Delete, tombstone));
    }
    actions
}

/// Answers resync requests arriving from clients and agents
pub struct ResyncNegotiator {
    resources: Arc<ResourceService>,
    broadcaster: Broadcaster,
    broker: Arc<dyn SourceClient>,
}

impl ResyncNegotiator {
    pub fn new(
        resources: Arc<ResourceService>,
        broadcaster: Broadcaster,
        broker: Arc<dyn SourceClient>,
    ) -> Self {
        Self {
            resources,
            broadcaster,
            broker,
        }
    }

    /// Re-broadcast statuses of `source`'s resources the client has stale.
    /// Returns the number of resources broadcast.
    pub async fn respond_status_resync(
        &self,
        source: &str,
        client_hashes: &[ResourceStatusHash],
    ) -> Result<usize> {
        let resources = self.resources.find_by_source(source).await?;
        let stale = stale_statuses(&resources, client_hashes);
        for resource in &stale {
            self.broadcaster.broadcast(resource);
        }
        info!(
            source,
            known = client_hashes.len(),
            resent = stale.len(),
            "status resync answered"
        );
        Ok(stale.len())
    }

    /// Publish what `consumer`'s agent is missing. Returns the number of
    /// messages published.
    pub async fn respond_spec_resync(
        &self,
        consumer: &str,
        agent_versions: &[ResourceVersion],
    ) -> Result<usize> {
        let resources = self.resources.find_by_consumer(consumer).await?;
        let actions = spec_resync_actions(consumer, &resources, agent_versions);
        for (action, resource) in &actions {
            debug!(consumer, %action, resource_id = %resource.id, "resync publish");
            self.broker.publish(*action, resource).await?;
        }
        info!(consumer, published = actions.len(), "spec resync answered");
        Ok(actions.len())
    }
}

#[async_trait]
impl ResyncRequestHandler for ResyncNegotiator {
    async fn handle_resync(&self, request: ResyncRequest) -> Result<usize> {
        match request {
            ResyncRequest::Status { source, hashes } => {
                self.respond_status_resync(&source, &hashes).await
            }
            ResyncRequest::Spec { consumer, versions } => {
                self.respond_spec_resync(&consumer, &versions).await
            }
        }
    }
}
