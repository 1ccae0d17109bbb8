//! Entity kinds and status values.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of synchronized entity.
///
/// Each kind is an independent collection: ids are unique within a kind,
/// revisions are ordered within a kind, and notifications are totally
/// ordered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A running deployment of a composition onto a cluster.
    Deployment,
    /// A composition (YAML document describing services).
    Composition,
    /// A target cluster.
    Cluster,
    /// Organization context (members, quotas).
    Organization,
}

impl EntityKind {
    /// All kinds, in wire order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Deployment,
        EntityKind::Composition,
        EntityKind::Cluster,
        EntityKind::Organization,
    ];

    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Deployment => "deployment",
            EntityKind::Composition => "composition",
            EntityKind::Cluster => "cluster",
            EntityKind::Organization => "organization",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

/// Lifecycle status reported for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Status not reported.
    #[default]
    Unknown,
    /// Accepted, not yet acted on.
    Pending,
    /// Rollout in progress.
    Progressing,
    /// Replica count changing.
    Scaling,
    /// GitOps reconciliation in progress.
    Syncing,
    /// Running and healthy.
    Healthy,
    /// Running with reduced capacity.
    Degraded,
    /// Failed.
    Error,
    /// Teardown in progress.
    Deleting,
}

impl EntityStatus {
    /// Returns the wire name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Unknown => "unknown",
            EntityStatus::Pending => "pending",
            EntityStatus::Progressing => "progressing",
            EntityStatus::Scaling => "scaling",
            EntityStatus::Syncing => "syncing",
            EntityStatus::Healthy => "healthy",
            EntityStatus::Degraded => "degraded",
            EntityStatus::Error => "error",
            EntityStatus::Deleting => "deleting",
        }
    }

    /// Returns true for statuses that describe work still in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            EntityStatus::Pending
                | EntityStatus::Progressing
                | EntityStatus::Scaling
                | EntityStatus::Syncing
                | EntityStatus::Deleting
        )
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
