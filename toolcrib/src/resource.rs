//! Physical resources drawn from the shared pool.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Money, PartitionKey, ResourceId};

/// Availability of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Free to reserve.
    Available,
    /// Held by an open batch that has not been handed over yet.
    Reserved,
    /// Physically with a borrower.
    InUse,
    /// Out of circulation (repair, lost, retired).
    Unavailable,
}

impl ResourceStatus {
    /// Stable storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::InUse => "in_use",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a stored status string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ResourceStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "available" => Ok(Self::Available),
            "reserved" => Ok(Self::Reserved),
            "in_use" => Ok(Self::InUse),
            "unavailable" => Ok(Self::Unavailable),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A physical item in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Pool identifier.
    pub id: ResourceId,
    /// Owning project.
    pub partition: PartitionKey,
    /// Human readable label.
    pub name: String,
    /// Replacement value, used for criticality.
    pub value: Money,
    /// Current availability.
    pub status: ResourceStatus,
}

impl Resource {
    /// A new resource, available for reservation.
    pub fn available(
        id: ResourceId,
        partition: PartitionKey,
        name: impl Into<String>,
        value: Money,
    ) -> Self {
        Self {
            id,
            partition,
            name: name.into(),
            value,
            status: ResourceStatus::Available,
        }
    }
}

/// A pending change to a resource's availability produced by a transition.
///
/// The change only applies when the resource is still in `from`; a resource
/// moved elsewhere by pool administration (e.g. marked unavailable) is left
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChange {
    /// Resource to update.
    pub resource: ResourceId,
    /// Status the transition expects the resource to be in.
    pub from: ResourceStatus,
    /// Status after the transition.
    pub to: ResourceStatus,
}

impl ResourceChange {
    /// Convenience constructor.
    pub const fn new(resource: ResourceId, from: ResourceStatus, to: ResourceStatus) -> Self {
        Self { resource, from, to }
    }
}
