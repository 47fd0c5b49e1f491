//! Network domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A virtual network defined on a single host.
///
/// The VLAN id, when present, is unique within the owning host's network set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Unique network identifier within its host (UUID v4)
    pub network_id: String,

    /// Owning host
    pub host_id: String,

    /// Human-readable name
    pub name: String,

    /// Subnet in CIDR notation (e.g. 10.88.0.0/24)
    pub cidr: String,

    pub vlan_id: Option<u16>,

    pub created_at: DateTime<Utc>,
}
