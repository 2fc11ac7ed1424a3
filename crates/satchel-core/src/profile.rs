//! Tenant namespaces.

use serde::{Deserialize, Serialize};

/// A tenant namespace. Items are partitioned by profile, and removing a
/// profile cascades to its items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Surrogate id assigned by the backend.
    pub id: i64,
    /// Unique profile name.
    pub name: String,
    /// Optional opaque reference supplied by the caller.
    pub reference: Option<String>,
    /// Opaque per-profile key material, reserved.
    pub profile_key: Option<String>,
}

impl Profile {
    /// Creates a profile record.
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            reference: None,
            profile_key: None,
        }
    }
}
