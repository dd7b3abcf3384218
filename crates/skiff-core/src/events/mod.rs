//! State-change event recording and ordered verification.

pub mod recorder;

use std::fmt;
use std::ops::BitOr;

use skiff_client::models::{ResourceType, StateChangeEventPayload};

/// One observed or expected state transition, compared structurally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOccurrence {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub old_state: String,
    pub new_state: String,
}

impl EventOccurrence {
    pub fn new(
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        old_state: impl Into<String>,
        new_state: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
            old_state: old_state.into(),
            new_state: new_state.into(),
        }
    }
}

impl fmt::Display for EventOccurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} -> {}",
            self.resource_type, self.resource_id, self.old_state, self.new_state
        )
    }
}

impl From<&StateChangeEventPayload> for EventOccurrence {
    fn from(payload: &StateChangeEventPayload) -> Self {
        Self {
            resource_type: payload.resource_type,
            resource_id: payload.resource_id.clone(),
            old_state: payload.old_state.clone(),
            new_state: payload.new_state.clone(),
        }
    }
}

/// Bit set selecting which resource types a recorder keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMask(u8);

impl RecordMask {
    pub const NONE: RecordMask = RecordMask(0);
    pub const CLUSTER: RecordMask = RecordMask(1 << 0);
    pub const INSTALLATION: RecordMask = RecordMask(1 << 1);
    pub const CLUSTER_INSTALLATION: RecordMask = RecordMask(1 << 2);
    /// Record everything.
    pub const ALL: RecordMask = RecordMask(1 << 0 | 1 << 1 | 1 << 2);

    pub fn of(resource_type: ResourceType) -> Self {
        match resource_type {
            ResourceType::Cluster => Self::CLUSTER,
            ResourceType::Installation => Self::INSTALLATION,
            ResourceType::ClusterInstallation => Self::CLUSTER_INSTALLATION,
        }
    }

    pub fn contains(self, resource_type: ResourceType) -> bool {
        self.0 & Self::of(resource_type).0 != 0
    }
}

impl BitOr for RecordMask {
    type Output = RecordMask;

    fn bitor(self, rhs: RecordMask) -> RecordMask {
        RecordMask(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_selects_resource_types() {
        let mask = RecordMask::CLUSTER | RecordMask::INSTALLATION;
        assert!(mask.contains(ResourceType::Cluster));
        assert!(mask.contains(ResourceType::Installation));
        assert!(!mask.contains(ResourceType::ClusterInstallation));
        assert!(RecordMask::ALL.contains(ResourceType::ClusterInstallation));
        assert!(!RecordMask::NONE.contains(ResourceType::Cluster));
    }
}
