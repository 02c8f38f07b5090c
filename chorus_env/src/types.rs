//! Common identifier types shared by every Chorus crate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from a UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Creates a deterministic id from a seed (for simulation).
            pub fn from_seed(seed: u64) -> Self {
                let mut bytes = [0u8; 16];
                bytes[0..8].copy_from_slice(&seed.to_le_bytes());
                bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
                Self(Uuid::from_bytes(bytes))
            }

            /// Returns the inner UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifies one simulation run (one queue, one orchestrator).
    RunId
);

uuid_id!(
    /// Identifies one work item (a prompt bound to a run).
    ItemId
);

uuid_id!(
    /// Identifies the organization that owns a run; the unit of rate limiting.
    OrgId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_ids_are_deterministic() {
        assert_eq!(ItemId::from_seed(7), ItemId::from_seed(7));
        assert_ne!(ItemId::from_seed(7), ItemId::from_seed(8));
    }

    #[test]
    fn test_id_display_round_trips_through_from_str() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
