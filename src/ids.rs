//! Opaque entity identifiers.
//!
//! Corresponds to spec.md §3's `AgentId`, `CrewId`, `WorkflowId`,
//! `InstructionId` — server-minted, forever-lived identifiers. Modeled as
//! newtypes over `Uuid` so that an `AgentId` can never be passed where a
//! `WorkflowId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fixed namespace used to derive deterministic ids in test mode.
///
/// Mirrors `security::fingerprint`'s use of a crewAI-specific UUID
/// namespace for seeded, reproducible identifiers.
fn kernel_namespace() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, b"crew-forge.kernel")
}

macro_rules! entity_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mint a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Derive a deterministic id from a seed string. Used only in
            /// test mode so that repeated calls with the same seed produce
            /// the same id (spec.md §8 idempotence property).
            pub fn from_seed(seed: &str) -> Self {
                Self(Uuid::new_v5(&kernel_namespace(), seed.as_bytes()))
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(AgentId, "agent");
entity_id!(CrewId, "crew");
entity_id!(WorkflowId, "workflow");
entity_id!(InstructionId, "instruction");
entity_id!(ApiKeyId, "api_key");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_ids_are_deterministic() {
        let a = CrewId::from_seed("m1");
        let b = CrewId::from_seed("m1");
        assert_eq!(a, b);

        let c = CrewId::from_seed("m2");
        assert_ne!(a, c);
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(AgentId::new(), AgentId::new());
    }
}
