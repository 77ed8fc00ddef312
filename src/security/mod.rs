//! Security Gate.
//!
//! Corresponds to spec.md §4.2. Grounded on `security/fingerprint.rs`'s
//! identity-hashing idiom ("never store plaintext") and
//! `security/security_config.rs`'s configuration-object shape, adapted
//! from fingerprint-as-identity to API-key-hash-as-credential. Rate
//! limiting, schema validation, and sanitization have no teacher
//! analogue — crewAI is an agent framework, not a multi-tenant server —
//! and are grounded on the `dashmap`/`globset`/`regex`/`unicode-normalization`
//! idiom confirmed across the wider example pack.

pub mod api_key;
pub mod audit;
pub mod gate;
pub mod rate_limit;
pub mod validation;

pub use gate::SecurityGate;
