//! AuditRecord entity.
//!
//! Corresponds to spec.md §3's `AuditRecord` row and §4.2 step 6.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Started,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub client_id: String,
    pub tool: String,
    /// Hash of the arguments, never the raw arguments — spec.md §3
    /// "arg_hash", keeping request bodies (which may carry free text
    /// meant to stay out of durable logs) out of the audit trail.
    pub arg_hash: String,
    pub outcome: AuditOutcome,
    pub latency_ms: Option<u64>,
    pub error_kind: Option<String>,
}

impl AuditRecord {
    pub fn started(client_id: &str, tool: &str, arg_hash: String) -> Self {
        Self {
            ts: Utc::now(),
            client_id: client_id.to_string(),
            tool: tool.to_string(),
            arg_hash,
            outcome: AuditOutcome::Started,
            latency_ms: None,
            error_kind: None,
        }
    }

    pub fn completed(client_id: &str, tool: &str, arg_hash: String, latency_ms: u64, error_kind: Option<String>) -> Self {
        Self {
            ts: Utc::now(),
            client_id: client_id.to_string(),
            tool: tool.to_string(),
            arg_hash,
            outcome: if error_kind.is_some() { AuditOutcome::Error } else { AuditOutcome::Success },
            latency_ms: Some(latency_ms),
            error_kind,
        }
    }
}

pub fn hash_args(args: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(args.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
