//! ApiKey entity and permission-glob matching.
//!
//! Corresponds to spec.md §3's `ApiKey` row and §4.2 step 2 "Authorize".
//! Hashing follows the teacher's `Fingerprint`'s "identity tracked by
//! hash, plaintext never persisted" posture; glob matching uses
//! `globset`, the idiomatic choice confirmed across the example pack's
//! manifests for tool-name/permission matching.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::ApiKeyId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub key_hash: String,
    pub permissions: Vec<String>,
    pub quota_per_hour_override: Option<u32>,
    pub quota_per_minute_override: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub disabled: bool,
}

impl ApiKey {
    /// Mint a new key. Returns the plaintext (shown to the operator
    /// exactly once — spec.md §4.2 "Bootstrapping") and the record to
    /// persist, which only carries the hash.
    pub fn generate(permissions: Vec<String>) -> (String, ApiKey) {
        let plaintext = format!("cf_{}", uuid::Uuid::new_v4().simple());
        let record = ApiKey {
            id: ApiKeyId::new(),
            key_hash: hash_key(&plaintext),
            permissions,
            quota_per_hour_override: None,
            quota_per_minute_override: None,
            created_at: Utc::now(),
            last_used_at: None,
            disabled: false,
        };
        (plaintext, record)
    }

    pub fn from_plaintext(plaintext: &str, permissions: Vec<String>) -> ApiKey {
        ApiKey {
            id: ApiKeyId::new(),
            key_hash: hash_key(plaintext),
            permissions,
            quota_per_hour_override: None,
            quota_per_minute_override: None,
            created_at: Utc::now(),
            last_used_at: None,
            disabled: false,
        }
    }

    /// Compile this key's permission globs. Rebuilt per-call since keys
    /// are looked up infrequently relative to request volume and
    /// permission lists rarely exceed a handful of patterns.
    pub fn permission_set(&self) -> GlobSet {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.permissions {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            }
        }
        builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap())
    }

    pub fn authorizes(&self, tool_name: &str) -> bool {
        self.permission_set().is_match(tool_name)
    }
}

pub fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_hash_never_equals_plaintext() {
        let (plaintext, record) = ApiKey::generate(vec!["*".to_string()]);
        assert_ne!(plaintext, record.key_hash);
        assert_eq!(record.key_hash, hash_key(&plaintext));
    }

    #[test]
    fn glob_permission_matches_prefix_wildcard() {
        let key = ApiKey::from_plaintext("secret", vec!["get_*".to_string()]);
        assert!(key.authorizes("get_crew_status"));
        assert!(!key.authorizes("create_evolving_crew"));
    }

    #[test]
    fn star_permission_authorizes_everything() {
        let key = ApiKey::from_plaintext("secret", vec!["*".to_string()]);
        assert!(key.authorizes("create_evolving_crew"));
        assert!(key.authorizes("anything_at_all"));
    }
}
