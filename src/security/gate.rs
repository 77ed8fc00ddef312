//! The Security Gate pipeline.
//!
//! Corresponds to spec.md §4.2: authenticate, authorize, rate-limit,
//! validate, sanitize, audit — applied, in that order, to every tool
//! call.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::AppError;
use crate::security::api_key::{hash_key, ApiKey};
use crate::security::audit::{hash_args, AuditRecord};
use crate::security::rate_limit::{RateDecision, RateLimiter};
use crate::security::validation;
use crate::store::Store;

pub struct SecurityGate {
    store: Arc<dyn Store>,
    rate_limiter: RateLimiter,
    max_string_len: usize,
    max_json_depth: usize,
}

/// Outcome of a successful admission: the resolved caller and the
/// sanitized arguments ready for schema-specific deserialization.
pub struct Admitted {
    pub key: ApiKey,
    pub args: serde_json::Value,
}

impl SecurityGate {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            store,
            rate_limiter: RateLimiter::new(
                config.rate_limit_per_minute,
                config.rate_limit_per_hour,
                config.rate_limit_block_duration,
            ),
            max_string_len: config.max_string_len,
            max_json_depth: config.max_json_depth,
        }
    }

    /// Steps 1-5 of spec.md §4.2. Step 6 (audit) brackets the whole
    /// call and is emitted by the dispatcher via [`Self::audit_started`]
    /// / [`Self::audit_completed`] so that the completion record can
    /// carry latency and outcome.
    pub async fn admit(
        &self,
        credential: Option<&str>,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<Admitted, AppError> {
        // 1. Authenticate.
        let credential = credential.ok_or_else(|| AppError::Unauthenticated("missing credential".into()))?;
        let hash = hash_key(credential);
        let mut key = self
            .store
            .get_api_key_by_hash(&hash)
            .await?
            .ok_or_else(|| AppError::Unauthenticated("unknown api key".into()))?;
        if key.disabled {
            return Err(AppError::Unauthenticated("api key is disabled".into()));
        }
        self.store.touch_api_key_last_used(key.id).await?;
        key.last_used_at = Some(chrono::Utc::now());

        // 2. Authorize.
        if !key.authorizes(tool_name) {
            return Err(AppError::Forbidden(format!(
                "api key is not permitted to call '{tool_name}'"
            )));
        }

        // 3. Rate-limit.
        match self.rate_limiter.check(&key.id.to_string()) {
            RateDecision::Admit => {}
            RateDecision::Blocked { retry_after } => {
                return Err(AppError::RateLimited {
                    retry_after_secs: retry_after.as_secs(),
                })
            }
        }

        // 4. Validate.
        validation::validate_json_depth(&args, self.max_json_depth)?;
        validate_string_leaves(&args, self.max_string_len)?;

        // 5. Sanitize.
        let sanitized = sanitize_value(&args);

        Ok(Admitted { key, args: sanitized })
    }

    pub async fn audit_started(&self, client_id: &str, tool: &str, args: &serde_json::Value) {
        let record = AuditRecord::started(client_id, tool, hash_args(args));
        if let Err(e) = self.store.append_audit(&record).await {
            tracing::warn!(error = %e, "failed to append audit start record");
        }
    }

    pub async fn audit_completed(
        &self,
        client_id: &str,
        tool: &str,
        args: &serde_json::Value,
        latency: Duration,
        error_kind: Option<String>,
    ) {
        let record = AuditRecord::completed(client_id, tool, hash_args(args), latency.as_millis() as u64, error_kind);
        if let Err(e) = self.store.append_audit(&record).await {
            tracing::warn!(error = %e, "failed to append audit completion record");
        }
    }

    pub fn evict_idle_rate_buckets(&self) {
        self.rate_limiter.evict_idle();
    }
}

fn validate_string_leaves(value: &serde_json::Value, max_len: usize) -> Result<(), AppError> {
    match value {
        serde_json::Value::String(s) => validation::validate_text_field("<field>", s, max_len),
        serde_json::Value::Array(items) => {
            for item in items {
                validate_string_leaves(item, max_len)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                validation::validate_text_field(key, key, max_len.min(256))?;
                validate_string_leaves(v, max_len)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn sanitize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(validation::sanitize_text(s)),
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(sanitize_value).collect()),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    async fn gate_with_key(permissions: Vec<String>) -> (SecurityGate, String) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (plaintext, record) = ApiKey::generate(permissions);
        store.put_api_key(&record).await.unwrap();
        let config = Config::from_env().unwrap();
        (SecurityGate::new(store, &config), plaintext)
    }

    #[tokio::test]
    async fn missing_credential_is_unauthenticated() {
        let (gate, _plaintext) = gate_with_key(vec!["*".to_string()]).await;
        let result = gate.admit(None, "health_check", serde_json::json!({})).await;
        assert!(matches!(result, Err(AppError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn unknown_credential_is_unauthenticated() {
        let (gate, _plaintext) = gate_with_key(vec!["*".to_string()]).await;
        let result = gate.admit(Some("bogus"), "health_check", serde_json::json!({})).await;
        assert!(matches!(result, Err(AppError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn restricted_key_cannot_call_out_of_scope_tool() {
        let (gate, plaintext) = gate_with_key(vec!["get_*".to_string()]).await;
        let result = gate
            .admit(Some(&plaintext), "create_evolving_crew", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn eleventh_call_in_a_minute_is_rate_limited() {
        let (gate, plaintext) = gate_with_key(vec!["*".to_string()]).await;
        for _ in 0..10 {
            gate.admit(Some(&plaintext), "health_check", serde_json::json!({}))
                .await
                .unwrap();
        }
        let result = gate.admit(Some(&plaintext), "health_check", serde_json::json!({})).await;
        assert!(matches!(result, Err(AppError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn sanitize_strips_nul_bytes_from_arguments() {
        let (gate, plaintext) = gate_with_key(vec!["*".to_string()]).await;
        let admitted = gate
            .admit(
                Some(&plaintext),
                "add_dynamic_instruction",
                serde_json::json!({ "instruction": "hello\0world" }),
            )
            .await
            .unwrap();
        assert_eq!(admitted.args["instruction"], "helloworld");
    }
}
