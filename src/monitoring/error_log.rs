//! Error ledger with mandatory redaction.
//!
//! Everything written to the `error_log` table passes through the
//! sanitizer first: secret-looking substrings are replaced with a fixed
//! redaction token and context keys from the PII set are dropped
//! entirely. A failure to write the ledger itself is logged locally and
//! swallowed; no workflow aborts because its error could not be recorded.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, error};

use crate::db::Store;
use crate::error::{ErrorKind, PipelineError};
use crate::models::{ErrorEntry, Workflow};

pub const REDACTION_TOKEN: &str = "[REDACTED]";

/// Patterns that look like secrets or PII.
fn sensitive_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // API keys and tokens
            r"(?i)sk-[a-zA-Z0-9]{20,}",
            r"(?i)r8_[a-zA-Z0-9]{20,}",
            r"(?i)Bearer\s+[a-zA-Z0-9._\-]{20,}",
            r"(?i)token[=:]\s*[a-zA-Z0-9._\-]{20,}",
            r"(?i)key[=:]\s*[a-zA-Z0-9._\-]{20,}",
            r"(?i)secret[=:]\s*[a-zA-Z0-9._\-]{20,}",
            r"(?i)password[=:]\s*\S+",
            // Email addresses
            r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}",
            // Credit card-like digit runs (13-19 digits)
            r"\b\d{13,19}\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern compiles"))
        .collect()
    })
}

/// Context keys that are never stored, regardless of value.
const PII_KEYS: &[&str] = &[
    "email",
    "address",
    "phone",
    "name",
    "password",
    "api_key",
    "secret",
    "access_token",
    "refresh_token",
    "credit_card",
    "ssn",
];

fn is_pii_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    lower.starts_with("customer_") || PII_KEYS.contains(&lower.as_str())
}

/// Replace sensitive substrings with the redaction token.
pub fn sanitize_string(text: &str) -> String {
    let mut result = text.to_string();
    for pattern in sensitive_patterns() {
        result = pattern.replace_all(&result, REDACTION_TOKEN).into_owned();
    }
    result
}

/// Sanitize a context blob: PII keys are dropped, string values are
/// pattern-scrubbed, nested mappings are processed recursively, anything
/// else passes through unchanged.
pub fn sanitize_context(context: &Value) -> Value {
    match context {
        Value::Object(map) => {
            let mut clean = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if is_pii_key(key) {
                    continue;
                }
                let cleaned = match value {
                    Value::String(s) => Value::String(sanitize_string(s)),
                    Value::Object(_) => sanitize_context(value),
                    other => other.clone(),
                };
                clean.insert(key.clone(), cleaned);
            }
            Value::Object(clean)
        }
        Value::String(s) => Value::String(sanitize_string(s)),
        other => other.clone(),
    }
}

/// One error to record, before sanitization.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub workflow: Workflow,
    pub step: String,
    pub kind: ErrorKind,
    pub message: String,
    pub service: Option<String>,
    pub pipeline_run_id: Option<String>,
    pub retry_count: i64,
    pub context: Option<Value>,
}

impl ErrorReport {
    pub fn new(workflow: Workflow, step: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            workflow,
            step: step.to_string(),
            kind,
            message: message.into(),
            service: None,
            pipeline_run_id: None,
            retry_count: 0,
            context: None,
        }
    }

    /// Build a report straight from a pipeline error, picking up its kind
    /// and service tag.
    pub fn from_error(workflow: Workflow, step: &str, err: &PipelineError) -> Self {
        Self {
            workflow,
            step: step.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            service: err.service().map(str::to_string),
            pipeline_run_id: None,
            retry_count: 0,
            context: None,
        }
    }

    pub fn with_run(mut self, run_id: &str) -> Self {
        self.pipeline_run_id = Some(run_id.to_string());
        self
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Writer for the `error_log` table.
#[derive(Clone)]
pub struct ErrorLogger {
    store: Store,
}

impl ErrorLogger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record an error. Returns the row id, or None when the ledger
    /// write itself failed (which is logged, never raised).
    pub fn log(&self, report: ErrorReport) -> Option<String> {
        let safe_message = sanitize_string(&report.message);
        let safe_context = report.context.as_ref().map(sanitize_context);

        match self.store.insert_error(
            report.workflow,
            &report.step,
            report.kind.as_str(),
            &safe_message,
            report.service.as_deref(),
            report.pipeline_run_id.as_deref(),
            report.retry_count,
            safe_context.as_ref(),
        ) {
            Ok(id) => {
                debug!(
                    workflow = %report.workflow,
                    step = %report.step,
                    kind = %report.kind,
                    "error logged"
                );
                Some(id)
            }
            Err(err) => {
                error!(
                    error = %err,
                    original = %safe_message,
                    "failed to write error_log row"
                );
                None
            }
        }
    }

    pub fn resolve(&self, id: &str) -> Result<(), PipelineError> {
        self.store.resolve_error(id)
    }

    /// Newest-first rows for one workflow.
    pub fn recent(&self, workflow: Workflow, limit: usize) -> Result<Vec<ErrorEntry>, PipelineError> {
        self.store.recent_errors(workflow, limit)
    }

    /// True when the last `n` rows for the workflow are all unresolved.
    pub fn consecutive_failures(&self, workflow: Workflow, n: usize) -> bool {
        match self.store.recent_errors(workflow, n) {
            Ok(recent) => recent.len() >= n && recent.iter().all(|e| !e.resolved),
            Err(err) => {
                error!(workflow = %workflow, error = %err, "consecutive-failure check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_strips_bearer_tokens() {
        let cleaned =
            sanitize_string("request failed: Bearer abcdef0123456789ABCDEF more text");
        assert!(cleaned.contains(REDACTION_TOKEN));
        assert!(!cleaned.contains("abcdef"));
        assert!(cleaned.ends_with("more text"));
    }

    #[test]
    fn test_sanitize_strips_key_value_secrets() {
        for input in [
            "failed with key=abcdefghijklmnopqrstuv",
            "failed with token: abcdefghijklmnopqrstuv",
            "secret=abcdefghijklmnopqrstuv trailing",
            "password=hunter2",
        ] {
            let cleaned = sanitize_string(input);
            assert!(cleaned.contains(REDACTION_TOKEN), "not redacted: {input}");
            assert!(!cleaned.contains("abcdefghijklmnopqrstuv"));
            assert!(!cleaned.contains("hunter2"));
        }
    }

    #[test]
    fn test_sanitize_strips_emails_and_card_numbers() {
        let cleaned = sanitize_string("customer a@b.com paid with 4111111111111111");
        assert!(!cleaned.contains("a@b.com"));
        assert!(!cleaned.contains("4111111111111111"));
        // Short digit runs survive.
        assert_eq!(sanitize_string("listing 12345"), "listing 12345");
    }

    #[test]
    fn test_sanitize_context_drops_pii_keys_recursively() {
        let context = json!({
            "customer_email": "a@b.com",
            "endpoint": "/v1/orders",
            "nested": {
                "refresh_token": "tok",
                "listing_id": "123",
                "note": "contact a@b.com"
            },
            "retry": 2,
            "tags": ["a@b.com"]
        });
        let clean = sanitize_context(&context);
        let obj = clean.as_object().unwrap();
        assert!(!obj.contains_key("customer_email"));
        assert_eq!(obj["endpoint"], "/v1/orders");
        let nested = obj["nested"].as_object().unwrap();
        assert!(!nested.contains_key("refresh_token"));
        assert_eq!(nested["listing_id"], "123");
        assert!(nested["note"].as_str().unwrap().contains(REDACTION_TOKEN));
        // Non-string, non-mapping values pass through.
        assert_eq!(obj["retry"], 2);
        assert_eq!(obj["tags"], json!(["a@b.com"]));
    }

    #[test]
    fn test_log_error_end_to_end_redaction() {
        let store = Store::open_in_memory().unwrap();
        let logger = ErrorLogger::new(store.clone());

        let id = logger
            .log(
                ErrorReport::new(
                    Workflow::AnalyticsSync,
                    "order_sync",
                    ErrorKind::Api,
                    "request failed: Bearer abcdef0123456789ABCDEF",
                )
                .with_service("marketplace")
                .with_context(json!({
                    "customer_email": "a@b.com",
                    "endpoint": "/v1/orders"
                })),
            )
            .expect("ledger write succeeds");

        let rows = logger.recent(Workflow::AnalyticsSync, 10).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.id, id);
        assert!(row.message.contains(REDACTION_TOKEN));
        assert!(!row.message.contains("abcdef"));
        let context = row.context.as_ref().unwrap().as_object().unwrap();
        assert!(!context.contains_key("customer_email"));
        assert_eq!(context["endpoint"], "/v1/orders");
    }

    #[test]
    fn test_consecutive_failures() {
        let store = Store::open_in_memory().unwrap();
        let logger = ErrorLogger::new(store.clone());

        assert!(!logger.consecutive_failures(Workflow::TrendMonitor, 3));

        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                logger
                    .log(ErrorReport::new(
                        Workflow::TrendMonitor,
                        "trend_fetch",
                        ErrorKind::Api,
                        format!("failure {i}"),
                    ))
                    .unwrap(),
            );
        }
        assert!(logger.consecutive_failures(Workflow::TrendMonitor, 3));

        logger.resolve(&ids[2]).unwrap();
        assert!(!logger.consecutive_failures(Workflow::TrendMonitor, 3));
    }
}
