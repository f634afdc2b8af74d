//! Best-effort email alerts.
//!
//! All alerting goes through one transport trait; failures are logged and
//! never propagate into the calling workflow. Bodies pass through the
//! error-ledger sanitizer so a stack trace cannot leak a secret into an
//! inbox.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{http_error, PipelineError};
use crate::monitoring::error_log::sanitize_string;

/// Outbound email transport.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, subject: &str, body: &str, to: &str) -> Result<(), PipelineError>;
}

/// REST transport for the email provider.
pub struct RestEmailTransport {
    client: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl RestEmailTransport {
    pub fn new(api_key: String, from: String) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PipelineError::api("email", err))?;
        Ok(Self {
            client,
            api_key,
            from,
            endpoint: "https://api.resend.com/emails".to_string(),
        })
    }
}

#[async_trait]
impl EmailTransport for RestEmailTransport {
    async fn send(&self, subject: &str, body: &str, to: &str) -> Result<(), PipelineError> {
        let payload = json!({
            "from": self.from,
            "to": [to],
            "subject": subject,
            "text": body,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| http_error("email", err))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api(
                "email",
                format!("send returned {status}"),
            ));
        }
        Ok(())
    }
}

/// Severity prefix on the subject line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Critical,
    Warning,
    Info,
}

impl AlertLevel {
    fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Critical => "CRITICAL",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Info => "INFO",
        }
    }
}

/// Sections of the daily summary email.
#[derive(Debug, Clone, Default)]
pub struct DailySummary {
    pub pipeline_health: Vec<(String, String)>,
    pub orders: i64,
    pub units: i64,
    pub gross_revenue: f64,
    pub active_listings: i64,
    pub max_listings: i64,
    pub new_listings: i64,
    pub prices_updated: i64,
    pub stickers_archived: i64,
    pub api_calls: i64,
    pub ai_spend_today: f64,
    pub ai_spend_mtd: f64,
    pub alerts: Vec<String>,
}

/// Operational email alerter.
#[derive(Clone)]
pub struct Alerter {
    transport: Arc<dyn EmailTransport>,
    to: String,
}

impl Alerter {
    pub fn new(transport: Arc<dyn EmailTransport>, to: String) -> Self {
        Self { transport, to }
    }

    /// Send an alert. Best-effort: failures are logged, never raised.
    pub async fn send_alert(&self, subject: &str, body: &str, level: AlertLevel) {
        let full_subject = format!("[Trendmark {}] {}", level.as_str(), subject);
        let safe_body = sanitize_string(body);
        match self.transport.send(&full_subject, &safe_body, &self.to).await {
            Ok(()) => info!(subject, "alert email sent"),
            Err(err) => warn!(subject, error = %err, "alert email failed (best-effort)"),
        }
    }

    pub async fn send_budget_warning(&self, monthly_spend: f64, cap: f64) {
        let subject = format!("AI budget at ${monthly_spend:.2} of ${cap:.2}");
        let body = format!(
            "Monthly AI spend has reached ${monthly_spend:.2} against the ${cap:.2} cap.\n\
             AI-consuming workflows halt at the hard stop.\n"
        );
        self.send_alert(&subject, &body, AlertLevel::Warning).await;
    }

    /// Daily summary sent unconditionally at the close of the analytics
    /// sync.
    pub async fn send_daily_summary(&self, summary: &DailySummary) {
        let mut body = String::from("Pipeline health:\n");
        for (workflow, status) in &summary.pipeline_health {
            body.push_str(&format!("  - {workflow}: {status}\n"));
        }
        body.push_str(&format!(
            "\nRevenue:\n  - orders: {}\n  - units: {}\n  - gross: ${:.2}\n",
            summary.orders, summary.units, summary.gross_revenue
        ));
        body.push_str(&format!(
            "\nListings:\n  - active: {}/{}\n  - new today: {}\n  - repriced: {}\n  - archived: {}\n",
            summary.active_listings,
            summary.max_listings,
            summary.new_listings,
            summary.prices_updated,
            summary.stickers_archived
        ));
        body.push_str(&format!(
            "\nCosts:\n  - marketplace API calls: {}\n  - AI spend today: ${:.2}\n  - AI spend MTD: ${:.2}\n",
            summary.api_calls, summary.ai_spend_today, summary.ai_spend_mtd
        ));
        if !summary.alerts.is_empty() {
            body.push_str("\nAlerts:\n");
            for alert in &summary.alerts {
                body.push_str(&format!("  - {alert}\n"));
            }
        }
        self.send_alert("Daily summary", &body, AlertLevel::Info).await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;

    #[tokio::test]
    async fn test_alert_subject_carries_level_and_body_is_sanitized() {
        let transport = Arc::new(RecordingTransport::default());
        let alerter = Alerter::new(transport.clone(), "ops@example.com".to_string());

        alerter
            .send_alert(
                "Token refresh failed",
                "refresh failed: Bearer abcdef0123456789ABCDEF",
                AlertLevel::Critical,
            )
            .await;

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.starts_with("[Trendmark CRITICAL]"));
        assert!(!sent[0].1.contains("abcdef"));
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let transport = Arc::new(RecordingTransport::default());
        transport
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let alerter = Alerter::new(transport.clone(), "ops@example.com".to_string());
        // Must not panic or propagate.
        alerter.send_alert("subject", "body", AlertLevel::Warning).await;
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_daily_summary_sections() {
        let transport = Arc::new(RecordingTransport::default());
        let alerter = Alerter::new(transport.clone(), "ops@example.com".to_string());

        alerter
            .send_daily_summary(&DailySummary {
                pipeline_health: vec![("analytics_sync".to_string(), "completed".to_string())],
                orders: 4,
                units: 6,
                gross_revenue: 26.94,
                active_listings: 120,
                max_listings: 300,
                new_listings: 3,
                prices_updated: 11,
                stickers_archived: 2,
                api_calls: 42,
                ai_spend_today: 0.12,
                ai_spend_mtd: 3.40,
                alerts: vec!["rate limit warning zone".to_string()],
            })
            .await;

        let sent = transport.sent.lock();
        let body = &sent[0].1;
        assert!(body.contains("analytics_sync: completed"));
        assert!(body.contains("active: 120/300"));
        assert!(body.contains("AI spend MTD: $3.40"));
        assert!(body.contains("rate limit warning zone"));
    }
}
