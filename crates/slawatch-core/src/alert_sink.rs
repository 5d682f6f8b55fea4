//! Alert sinks: where breach notifications go.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AlertSinkKind, AlertingConfig};
use crate::error::{AlertError, ConfigError, Result};
use crate::model::{BreachEvent, BreachType, JobRun, RunStatus, Severity};

/// Delivery target for breach alerts.
///
/// A sink only delivers; retries, the circuit breaker and alert state
/// bookkeeping live in the alert pipeline.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, breach: &BreachEvent, run: &JobRun) -> std::result::Result<(), AlertError>;
}

/// JSON body posted by [`WebhookAlertSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub breach_id: Option<i64>,
    pub run_id: String,
    pub calculator_id: String,
    pub calculator_name: String,
    pub tenant_id: String,
    pub breach_type: BreachType,
    pub severity: Severity,
    pub reason: Option<String>,
    pub expected_value: Option<i64>,
    pub actual_value: Option<i64>,
    pub run_status: RunStatus,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
}

impl AlertPayload {
    #[must_use]
    pub fn new(breach: &BreachEvent, run: &JobRun) -> Self {
        Self {
            breach_id: breach.breach_id,
            run_id: breach.run_id.clone(),
            calculator_id: breach.calculator_id.clone(),
            calculator_name: breach.calculator_name.clone(),
            tenant_id: breach.tenant_id.clone(),
            breach_type: breach.breach_type,
            severity: breach.severity,
            reason: breach
                .reason
                .clone()
                .or_else(|| run.sla_breach_reason.clone()),
            expected_value: breach.expected_value,
            actual_value: breach.actual_value,
            run_status: run.status,
            sla_deadline: run.sla_deadline,
            detected_at: breach.created_at,
        }
    }
}

/// Emits each alert as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, breach: &BreachEvent, run: &JobRun) -> std::result::Result<(), AlertError> {
        warn!(
            target: "slawatch::alert",
            breach_id = ?breach.breach_id,
            run_id = %breach.run_id,
            calculator_id = %breach.calculator_id,
            calculator_name = %breach.calculator_name,
            tenant_id = %breach.tenant_id,
            breach_type = %breach.breach_type,
            severity = %breach.severity,
            run_status = %run.status,
            reason = breach.reason.as_deref().unwrap_or(""),
            "SLA breach"
        );
        Ok(())
    }
}

/// Posts [`AlertPayload`] JSON to an HTTP endpoint. Any non-2xx answer is a failure.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> std::result::Result<Self, AlertError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, breach: &BreachEvent, run: &JobRun) -> std::result::Result<(), AlertError> {
        let response = self
            .client
            .post(&self.url)
            .json(&AlertPayload::new(breach, run))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Rejected {
                status: status.as_u16(),
            });
        }
        info!(run_id = %breach.run_id, status = status.as_u16(), "Alert delivered to webhook");
        Ok(())
    }
}

/// Build the sink selected by `[alerting] sink`.
pub fn build_sink(config: &AlertingConfig) -> Result<Arc<dyn AlertSink>> {
    match config.sink {
        AlertSinkKind::Log => Ok(Arc::new(LogAlertSink)),
        AlertSinkKind::Webhook => {
            let url = config.webhook_url.as_deref().ok_or_else(|| {
                ConfigError::ValidationError("alerting.webhook_url is required for the webhook sink".into())
            })?;
            Ok(Arc::new(WebhookAlertSink::new(url, config.send_timeout())?))
        }
    }
}
