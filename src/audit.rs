use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{Result, TriageError};
use crate::models::TriageVerdict;

/// One exchange as reported to the monitoring endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub user_text: String,
    #[serde(rename = "botResponse")]
    pub reply_text: String,
    pub triage: Option<TriageVerdict>,
    pub model_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// POSTs each record as JSON. The response body is never consulted.
pub struct WebhookAuditSink {
    client: Client,
    endpoint: String,
}

impl WebhookAuditSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl AuditSink for WebhookAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        let response = self.client.post(&self.endpoint).json(record).send().await?;
        if !response.status().is_success() {
            return Err(TriageError::Audit(format!(
                "audit endpoint {} answered HTTP {}",
                self.endpoint,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fire-and-forget: the record is delivered on a detached task and failures are only logged.
pub fn emit(sink: Arc<dyn AuditSink>, record: AuditRecord) {
    tokio::spawn(async move {
        if let Err(e) = sink.record(&record).await {
            tracing::warn!("Audit record for model {} not delivered: {}", record.model_used, e);
        }
    });
}
