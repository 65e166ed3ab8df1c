pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod retry;
pub mod server;
pub mod session;
pub mod splitter;
pub mod transport;

use std::sync::Arc;

use crate::audit::{AuditSink, WebhookAuditSink};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::transport::{GeminiTransport, Transport};

/// Builds the dispatcher once from configuration.
pub struct TriageService {
    dispatcher: Arc<Dispatcher>,
}

impl TriageService {
    pub fn new(cfg: &Config) -> Result<Self> {
        let transport = Arc::new(GeminiTransport::new(&cfg.provider, cfg.request_timeout())?);
        Ok(Self::with_transport(cfg, transport))
    }

    /// Same wiring as `new`, over any transport.
    pub fn with_transport(cfg: &Config, transport: Arc<dyn Transport>) -> Self {
        let mut dispatcher = Dispatcher::new(
            transport,
            cfg.dispatch.clone(),
            RetryPolicy::from(&cfg.retry),
        );

        match (cfg.audit.enabled, cfg.audit.endpoint.clone()) {
            (true, Some(endpoint)) => {
                tracing::info!("Audit records will be posted to {}", endpoint);
                dispatcher =
                    dispatcher.with_audit(Arc::new(WebhookAuditSink::new(endpoint)) as Arc<dyn AuditSink>);
            }
            (true, None) => tracing::warn!("Audit enabled without an endpoint - disabled"),
            _ => {}
        }

        tracing::info!(
            models = ?dispatcher.models(),
            history_window = cfg.dispatch.history_window,
            "Dispatcher ready"
        );

        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn router(&self, bearer_token: Option<String>) -> axum::Router {
        server::router(self.dispatcher(), bearer_token)
    }
}
