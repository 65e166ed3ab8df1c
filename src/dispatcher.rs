use chrono::Utc;
use std::sync::Arc;
use tokio::time::sleep;

use crate::audit::{self, AuditRecord, AuditSink};
use crate::config::DispatchConfig;
use crate::error::{ProviderError, Result, TriageError};
use crate::models::{
    AttemptOutcome, Content, ConversationTurn, DispatchResult, GenerateRequest, GenerationConfig,
    ModelAttempt, Role,
};
use crate::retry::RetryPolicy;
use crate::splitter;
use crate::transport::Transport;

/// Sends a conversation to the configured models in priority order and
/// returns the first usable reply, split into text and triage verdict.
pub struct Dispatcher {
    tx: Arc<dyn Transport>,
    config: DispatchConfig,
    retry: RetryPolicy,
    audit: Option<Arc<dyn AuditSink>>,
}

impl Dispatcher {
    pub fn new(tx: Arc<dyn Transport>, config: DispatchConfig, retry: RetryPolicy) -> Self {
        Self {
            tx,
            config,
            retry,
            audit: None,
        }
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn models(&self) -> &[String] {
        &self.config.model_priority
    }

    /// Build the provider request: the most recent `history_window` turns, then the new message.
    pub fn build_request(&self, history: &[ConversationTurn], new_message: &str) -> GenerateRequest {
        let start = history.len().saturating_sub(self.config.history_window);
        let mut contents: Vec<Content> = history[start..]
            .iter()
            .map(|turn| Content::text(Some(turn.role.wire_name()), &turn.text))
            .collect();
        contents.push(Content::text(Some(Role::User.wire_name()), new_message));

        GenerateRequest {
            contents,
            system_instruction: Content::text(None, &self.config.system_instruction),
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            },
        }
    }

    /// Try each configured model in order until one produces a non-blank reply.
    ///
    /// Retryable failures move on to the next model (after at most one
    /// same-model retry for rate limits, depending on the retry policy).
    /// A fatal failure stops immediately. `new_message` is assumed non-empty.
    pub async fn dispatch(
        &self,
        history: &[ConversationTurn],
        new_message: &str,
    ) -> Result<DispatchResult> {
        if self.config.model_priority.is_empty() {
            return Err(TriageError::Config(
                "No model identifiers configured".to_string(),
            ));
        }

        let request = self.build_request(history, new_message);
        let mut attempts: Vec<ModelAttempt> = Vec::new();

        for model in &self.config.model_priority {
            let mut retries_used = 0;
            loop {
                tracing::info!(model = %model, turns = request.contents.len(), "Requesting completion");

                let outcome = self.tx.generate(model, &request).await.and_then(non_blank);
                match outcome {
                    Ok(raw) => {
                        attempts.push(ModelAttempt {
                            model: model.clone(),
                            outcome: AttemptOutcome::Success,
                        });
                        let reply = splitter::split(&raw);
                        tracing::info!(
                            model = %model,
                            attempts = attempts.len(),
                            triage = reply.triage.is_some(),
                            "Completion received"
                        );
                        let result = DispatchResult {
                            text: reply.text,
                            triage: reply.triage,
                            model_used: model.clone(),
                        };
                        self.record_audit(new_message, &result);
                        return Ok(result);
                    }
                    Err(err) if err.is_retryable() => {
                        let delay = self.retry.same_model_delay(&err, retries_used);
                        tracing::warn!(model = %model, error = %err, "Model attempt failed");
                        attempts.push(ModelAttempt {
                            model: model.clone(),
                            outcome: AttemptOutcome::Retryable(err),
                        });
                        match delay {
                            Some(delay) => {
                                retries_used += 1;
                                tracing::info!(
                                    model = %model,
                                    delay_ms = delay.as_millis() as u64,
                                    "Rate limited, retrying same model"
                                );
                                sleep(delay).await;
                            }
                            None => break,
                        }
                    }
                    Err(err) => {
                        attempts.push(ModelAttempt {
                            model: model.clone(),
                            outcome: AttemptOutcome::Fatal(err.clone()),
                        });
                        tracing::error!(
                            model = %model,
                            error = %err,
                            "Fatal provider error after: {}",
                            trail(&attempts)
                        );
                        return Err(TriageError::Fatal {
                            model: model.clone(),
                            source: err,
                        });
                    }
                }
            }
        }

        tracing::error!("All fallback models failed: {}", trail(&attempts));
        Err(TriageError::Exhausted { attempts })
    }

    fn record_audit(&self, user_text: &str, result: &DispatchResult) {
        let Some(sink) = &self.audit else {
            return;
        };
        let record = AuditRecord {
            user_text: user_text.to_string(),
            reply_text: result.text.clone(),
            triage: result.triage.clone(),
            model_used: result.model_used.clone(),
            language: result.triage.as_ref().and_then(|t| t.language.clone()),
            timestamp: Utc::now(),
        };
        audit::emit(Arc::clone(sink), record);
    }
}

fn trail(attempts: &[ModelAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn non_blank(text: String) -> std::result::Result<String, ProviderError> {
    if text.trim().is_empty() {
        Err(ProviderError::EmptyResponse)
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::ErrorKind;
    use crate::models::{TriageVerdict, Urgency};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    type Scripted = std::result::Result<String, ProviderError>;

    // Mock Transport replaying scripted outcomes per model
    struct MockTransport {
        script: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: Mutex<Vec<String>>,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl MockTransport {
        fn new(script: Vec<(&str, Vec<Scripted>)>) -> Self {
            let script = script
                .into_iter()
                .map(|(model, outcomes)| (model.to_string(), outcomes.into()))
                .collect();
            MockTransport {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn generate(&self, model: &str, req: &GenerateRequest) -> Scripted {
            self.calls.lock().unwrap().push(model.to_string());
            self.requests.lock().unwrap().push(req.clone());
            self.script
                .lock()
                .unwrap()
                .get_mut(model)
                .and_then(|outcomes| outcomes.pop_front())
                .unwrap_or_else(|| Err(ProviderError::BadRequest(format!("unscripted call to {model}"))))
        }
    }

    struct CapturingSink {
        records: Mutex<Vec<AuditRecord>>,
        notify: Notify,
    }

    #[async_trait]
    impl AuditSink for CapturingSink {
        async fn record(&self, record: &AuditRecord) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            self.notify.notify_one();
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _record: &AuditRecord) -> Result<()> {
            Err(TriageError::Audit("webhook unreachable".to_string()))
        }
    }

    fn config(models: &[&str]) -> DispatchConfig {
        DispatchConfig {
            model_priority: models.iter().map(|m| m.to_string()).collect(),
            system_instruction: "Be supportive.".to_string(),
            temperature: 0.3,
            history_window: 4,
            ..DispatchConfig::default()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::RateLimitRetry(RetryConfig {
            rate_limit_retry: true,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        })
    }

    fn dispatcher(tx: Arc<MockTransport>, models: &[&str], retry: RetryPolicy) -> Dispatcher {
        Dispatcher::new(tx, config(models), retry)
    }

    fn rate_limited() -> Scripted {
        Err(ProviderError::RateLimited("quota exceeded".to_string()))
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let raw = "I understand that's hard.\n\n```json\n{\"topic\":\"Anxiety\",\"urgency\":\"Medium\",\"suggested_action\":\"breathing exercise\",\"flagged_keywords\":[\"anxious\"]}\n```";
        let tx = Arc::new(MockTransport::new(vec![("m1", vec![Ok(raw.to_string())])]));
        let d = dispatcher(tx.clone(), &["m1"], RetryPolicy::Immediate);

        let result = d.dispatch(&[], "I feel anxious").await.unwrap();

        assert_eq!(result.text, "I understand that's hard.");
        assert_eq!(result.model_used, "m1");
        let triage: TriageVerdict = result.triage.unwrap();
        assert_eq!(triage.topic, "Anxiety");
        assert_eq!(triage.urgency, Urgency::Medium);
        assert_eq!(triage.suggested_action, "breathing exercise");
        assert_eq!(triage.flagged_keywords, vec!["anxious".to_string()]);
    }

    #[tokio::test]
    async fn test_falls_back_after_rate_limit_and_stops_on_success() {
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![rate_limited()]),
            ("B", vec![Ok("Hello from B".to_string())]),
            ("C", vec![Ok("Hello from C".to_string())]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B", "C"], RetryPolicy::Immediate);

        let result = d.dispatch(&[], "hi").await.unwrap();

        assert_eq!(result.model_used, "B");
        assert_eq!(result.text, "Hello from B");
        assert!(result.triage.is_none());
        assert_eq!(tx.calls(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![Err(ProviderError::SafetyBlocked("HARM".to_string()))]),
            ("B", vec![Ok("never".to_string())]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B"], fast_retry());

        let err = d.dispatch(&[], "hi").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(matches!(
            err,
            TriageError::Fatal { ref model, source: ProviderError::SafetyBlocked(_) } if model == "A"
        ));
        assert_eq!(tx.calls(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_all_rate_limited_is_exhausted() {
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![rate_limited()]),
            ("B", vec![rate_limited()]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B"], RetryPolicy::Immediate);

        let err = d.dispatch(&[], "hi").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Exhausted);
        match err {
            TriageError::Exhausted { attempts } => {
                let models: Vec<&str> = attempts.iter().map(|a| a.model.as_str()).collect();
                assert_eq!(models, vec!["A", "B"]);
                assert!(attempts
                    .iter()
                    .all(|a| matches!(a.outcome, AttemptOutcome::Retryable(_))));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blank_reply_advances_to_next_model() {
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![Ok("   \n".to_string())]),
            ("B", vec![Ok("Real answer".to_string())]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B"], fast_retry());

        let result = d.dispatch(&[], "hi").await.unwrap();

        assert_eq!(result.model_used, "B");
        assert_eq!(tx.calls(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_empty_body_and_network_errors_advance() {
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![Err(ProviderError::EmptyResponse)]),
            ("B", vec![Err(ProviderError::Network("connection reset".to_string()))]),
            ("C", vec![Ok("Third time lucky".to_string())]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B", "C"], fast_retry());

        let result = d.dispatch(&[], "hi").await.unwrap();

        assert_eq!(result.model_used, "C");
        assert_eq!(result.text, "Third time lucky");
        assert_eq!(tx.calls(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_trail_lists_every_outcome() {
        let attempts = vec![
            ModelAttempt {
                model: "A".to_string(),
                outcome: AttemptOutcome::Retryable(ProviderError::EmptyResponse),
            },
            ModelAttempt {
                model: "B".to_string(),
                outcome: AttemptOutcome::Fatal(ProviderError::BadRequest("bad".to_string())),
            },
        ];
        let line = trail(&attempts);
        assert!(line.starts_with("A: retryable ("));
        assert!(line.contains("; B: fatal ("));
    }

    #[tokio::test]
    async fn test_fatal_after_fallback_names_failing_model() {
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![rate_limited()]),
            ("B", vec![Err(ProviderError::BadRequest("bad payload".to_string()))]),
            ("C", vec![Ok("never".to_string())]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B", "C"], RetryPolicy::Immediate);

        let err = d.dispatch(&[], "hi").await.unwrap_err();

        assert!(matches!(err, TriageError::Fatal { ref model, .. } if model == "B"));
        assert_eq!(tx.calls(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_no_models_is_configuration_error() {
        let tx = Arc::new(MockTransport::new(vec![]));
        let d = dispatcher(tx.clone(), &[], RetryPolicy::Immediate);

        let err = d.dispatch(&[], "hi").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(tx.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_retries_same_model_once() {
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![rate_limited(), Ok("second try".to_string())]),
            ("B", vec![Ok("fallback".to_string())]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B"], fast_retry());

        let result = d.dispatch(&[], "hi").await.unwrap();

        assert_eq!(result.model_used, "A");
        assert_eq!(tx.calls(), vec!["A", "A"]);
    }

    #[tokio::test]
    async fn test_repeated_rate_limit_moves_on() {
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![rate_limited(), rate_limited()]),
            ("B", vec![Ok("fallback".to_string())]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B"], fast_retry());

        let result = d.dispatch(&[], "hi").await.unwrap();

        assert_eq!(result.model_used, "B");
        assert_eq!(tx.calls(), vec!["A", "A", "B"]);
    }

    #[tokio::test]
    async fn test_server_fault_does_not_retry_same_model() {
        let fault = Err(ProviderError::ServerFault {
            status: 503,
            message: "overloaded".to_string(),
        });
        let tx = Arc::new(MockTransport::new(vec![
            ("A", vec![fault]),
            ("B", vec![Ok("fallback".to_string())]),
        ]));
        let d = dispatcher(tx.clone(), &["A", "B"], fast_retry());

        d.dispatch(&[], "hi").await.unwrap();

        assert_eq!(tx.calls(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_request_uses_trimmed_history_and_roles() {
        let tx = Arc::new(MockTransport::new(vec![("m1", vec![Ok("ok".to_string())])]));
        let d = dispatcher(tx.clone(), &["m1"], RetryPolicy::Immediate);
        let history: Vec<ConversationTurn> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    ConversationTurn::user(format!("u{i}"))
                } else {
                    ConversationTurn::assistant(format!("a{i}"), None)
                }
            })
            .collect();

        d.dispatch(&history, "latest").await.unwrap();

        let requests = tx.requests.lock().unwrap();
        let req = &requests[0];
        let texts: Vec<&str> = req
            .contents
            .iter()
            .map(|c| c.parts[0].text.as_str())
            .collect();
        assert_eq!(texts, vec!["u2", "a3", "u4", "a5", "latest"]);
        let roles: Vec<&str> = req
            .contents
            .iter()
            .map(|c| c.role.as_deref().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user", "model", "user"]);
        assert_eq!(req.system_instruction.parts[0].text, "Be supportive.");
        assert!((req.generation_config.temperature - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_history_snapshot_is_not_modified() {
        let tx = Arc::new(MockTransport::new(vec![("m1", vec![Ok("ok".to_string())])]));
        let d = dispatcher(tx.clone(), &["m1"], RetryPolicy::Immediate);
        let history = vec![ConversationTurn::user("first")];
        let before = history.clone();

        d.dispatch(&history, "second").await.unwrap();

        assert_eq!(history, before);
    }

    #[tokio::test]
    async fn test_audit_record_is_emitted() {
        let raw = "Breathe slowly.\n```json\n{\"topic\":\"Panic\",\"urgency\":\"High\",\"language\":\"en\"}\n```";
        let tx = Arc::new(MockTransport::new(vec![("m1", vec![Ok(raw.to_string())])]));
        let sink = Arc::new(CapturingSink {
            records: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        let d = dispatcher(tx, &["m1"], RetryPolicy::Immediate).with_audit(sink.clone());

        d.dispatch(&[], "my heart is racing").await.unwrap();
        sink.notify.notified().await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_text, "my heart is racing");
        assert_eq!(records[0].reply_text, "Breathe slowly.");
        assert_eq!(records[0].model_used, "m1");
        assert_eq!(records[0].language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_affect_result() {
        let tx = Arc::new(MockTransport::new(vec![("m1", vec![Ok("fine".to_string())])]));
        let d = dispatcher(tx, &["m1"], RetryPolicy::Immediate).with_audit(Arc::new(BrokenSink));

        let result = d.dispatch(&[], "hi").await.unwrap();

        assert_eq!(result.text, "fine");
    }
}
