use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::{ErrorKind, TriageError};
use crate::models::ConversationTurn;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// HTTP-facing wrapper so handlers can return `Result<_, ApiError>`.
pub enum ApiError {
    BadRequest(String),
    Dispatch(TriageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "bad_request",
                    message,
                },
            ),
            ApiError::Dispatch(err) => {
                let kind = err.kind();
                let status = match kind {
                    ErrorKind::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::Fatal => StatusCode::BAD_GATEWAY,
                };
                (
                    status,
                    ErrorBody {
                        error: kind.as_str(),
                        message: err.to_string(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

async fn chat(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let result = dispatcher
        .dispatch(&req.history, &req.message)
        .await
        .map_err(ApiError::Dispatch)?;
    Ok(Json(result))
}

/// Build the application router. `bearer_token` enables auth on everything except `/health`.
pub fn router(dispatcher: Arc<Dispatcher>, bearer_token: Option<String>) -> Router {
    let mut router = Router::new()
        .route("/api/chat", post(chat))
        .with_state(dispatcher);

    if let Some(expected) = bearer_token {
        router = router.layer(middleware::from_fn_with_state(
            Arc::new(expected),
            require_bearer,
        ));
    }

    router.route("/health", get(|| async { "ok" }))
}

async fn require_bearer(
    State(expected): State<Arc<String>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let headers: &HeaderMap = req.headers();
    let authorized = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected.as_str());
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::error::ProviderError;
    use crate::models::GenerateRequest;
    use crate::retry::RetryPolicy;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use tower::ServiceExt;

    struct FixedTransport(std::result::Result<String, ProviderError>);

    #[async_trait]
    impl Transport for FixedTransport {
        async fn generate(
            &self,
            _model: &str,
            _req: &GenerateRequest,
        ) -> std::result::Result<String, ProviderError> {
            self.0.clone()
        }
    }

    fn app(reply: std::result::Result<String, ProviderError>, token: Option<&str>) -> Router {
        let dispatcher = Dispatcher::new(
            Arc::new(FixedTransport(reply)),
            DispatchConfig {
                model_priority: vec!["m1".to_string(), "m2".to_string()],
                ..DispatchConfig::default()
            },
            RetryPolicy::Immediate,
        );
        router(Arc::new(dispatcher), token.map(str::to_string))
    }

    fn chat_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_chat_returns_split_reply() {
        let raw = "Take a breath.\n```json\n{\"topic\":\"Panic\",\"urgency\":\"High\"}\n```";
        let response = app(Ok(raw.to_string()), None)
            .oneshot(chat_request(serde_json::json!({
                "history": [{"role": "user", "text": "hello"}, {"role": "model", "text": "hi"}],
                "message": "I can't breathe"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["text"], "Take a breath.");
        assert_eq!(body["modelUsed"], "m1");
        assert_eq!(body["triage"]["urgency"], "High");
    }

    #[tokio::test]
    async fn test_exhausted_maps_to_503() {
        let response = app(Err(ProviderError::RateLimited("429".into())), None)
            .oneshot(chat_request(serde_json::json!({"message": "hi"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "exhausted");
    }

    #[tokio::test]
    async fn test_fatal_maps_to_502() {
        let response = app(Err(ProviderError::BadRequest("bad".into())), None)
            .oneshot(chat_request(serde_json::json!({"message": "hi"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["error"], "fatal");
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let response = app(Ok("unused".into()), None)
            .oneshot(chat_request(serde_json::json!({"message": "   "})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let unauthorized = app(Ok("fine".into()), Some("s3cret"))
            .oneshot(chat_request(serde_json::json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let mut req = chat_request(serde_json::json!({"message": "hi"}));
        req.headers_mut()
            .insert("authorization", "Bearer s3cret".parse().unwrap());
        let authorized = app(Ok("fine".into()), Some("s3cret"))
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(authorized.status(), StatusCode::OK);

        let health = app(Ok("fine".into()), Some("s3cret"))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }
}
