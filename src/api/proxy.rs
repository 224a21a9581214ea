//! OpenAI-compatible proxy endpoint.
//!
//! Receives `POST /v1/chat/completions`, translates it into the upstream
//! envelope and runs it through the failover orchestrator. Non-streaming
//! requests get one aggregated completion; streaming requests get one SSE
//! chunk per reconstructed fragment.
//!
//! Streaming waits for the first outcome before committing to
//! `text/event-stream`, so a request that fails before producing anything
//! still gets a real HTTP error status.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::auth::verify_bearer;
use super::routes::AppState;
use crate::emitter::{Aggregator, ChannelSink, FragmentSink, ResponseContext, StreamItem};
use crate::error::ProxyError;
use crate::models::ModelDescriptor;
use crate::openai::{ChatCompletionRequest, ModelObject, ModelsResponse};
use crate::translate::translate;

const TEXT_EVENT_STREAM: &str = "text/event-stream";
const NO_CACHE: &str = "no-cache";
const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";
const STREAM_CHANNEL_CAPACITY: usize = 64;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/models", get(list_models))
}

async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = verify_bearer(&headers, &state.config.api_keys) {
        return e.into_response();
    }
    let data = ModelDescriptor::all()
        .iter()
        .map(|m| ModelObject {
            id: m.name.to_string(),
            object: "model",
        })
        .collect();
    Json(ModelsResponse {
        object: "list",
        data,
    })
    .into_response()
}

/// A validated request ready to send upstream.
struct PreparedRequest {
    request: ChatCompletionRequest,
    upstream_body: Bytes,
    context: ResponseContext,
}

/// Parse and validate the client body, then build the upstream envelope.
fn prepare(state: &AppState, body: &[u8]) -> Result<PreparedRequest, ProxyError> {
    let mut request: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    request.remove_empty_messages();

    let model = ModelDescriptor::lookup(&request.model)
        .ok_or_else(|| ProxyError::UnknownModel(request.model.clone()))?;
    if let Some(requested) = request.max_tokens {
        if requested > i64::from(model.max_tokens) {
            return Err(ProxyError::MaxTokensExceeded {
                requested,
                limit: model.max_tokens,
            });
        }
    }

    let envelope = translate(&request, model);
    let serialized = serde_json::to_string(&envelope)?;
    let prompt_tokens = state.tokens.count(&serialized, &request.model);

    debug!(
        model = %request.model,
        upstream_model = model.upstream_id,
        messages = envelope.messages.len(),
        max_tokens = envelope.max_tokens,
        prompt_tokens,
        "Translated request"
    );

    let context = ResponseContext::new(request.model.clone(), prompt_tokens);
    Ok(PreparedRequest {
        request,
        upstream_body: Bytes::from(serialized),
        context,
    })
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = verify_bearer(&headers, &state.config.api_keys) {
        return e.into_response();
    }

    let prepared = match prepare(&state, &body) {
        Ok(p) => p,
        Err(e) => {
            info!(error = %e, "Rejected chat completion request");
            return e.into_response();
        }
    };

    info!(
        model = %prepared.request.model,
        stream = prepared.request.stream,
        messages = prepared.request.messages.len(),
        "Chat completion request"
    );

    if prepared.request.stream {
        stream_completion(state, prepared).await
    } else {
        aggregate_completion(&state, prepared).await
    }
}

async fn aggregate_completion(state: &AppState, prepared: PreparedRequest) -> Response {
    let PreparedRequest {
        upstream_body,
        context,
        ..
    } = prepared;

    let mut sink = Aggregator::new();
    match state.orchestrator.execute(upstream_body, &mut sink).await {
        Ok(report) => {
            let content = sink.into_content();
            let usage = context.usage(state.tokens.as_ref(), &content);
            info!(
                model = %context.model,
                attempts = report.attempts,
                completion_tokens = usage.completion_tokens,
                "Chat completion finished"
            );
            Json(context.completion(content, usage)).into_response()
        }
        Err(e) => {
            error!(model = %context.model, error = %e, "Chat completion failed");
            e.into_response()
        }
    }
}

async fn stream_completion(state: Arc<AppState>, prepared: PreparedRequest) -> Response {
    let PreparedRequest {
        upstream_body,
        context,
        ..
    } = prepared;

    let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    {
        let state = Arc::clone(&state);
        let context = context.clone();
        tokio::spawn(async move {
            let mut sink = ChannelSink::new(tx.clone());
            let item = match state.orchestrator.execute(upstream_body, &mut sink).await {
                Ok(report) => {
                    let usage = context.usage(state.tokens.as_ref(), sink.content());
                    info!(
                        model = %context.model,
                        attempts = report.attempts,
                        completion_tokens = usage.completion_tokens,
                        "Streaming completion finished"
                    );
                    StreamItem::Finished(usage)
                }
                Err(ProxyError::ClientDisconnected) => {
                    info!(model = %context.model, "Client disconnected mid-stream");
                    return;
                }
                Err(e) => {
                    error!(model = %context.model, error = %e, "Streaming completion failed");
                    StreamItem::Failed(e)
                }
            };
            let _ = tx.send(item).await;
        });
    }

    // Nothing has been written yet: failures here still get a real status.
    let first = match rx.recv().await {
        Some(StreamItem::Failed(e)) => return e.into_response(),
        Some(item) => item,
        None => {
            return ProxyError::Upstream("Stream ended before any output".to_string())
                .into_response()
        }
    };

    let stream = async_stream::stream! {
        let mut next = Some(first);
        while let Some(item) = next {
            match item {
                StreamItem::Fragment(fragment) => {
                    yield sse_event(&context.chunk(fragment));
                }
                StreamItem::Finished(usage) => {
                    yield sse_event(&context.final_chunk(usage));
                    yield Ok(Bytes::from_static(DONE_EVENT));
                    break;
                }
                StreamItem::Failed(e) => {
                    yield sse_event(&e.body());
                    break;
                }
            }
            next = rx.recv().await;
        }
    };

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_EVENT_STREAM));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// One `data: <json>` SSE event.
fn sse_event<T: Serialize>(value: &T) -> Result<Bytes, std::io::Error> {
    let json = serde_json::to_string(value).map_err(std::io::Error::other)?;
    Ok(Bytes::from(format!("data: {}\n\n", json)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credentials::Credential;
    use crate::tokens::HeuristicTokenCounter;
    use crate::upstream::{UpstreamEvent, UpstreamTransport};
    use async_trait::async_trait;
    use axum::http::Request;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    /// Replays scripted upstream streams in call order and records bodies.
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Vec<UpstreamEvent>>>,
        bodies: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl UpstreamTransport for ScriptedTransport {
        async fn open_stream(
            &self,
            body: Bytes,
            _credential: &Credential,
        ) -> Result<mpsc::Receiver<UpstreamEvent>, ProxyError> {
            self.bodies
                .lock()
                .await
                .push(serde_json::from_slice(&body).unwrap());
            let script = self.scripts.lock().await.pop_front().unwrap_or_default();
            let (tx, rx) = mpsc::channel(script.len().max(1));
            for event in script {
                tx.send(event).await.unwrap();
            }
            Ok(rx)
        }
    }

    fn text(value: &str, thinking: bool) -> UpstreamEvent {
        UpstreamEvent::message(
            serde_json::json!({"sections": [{"text": {"text": value, "is_thinking": thinking}}]})
                .to_string(),
        )
    }

    fn done() -> UpstreamEvent {
        UpstreamEvent::terminal("[DONE]")
    }

    fn setup(
        config: Config,
        scripts: Vec<Vec<UpstreamEvent>>,
    ) -> (Router, Arc<ScriptedTransport>, Arc<AppState>) {
        let transport = Arc::new(ScriptedTransport {
            scripts: Mutex::new(scripts.into()),
            bodies: Mutex::new(Vec::new()),
        });
        let state = Arc::new(AppState::new(
            config,
            transport.clone(),
            Arc::new(HeuristicTokenCounter),
        ));
        (super::super::routes::router(state.clone()), transport, state)
    }

    fn default_config() -> Config {
        Config::new(vec![Credential::new("cookie-one"), Credential::new("cookie-two")])
    }

    fn chat(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
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

    async fn text_body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn sse_payloads(body: &str) -> Vec<String> {
        body.split("\n\n")
            .filter_map(|event| event.strip_prefix("data: "))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn aggregate_response_with_thinking() {
        let (app, transport, _) = setup(
            default_config(),
            vec![vec![
                text("plan", true),
                text("plan more", true),
                text("answer", false),
                done(),
            ]],
        );

        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "claude-3-7-sonnet-thinking",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": ""},
                    {"role": "user", "content": "hi"}
                ]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "claude-3-7-sonnet-thinking");
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "<think>\n\nplan more\nanswer\n\n</think>\n\n"
        );
        let usage = &body["usage"];
        assert_eq!(
            usage["total_tokens"].as_u64().unwrap(),
            usage["prompt_tokens"].as_u64().unwrap() + usage["completion_tokens"].as_u64().unwrap()
        );

        let sent = transport.bodies.lock().await;
        assert_eq!(sent[0]["model"], "agent_sonnet_37");
        let messages = sent[0]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "System");
        assert_eq!(messages[1]["think_first"], true);
    }

    #[tokio::test]
    async fn streaming_response_chunks_and_done() {
        let (app, _, _) = setup(
            default_config(),
            vec![vec![text("Hello", false), text("Hello world", false), done()]],
        );

        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "gpt-4o",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            TEXT_EVENT_STREAM
        );
        let payloads = sse_payloads(&text_body(response).await);
        assert_eq!(payloads.len(), 4);
        assert_eq!(payloads[3], "[DONE]");

        let first: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(&payloads[1]).unwrap();
        let last: serde_json::Value = serde_json::from_str(&payloads[2]).unwrap();
        assert_eq!(first["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(second["choices"][0]["delta"]["content"], " world");
        assert!(first.get("usage").is_none());
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert!(last["usage"]["completion_tokens"].as_u64().unwrap() > 0);
        assert_eq!(first["id"], last["id"]);
    }

    #[tokio::test]
    async fn unknown_model_is_bad_request() {
        let (app, transport, _) = setup(default_config(), Vec::new());
        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "gpt-99",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["message"], "Model gpt-99 not supported");
        assert_eq!(body["error"]["code"], "invalid_model");
        assert!(transport.bodies.lock().await.is_empty());
    }

    #[tokio::test]
    async fn max_tokens_boundary() {
        let (app, _, _) = setup(default_config(), vec![vec![text("ok", false), done()]]);
        let at_limit = app
            .clone()
            .oneshot(chat(serde_json::json!({
                "model": "gpt-4o",
                "max_tokens": 100000,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(at_limit.status(), StatusCode::OK);

        let over = app
            .oneshot(chat(serde_json::json!({
                "model": "gpt-4o",
                "max_tokens": 100001,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(over.status(), StatusCode::BAD_REQUEST);
        let body = json_body(over).await;
        assert_eq!(body["error"]["code"], "invalid_max_tokens");
    }

    #[tokio::test]
    async fn malformed_body_is_server_error() {
        let (app, _, _) = setup(default_config(), Vec::new());
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn exhausted_pool_before_stream_returns_error_status() {
        let (app, _, state) = setup(
            default_config(),
            vec![
                vec![UpstreamEvent::terminal("rate limit exceeded")],
                vec![UpstreamEvent::terminal("rate limit exceeded")],
            ],
        );
        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "gpt-4o",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(
            body["error"]["message"],
            "All cookies are temporarily unavailable."
        );
        assert_eq!(state.pool.stats().await.rate_limited, 2);
    }

    #[tokio::test]
    async fn failure_after_content_is_sent_in_stream() {
        let (app, _, _) = setup(
            default_config(),
            vec![vec![text("partial", false), UpstreamEvent::message("{oops")]],
        );
        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "gpt-4o",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let payloads = sse_payloads(&text_body(response).await);
        assert_eq!(payloads.len(), 2);
        let error: serde_json::Value = serde_json::from_str(&payloads[1]).unwrap();
        assert_eq!(error["error"]["code"], "upstream_error");
        assert!(!payloads.iter().any(|p| p == "[DONE]"));
    }

    #[tokio::test]
    async fn language_refusal_is_not_retried() {
        let (app, transport, _) = setup(
            default_config(),
            vec![
                vec![UpstreamEvent::terminal("please use English")],
                vec![text("never", false), done()],
            ],
        );
        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "你好"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "unsupported_language");
        assert_eq!(transport.bodies.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn models_are_listed() {
        let (app, _, _) = setup(default_config(), Vec::new());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["object"], "list");
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"claude-3-7-sonnet-thinking"));
        assert!(ids.contains(&"gpt-4o"));
        assert_eq!(body["data"][0]["object"], "model");
    }

    #[tokio::test]
    async fn api_secret_is_enforced_on_v1_only() {
        let mut config = default_config();
        config.api_keys = vec!["sk-test".to_string()];
        let (app, _, _) = setup(config, vec![vec![text("ok", false), done()]]);

        let denied = app
            .clone()
            .oneshot(chat(serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut allowed = chat(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        allowed
            .headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-test"));
        assert_eq!(
            app.clone().oneshot(allowed).await.unwrap().status(),
            StatusCode::OK
        );

        let health = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let body = json_body(health).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["credentials"]["active"], 2);
    }
}
