//! Generic completions dispatcher: authentication, validation, rate limiting
//! and flagging, then the upstream call and response relay. Provider
//! specifics live behind [`ProviderAdapter`].

use std::io::BufReader;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::actor::{Actor, Feature};
use crate::error::GatewayError;
use crate::flagging::FlaggingRequest;
use crate::logging::EventName;
use crate::providers::{ProviderAdapter, UNKNOWN_TOKENS, UpstreamRequest, UsageStats};
use crate::ratelimit::Decision;
use crate::server::AppState;
use crate::server::request_logging::CompletionEvent;
use crate::server::storage_traits::BoxFuture;
use crate::server::tee::{ChannelReader, UsageTee};
use crate::server::util::{bearer_token, forwardable_headers, mask_key, retry_after_seconds};

/// Upstream error bodies are logged up to this many bytes.
const MAX_LOGGED_ERROR_BODY: usize = 1024;

/// Transport used for upstream calls.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error>;
}

#[async_trait]
impl UpstreamClient for reqwest::Client {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        reqwest::Client::execute(self, request).await
    }
}

/// Object-safe entry point used by the router's dispatch table.
pub trait CompletionsHandler: Send + Sync {
    fn handle<'a>(&'a self, state: &'a AppState, headers: HeaderMap, body: Bytes) -> BoxFuture<'a, Response>;
}

pub struct UpstreamHandler<P: ProviderAdapter> {
    adapter: Arc<P>,
    upstream: Arc<dyn UpstreamClient>,
}

impl<P: ProviderAdapter> UpstreamHandler<P> {
    pub fn new(adapter: P, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self {
            adapter: Arc::new(adapter),
            upstream,
        }
    }

    async fn serve(&self, state: &AppState, headers: HeaderMap, body: Bytes, trace_id: String) -> Response {
        let feature = Feature::from_headers(&headers);
        let feature_name = feature.as_ref().map(Feature::as_str).unwrap_or("unknown");
        tracing::Span::current().record("feature", feature_name);
        let mut event = CompletionEvent::new(state.event_logger.clone(), P::NAME, feature_name, &trace_id);

        let outcome = match feature {
            Ok(feature) => self.forward(state, &headers, body, feature, &trace_id, &mut event).await,
            Err(e) => Err(e),
        };

        let (response, request) = match outcome {
            Ok(ok) => ok,
            Err(err) => {
                let status = err.status_code();
                event.set("error", json!(err.client_message()));
                event.emit(event_name_for(&err), status);
                return err.into_response();
            }
        };

        let status = response.status();
        if status.is_success() {
            return self.relay(response, request, event).await;
        }

        event.set("upstream_status", json!(status.as_u16()));
        let upstream_headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e.without_url(), "failed to read upstream error body");
                Bytes::new()
            }
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            // 上游共享配额耗尽属于网关可用性问题，不应表现为调用方限流
            let retry = retry_after_seconds(&upstream_headers)
                .unwrap_or(self.adapter.config().default_retry_after_seconds);
            tracing::warn!(retry_after = retry, "upstream rate limited");
            let err = GatewayError::UpstreamUnavailable { retry_after_seconds: retry };
            event.emit(EventName::UpstreamFailed, err.status_code());
            return err.into_response();
        }

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                body = %truncate_for_log(&body),
                "upstream returned server error"
            );
            event.emit(EventName::UpstreamFailed, status);
            return GatewayError::UpstreamStatus(status).into_response();
        }

        tracing::info!(status = status.as_u16(), "upstream rejected request");
        event.emit(EventName::UpstreamFailed, status);
        let mut resp = Response::new(Body::from(body));
        *resp.status_mut() = status;
        *resp.headers_mut() = forwardable_headers(&upstream_headers);
        resp
    }

    /// Runs every check and issues the upstream call. Blocked or rejected
    /// requests return before anything is sent upstream.
    async fn forward(
        &self,
        state: &AppState,
        headers: &HeaderMap,
        body: Bytes,
        feature: Feature,
        trace_id: &str,
        event: &mut CompletionEvent,
    ) -> Result<(reqwest::Response, P::Request), GatewayError> {
        let actor = authenticate(state, headers)?;
        event.set_actor(&actor);

        let mut request: P::Request = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Validation(format!("failed to parse request body: {e}")))?;
        let (model, metadata) = self.adapter.get_request_metadata(&request);
        event.extend(metadata);

        let config = self.adapter.config();
        if !config.allowed_models.contains(&model) {
            return Err(model_not_allowed(&model));
        }
        let limit = actor
            .rate_limit(feature)
            .ok_or_else(|| GatewayError::FeatureNotAllowed(feature.to_string()))?;
        if !limit.allows_model(&model) {
            return Err(model_not_allowed(&model));
        }

        if let Decision::Exceeded {
            used,
            limit: max,
            retry_after,
        } = state.rate_limiter.try_acquire(&actor, feature, limit).await
        {
            // 每个窗口只通知第一次超限
            if used == max + 1 {
                state.notifier.notify(&actor, feature, used, max);
            }
            let retry_after_seconds = retry_after
                .map(|d| d.as_secs().max(1))
                .unwrap_or(config.default_retry_after_seconds);
            return Err(GatewayError::RateLimited {
                limit: max,
                used,
                retry_after_seconds,
            });
        }

        let flagging = self.adapter.validate_request(feature, &request)?;
        event.set("flagged", json!(flagging.is_some()));
        if let Some(result) = &flagging {
            event.set_flagging(result, actor.dotcom);
            tracing::warn!(
                actor = %actor.id,
                reasons = ?result.reasons,
                blocked = result.should_block,
                "request flagged"
            );
            let prompt = request.flattened_prompt().into_owned();
            if let Err(e) = state.prompt_recorder.record(&prompt).await {
                tracing::warn!(error = %e, "failed to record flagged prompt");
            }
            if result.should_block {
                return Err(GatewayError::Blocked {
                    trace_id: trace_id.to_string(),
                    contact: state.config.server.support_contact.clone(),
                });
            }
        }

        self.adapter.transform_body(&mut request, &actor.id);
        let payload = serde_json::to_vec(&request)
            .map_err(|e| GatewayError::Internal(format!("failed to encode upstream body: {e}")))?;
        let url = reqwest::Url::parse(&self.adapter.get_api_url(feature, &request))
            .map_err(|e| GatewayError::Config(format!("invalid {} upstream url: {e}", P::NAME)))?;

        let mut upstream_request = reqwest::Request::new(Method::POST, url);
        *upstream_request.body_mut() = Some(payload.into());
        self.adapter.transform_request(&mut upstream_request)?;

        let response = self.upstream.execute(upstream_request).await.map_err(|e| {
            let e = e.without_url();
            tracing::error!(error = %e, "upstream request failed");
            GatewayError::Http(e)
        })?;
        Ok((response, request))
    }

    /// Mirrors a 2xx upstream response while the usage extractor reads a copy
    /// of the body on a blocking worker.
    async fn relay(&self, response: reqwest::Response, request: P::Request, event: CompletionEvent) -> Response {
        let status = response.status();
        let headers = forwardable_headers(response.headers());
        let auto_flush = request.should_stream() && self.adapter.config().auto_flush_streaming_responses;

        let (tx, rx) = mpsc::unbounded_channel();
        let completed = Arc::new(AtomicBool::new(false));
        let mut tee = UsageTee::new(response.bytes_stream().boxed(), tx, completed.clone());

        let adapter = self.adapter.clone();
        let usage = tokio::task::spawn_blocking(move || {
            let mut reader = BufReader::new(ChannelReader::new(rx));
            adapter.parse_response_and_usage(&request, &mut reader)
        });

        let body = if auto_flush {
            Body::from_stream(tee)
        } else {
            let mut buffered = Vec::new();
            while let Some(chunk) = tee.next().await {
                match chunk {
                    Ok(c) => buffered.extend_from_slice(&c),
                    Err(e) => {
                        let mut event = event;
                        event.set("stream_completed", json!(false));
                        let err = GatewayError::Http(e);
                        event.emit(EventName::UpstreamFailed, err.status_code());
                        return err.into_response();
                    }
                }
            }
            Body::from(buffered)
        };

        tokio::spawn(
            finish_usage(usage, completed, event, status).instrument(tracing::Span::current()),
        );

        let mut resp = Response::new(body);
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        resp
    }
}

impl<P: ProviderAdapter> CompletionsHandler for UpstreamHandler<P> {
    fn handle<'a>(&'a self, state: &'a AppState, headers: HeaderMap, body: Bytes) -> BoxFuture<'a, Response> {
        let trace_id = uuid::Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!(
            "completions",
            provider = P::NAME,
            trace_id = %trace_id,
            feature = tracing::field::Empty
        );
        Box::pin(self.serve(state, headers, body, trace_id).instrument(span))
    }
}

async fn finish_usage(
    usage: tokio::task::JoinHandle<(UsageStats, UsageStats)>,
    completed: Arc<AtomicBool>,
    mut event: CompletionEvent,
    status: StatusCode,
) {
    let (prompt, mut completion) = match usage.await {
        Ok(u) => u,
        Err(e) => {
            tracing::error!(error = %e, "usage extraction task failed");
            (UsageStats::default(), UsageStats::unknown_tokens(0))
        }
    };
    let finished = completed.load(Ordering::SeqCst);
    if !finished {
        completion.tokens = UNKNOWN_TOKENS;
        completion.tokenizer_tokens = UNKNOWN_TOKENS;
    }
    event.set_usage(prompt, completion);
    event.set("stream_completed", json!(finished));
    event.emit(EventName::CompletionsFinished, status);
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Actor, GatewayError> {
    let token = bearer_token(headers)
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer token".into()))?;
    state.actors.resolve(&token).ok_or_else(|| {
        tracing::warn!(token = %mask_key(&token), "unknown access token");
        GatewayError::Unauthorized("invalid access token".into())
    })
}

fn model_not_allowed(model: &str) -> GatewayError {
    GatewayError::Validation(format!("model {model:?} is not allowed"))
}

fn event_name_for(err: &GatewayError) -> EventName {
    match err {
        GatewayError::Unauthorized(_) => EventName::Unauthorized,
        GatewayError::RateLimited { .. } => EventName::RateLimited,
        GatewayError::Blocked { .. } => EventName::RequestBlocked,
        GatewayError::Http(_)
        | GatewayError::UpstreamStatus(_)
        | GatewayError::UpstreamUnavailable { .. } => EventName::UpstreamFailed,
        _ => EventName::RequestRejected,
    }
}

fn truncate_for_log(body: &[u8]) -> String {
    let end = body.len().min(MAX_LOGGED_ERROR_BODY);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use axum::http::{HeaderValue, header};

    use super::*;
    use crate::actor::{ActorSource, StaticActorSource};
    use crate::config::Settings;
    use crate::logging::event_logger::testing::MemoryEventLogger;
    use crate::logging::{Event, EventLogger};
    use crate::providers::{AnthropicAdapter, FireworksAdapter, UpstreamHandlerConfig};
    use crate::ratelimit::{MemoryRateLimitStore, NoopNotifier, RateLimitNotifier, RateLimiter};
    use crate::server::storage_traits::PromptRecorder;

    const CONFIG: &str = r#"
[server]
host = "127.0.0.1"
port = 0
support_contact = "abuse@example.com"

[completions.anthropic]
access_token = "sk-ant"
allowed_models = ["claude-2", "claude-instant"]
max_tokens_to_sample = 2000

[completions.anthropic.flagging]
allowed_prompt_patterns = ["you are cody-gateway."]
blocked_prompt_patterns = ["forbidden phrase"]
request_blocking_enabled = true

[completions.fireworks]
access_token = "fw"
allowed_models = ["starcoder"]
auto_flush_streaming_responses = true

[[actors]]
token = "good-token"
id = "actor-1"
dotcom = true

[actors.rate_limits.chat_completions]
limit = 2
interval_seconds = 60
allowed_models = ["claude-2", "starcoder"]

[actors.rate_limits.code_completions]
limit = 10
interval_seconds = 60
"#;

    struct CannedResponse {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: String,
    }

    enum Reply {
        Canned(CannedResponse),
        /// 200 SSE body that sends `chunks` and then never ends.
        Hanging(Vec<&'static str>),
        TransportError,
    }

    /// Records every call and answers with a canned response.
    struct MockUpstream {
        calls: AtomicUsize,
        requests: Mutex<Vec<(String, HeaderMap, Vec<u8>)>>,
        reply: Reply,
    }

    impl MockUpstream {
        fn new(status: u16, body: &str) -> Arc<Self> {
            Self::with_headers(status, vec![], body)
        }

        fn with_headers(status: u16, headers: Vec<(&'static str, &'static str)>, body: &str) -> Arc<Self> {
            Self::replying(Reply::Canned(CannedResponse {
                status,
                headers,
                body: body.to_string(),
            }))
        }

        fn replying(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                reply,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = request
                .body()
                .and_then(|b| b.as_bytes())
                .map(|b| b.to_vec())
                .unwrap_or_default();
            self.requests
                .lock()
                .unwrap()
                .push((request.url().to_string(), request.headers().clone(), body));

            match &self.reply {
                Reply::Canned(canned) => {
                    let mut builder = axum::http::Response::builder().status(canned.status);
                    for (k, v) in &canned.headers {
                        builder = builder.header(*k, *v);
                    }
                    Ok(reqwest::Response::from(builder.body(canned.body.clone()).unwrap()))
                }
                Reply::Hanging(chunks) => {
                    let items: Vec<Result<Bytes, std::io::Error>> =
                        chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
                    let stream = futures_util::stream::iter(items).chain(futures_util::stream::pending());
                    let resp = axum::http::Response::builder()
                        .status(200)
                        .header("content-type", "text/event-stream")
                        .body(reqwest::Body::wrap_stream(stream))
                        .unwrap();
                    Ok(reqwest::Response::from(resp))
                }
                // 无效 URL 在构建阶段就失败，得到一个传输层错误
                Reply::TransportError => Err(reqwest::Client::new().get("not a url").build().unwrap_err()),
            }
        }
    }

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    impl RateLimitNotifier for CountingNotifier {
        fn notify(&self, _actor: &Actor, _feature: Feature, _used: u64, _limit: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MemoryRecorder(Mutex<Vec<String>>);

    impl PromptRecorder for MemoryRecorder {
        fn record<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, crate::error::Result<()>> {
            self.0.lock().unwrap().push(prompt.to_string());
            Box::pin(async { Ok(()) })
        }
    }

    struct Harness {
        state: AppState,
        events: Arc<MemoryEventLogger>,
        recorder: Arc<MemoryRecorder>,
        notifier: Arc<CountingNotifier>,
    }

    fn harness() -> Harness {
        let config = Settings::from_toml_str(CONFIG).unwrap();
        let events = Arc::new(MemoryEventLogger::default());
        let recorder = Arc::new(MemoryRecorder::default());
        let notifier = Arc::new(CountingNotifier::default());
        let state = AppState {
            actors: Arc::new(StaticActorSource::from_config(&config.actors).unwrap()),
            rate_limiter: Arc::new(RateLimiter::new(Arc::new(MemoryRateLimitStore::new()))),
            notifier: notifier.clone() as Arc<dyn RateLimitNotifier>,
            event_logger: events.clone() as Arc<dyn EventLogger>,
            prompt_recorder: recorder.clone() as Arc<dyn PromptRecorder>,
            handlers: Arc::new(HashMap::new()),
            config,
        };
        Harness {
            state,
            events,
            recorder,
            notifier,
        }
    }

    fn anthropic(state: &AppState, upstream: Arc<MockUpstream>) -> UpstreamHandler<AnthropicAdapter> {
        let cfg = state.config.completions.anthropic.as_ref().unwrap();
        let adapter = AnthropicAdapter::new(
            UpstreamHandlerConfig::from_provider(cfg, crate::providers::anthropic::DEFAULT_BASE_URL),
            None,
        );
        UpstreamHandler::new(adapter, upstream)
    }

    fn fireworks(state: &AppState, upstream: Arc<MockUpstream>) -> UpstreamHandler<FireworksAdapter> {
        let cfg = state.config.completions.fireworks.as_ref().unwrap();
        let adapter = FireworksAdapter::new(
            UpstreamHandlerConfig::from_provider(cfg, crate::providers::fireworks::DEFAULT_BASE_URL),
            None,
        );
        UpstreamHandler::new(adapter, upstream)
    }

    fn headers(token: Option<&'static str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(t) = token {
            h.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {t}")).unwrap(),
            );
        }
        h
    }

    async fn body_of(resp: Response) -> (StatusCode, HeaderMap, String) {
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn single(events: &[Event]) -> &Event {
        assert_eq!(events.len(), 1, "expected exactly one event, got {events:?}");
        &events[0]
    }

    const GOOD_PROMPT: &str = r#"{"prompt":"You are Cody-Gateway. Hi","model":"claude-2","max_tokens_to_sample":100}"#;

    #[tokio::test]
    async fn blocked_request_never_reaches_upstream() {
        let h = harness();
        let upstream = MockUpstream::new(200, r#"{"completion":"nope"}"#);
        let handler = anthropic(&h.state, upstream.clone());

        let body = r#"{"prompt":"say the forbidden phrase","model":"claude-2","max_tokens_to_sample":10}"#;
        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(body)).await;
        let (status, _, text) = body_of(resp).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(text.contains("abuse@example.com"));
        assert_eq!(upstream.calls(), 0);
        assert_eq!(h.recorder.0.lock().unwrap().len(), 1);

        let events = h.events.wait_for(1).await;
        let ev = single(&events);
        assert_eq!(ev.name, EventName::RequestBlocked);
        assert_eq!(ev.identifier, "actor-1");
        assert_eq!(ev.metadata["flagged"], true);
        assert!(text.contains(ev.metadata["trace_id"].as_str().unwrap()));
        // dotcom actor: prompt prefix is kept
        assert_eq!(ev.metadata["prompt_prefix"], "say the forbidden phrase");
    }

    #[tokio::test]
    async fn buffered_success_is_mirrored_and_logged() {
        let h = harness();
        let upstream = MockUpstream::with_headers(
            200,
            vec![("content-type", "application/json"), ("x-upstream", "1")],
            r#"{"completion":"héllo","stop_reason":"stop_sequence"}"#,
        );
        let handler = anthropic(&h.state, upstream.clone());

        let mut hdrs = headers(Some("good-token"));
        hdrs.insert("x-gateway-feature", HeaderValue::from_static("code_completions"));
        let resp = handler.handle(&h.state, hdrs, Bytes::from(GOOD_PROMPT)).await;
        let (status, resp_headers, text) = body_of(resp).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, r#"{"completion":"héllo","stop_reason":"stop_sequence"}"#);
        assert_eq!(resp_headers["x-upstream"], "1");

        let requests = upstream.requests.lock().unwrap();
        let (url, up_headers, up_body) = &requests[0];
        assert_eq!(url, "https://api.anthropic.com/v1/complete");
        assert_eq!(up_headers["x-api-key"], "sk-ant");
        let sent: serde_json::Value = serde_json::from_slice(up_body).unwrap();
        assert_eq!(sent["metadata"]["user_id"], "actor-1");
        drop(requests);

        let events = h.events.wait_for(1).await;
        let ev = single(&events);
        assert_eq!(ev.name, EventName::CompletionsFinished);
        assert_eq!(ev.metadata["feature"], "code_completions");
        assert_eq!(ev.metadata["model"], "claude-2");
        assert_eq!(ev.metadata["flagged"], false);
        assert_eq!(ev.metadata["completion_usage"]["characters"], 5);
        assert_eq!(ev.metadata["completion_usage"]["tokens"], -1);
        assert_eq!(ev.metadata["prompt_character_count"], 24);
        assert_eq!(ev.metadata["stream_completed"], true);
    }

    #[tokio::test]
    async fn streaming_response_is_relayed_byte_for_byte() {
        let h = harness();
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n: keepalive\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\ndata: [DONE]\n\n";
        let upstream = MockUpstream::with_headers(200, vec![("content-type", "text/event-stream")], sse);
        let handler = fireworks(&h.state, upstream.clone());

        let body = r#"{"model":"starcoder","stream":true,"n":3,"messages":[{"role":"user","content":"You are Cody-Gateway. q"}]}"#;
        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(body)).await;
        let (status, resp_headers, text) = body_of(resp).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp_headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(text, sse);

        let requests = upstream.requests.lock().unwrap();
        assert_eq!(requests[0].0, "https://api.fireworks.ai/inference/v1/chat/completions");
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].2).unwrap();
        assert_eq!(sent["n"], 1);
        assert_eq!(sent["user"], "actor-1");
        drop(requests);

        let events = h.events.wait_for(1).await;
        let ev = single(&events);
        assert_eq!(ev.name, EventName::CompletionsFinished);
        assert_eq!(ev.metadata["completion_usage"]["characters"], 3);
        assert_eq!(ev.metadata["stream_completed"], true);
    }

    #[tokio::test]
    async fn rate_limit_returns_429_and_notifies() {
        let h = harness();
        let upstream = MockUpstream::new(200, r#"{"completion":"ok"}"#);
        let handler = anthropic(&h.state, upstream.clone());

        for _ in 0..2 {
            let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(GOOD_PROMPT)).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(GOOD_PROMPT)).await;
        let (status, resp_headers, _) = body_of(resp).await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = resp_headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!(retry > 0 && retry <= 60);
        assert_eq!(upstream.calls(), 2);
        assert_eq!(h.notifier.0.load(Ordering::SeqCst), 1);

        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(GOOD_PROMPT)).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(h.notifier.0.load(Ordering::SeqCst), 1);

        let events = h.events.wait_for(4).await;
        assert_eq!(events.len(), 4);
        assert!(events.iter().any(|e| e.name == EventName::RateLimited));
    }

    #[tokio::test]
    async fn model_outside_allowed_set_is_rejected() {
        let h = harness();
        let upstream = MockUpstream::new(200, "{}");
        let handler = anthropic(&h.state, upstream.clone());

        // 提供方允许，但不在该 actor 的聊天模型列表中
        let body = r#"{"prompt":"You are Cody-Gateway.","model":"claude-instant"}"#;
        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(body)).await;
        let (status, _, text) = body_of(resp).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.contains("claude-instant"));

        let body = r#"{"prompt":"You are Cody-Gateway.","model":"gpt-4"}"#;
        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from("{not json")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert_eq!(upstream.calls(), 0);
        let events = h.events.wait_for(3).await;
        assert!(events.iter().all(|e| e.name == EventName::RequestRejected));
    }

    #[tokio::test]
    async fn missing_or_unknown_token_is_unauthorized() {
        let h = harness();
        let upstream = MockUpstream::new(200, "{}");
        let handler = anthropic(&h.state, upstream.clone());

        let resp = handler.handle(&h.state, headers(None), Bytes::from(GOOD_PROMPT)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = handler.handle(&h.state, headers(Some("bad-token")), Bytes::from(GOOD_PROMPT)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(upstream.calls(), 0);
        let events = h.events.wait_for(2).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.name == EventName::Unauthorized && e.source == "anonymous"));
    }

    #[tokio::test]
    async fn upstream_429_becomes_503() {
        let h = harness();
        let upstream = MockUpstream::with_headers(429, vec![("retry-after", "30")], r#"{"error":"quota"}"#);
        let handler = anthropic(&h.state, upstream);

        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(GOOD_PROMPT)).await;
        let (status, resp_headers, _) = body_of(resp).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp_headers[header::RETRY_AFTER], "30");

        let events = h.events.wait_for(1).await;
        assert_eq!(single(&events).name, EventName::UpstreamFailed);
    }

    #[tokio::test]
    async fn client_disconnect_mid_stream_logs_unknown_completion() {
        let h = harness();
        let first = "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1}}\n\n";
        let upstream = MockUpstream::replying(Reply::Hanging(vec![first]));
        let handler = fireworks(&h.state, upstream);

        let body = r#"{"model":"starcoder","stream":true,"messages":[{"role":"user","content":"You are Cody-Gateway. q"}]}"#;
        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(body)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let mut client = resp.into_body().into_data_stream();
        let chunk = client.next().await.unwrap().unwrap();
        assert_eq!(chunk, first.as_bytes());
        drop(client);

        let events = h.events.wait_for(1).await;
        let ev = single(&events);
        assert_eq!(ev.name, EventName::CompletionsFinished);
        assert_eq!(ev.metadata["stream_completed"], false);
        assert_eq!(ev.metadata["completion_usage"]["tokens"], -1);
        assert_eq!(ev.metadata["prompt_usage"]["tokens"], 3);
    }

    #[tokio::test]
    async fn transport_error_becomes_502() {
        let h = harness();
        let upstream = MockUpstream::replying(Reply::TransportError);
        let handler = anthropic(&h.state, upstream.clone());

        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(GOOD_PROMPT)).await;
        let (status, _, text) = body_of(resp).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(text.contains("upstream request failed"));
        assert!(!text.contains("not a url"));
        assert_eq!(upstream.calls(), 1);

        let events = h.events.wait_for(1).await;
        let ev = single(&events);
        assert_eq!(ev.name, EventName::UpstreamFailed);
        assert_eq!(ev.metadata["status"], 502);
    }

    #[tokio::test]
    async fn upstream_5xx_body_is_not_exposed() {
        let h = harness();
        let upstream = MockUpstream::new(500, "internal secret sk-ant-xyz");
        let handler = anthropic(&h.state, upstream);

        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(GOOD_PROMPT)).await;
        let (status, _, text) = body_of(resp).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!text.contains("secret"));
    }

    #[tokio::test]
    async fn upstream_4xx_is_passed_through() {
        let h = harness();
        let upstream = MockUpstream::new(400, r#"{"error":{"type":"invalid_request_error"}}"#);
        let handler = anthropic(&h.state, upstream);

        let resp = handler.handle(&h.state, headers(Some("good-token")), Bytes::from(GOOD_PROMPT)).await;
        let (status, _, text) = body_of(resp).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.contains("invalid_request_error"));
    }

    #[tokio::test]
    async fn feature_without_limit_is_forbidden() {
        let mut h = harness();
        h.state.actors = Arc::new(
            StaticActorSource::from_config(&[crate::config::settings::ActorConfig {
                token: "code-only".into(),
                id: "actor-2".into(),
                source: "static".into(),
                dotcom: false,
                rate_limits: h.state.config.actors[0]
                    .rate_limits
                    .iter()
                    .filter(|(k, _)| k.as_str() == "code_completions")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }])
            .unwrap(),
        ) as Arc<dyn ActorSource>;
        h.state.notifier = Arc::new(NoopNotifier) as Arc<dyn RateLimitNotifier>;
        let upstream = MockUpstream::new(200, "{}");
        let handler = anthropic(&h.state, upstream.clone());

        let resp = handler.handle(&h.state, headers(Some("code-only")), Bytes::from(GOOD_PROMPT)).await;
        let (status, _, text) = body_of(resp).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(text.contains("chat_completions"));
        assert_eq!(upstream.calls(), 0);
    }
}
