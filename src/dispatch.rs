//! Dispatch: send the routed request to the winning candidate, fail over to
//! the backups on retryable errors.
//!
//! For each attempt the dispatcher selects the provider's adapter, strips the
//! router's extension fields from the caller body, translates, attaches
//! credentials, and POSTs. Outcomes are recorded into the health tracker and
//! the blacklist; 401/403 additionally invalidates the key so the next
//! validation run re-checks it.
//!
//! Streaming uses a second client with no whole-request timeout (the body
//! arrives incrementally; the connect timeout still applies). Dropping the
//! returned stream drops the reqwest response, which closes the upstream
//! connection — caller cancellation propagates without any extra signalling.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::adapters::{select_adapter, Adapter, DispatchContext, StreamAction};
use crate::catalog::key_fingerprint;
use crate::config::ServerConfig;
use crate::error::{FailedAttempt, RouteError};
use crate::health::{HealthTracker, KeyTracker};
use crate::registry::ChannelRegistry;
use crate::routing::blacklist::Blacklist;
use crate::routing::discovery::Candidate;
use crate::routing::RouteDecision;

/// A `Send`-able, heap-allocated SSE byte stream in OpenAI wire format.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Who ultimately served a request, and how long it took.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub channel_id: String,
    pub model_id: String,
    /// Full latency for buffered calls; time-to-first-byte for streams.
    pub latency_ms: u64,
    /// Failed attempts that preceded the success.
    pub failed_attempts: Vec<FailedAttempt>,
}

pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    health: Arc<HealthTracker>,
    blacklist: Arc<Blacklist>,
    keys: Arc<KeyTracker>,
    /// Buffered requests — bounded by the end-to-end timeout.
    client: reqwest::Client,
    /// Streaming requests — connect timeout only.
    stream_client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        health: Arc<HealthTracker>,
        blacklist: Arc<Blacklist>,
        keys: Arc<KeyTracker>,
        server: &ServerConfig,
    ) -> Self {
        let connect = Duration::from_secs(server.connect_timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(Duration::from_secs(server.request_timeout_secs))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = reqwest::Client::builder()
            .connect_timeout(connect)
            .build()
            .expect("failed to build streaming reqwest client");

        Self { registry, health, blacklist, keys, client, stream_client }
    }

    /// Buffered dispatch down the ranked list.
    pub async fn dispatch(
        &self,
        decision: &RouteDecision,
        body: &Value,
        max_attempts: usize,
    ) -> Result<(Value, DispatchReport), RouteError> {
        let (clean_body, vendor_extra) = sanitize_body(body.clone());
        let mut attempts: Vec<FailedAttempt> = Vec::new();

        for candidate in decision.ranked.iter().take(max_attempts.max(1)) {
            let ctx = DispatchContext {
                model: candidate.model_id.clone(),
                strategy: decision.strategy.clone(),
                stream: false,
                vendor_extra: vendor_extra.clone(),
            };

            let started = std::time::Instant::now();
            match self.try_candidate(candidate, clean_body.clone(), &ctx).await {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.record_success(candidate, latency_ms);
                    return Ok((
                        response,
                        DispatchReport {
                            channel_id: candidate.channel.id.clone(),
                            model_id: candidate.model_id.clone(),
                            latency_ms,
                            failed_attempts: attempts,
                        },
                    ));
                }
                Err(error) => {
                    self.record_failure(candidate, &error);
                    attempts.push(FailedAttempt {
                        channel_id: candidate.channel.id.clone(),
                        model: candidate.model_id.clone(),
                        kind: error.kind().to_string(),
                    });
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    warn!(
                        channel = %candidate.channel.id,
                        model = %candidate.model_id,
                        kind = error.kind(),
                        "attempt failed — trying next candidate"
                    );
                }
            }
        }

        Err(RouteError::AllCandidatesFailed { attempts })
    }

    /// Streaming dispatch. Failover only applies before the first byte — once
    /// the relay starts, errors terminate the stream.
    pub async fn dispatch_stream(
        &self,
        decision: &RouteDecision,
        body: &Value,
        max_attempts: usize,
    ) -> Result<(SseStream, DispatchReport), RouteError> {
        let (clean_body, vendor_extra) = sanitize_body(body.clone());
        let mut attempts: Vec<FailedAttempt> = Vec::new();

        for candidate in decision.ranked.iter().take(max_attempts.max(1)) {
            let ctx = DispatchContext {
                model: candidate.model_id.clone(),
                strategy: decision.strategy.clone(),
                stream: true,
                vendor_extra: vendor_extra.clone(),
            };

            let started = std::time::Instant::now();
            match self.try_candidate_stream(candidate, clean_body.clone(), &ctx).await {
                Ok(stream) => {
                    // Time-to-first-byte (headers), not the full response.
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.record_success(candidate, latency_ms);
                    return Ok((
                        stream,
                        DispatchReport {
                            channel_id: candidate.channel.id.clone(),
                            model_id: candidate.model_id.clone(),
                            latency_ms,
                            failed_attempts: attempts,
                        },
                    ));
                }
                Err(error) => {
                    self.record_failure(candidate, &error);
                    attempts.push(FailedAttempt {
                        channel_id: candidate.channel.id.clone(),
                        model: candidate.model_id.clone(),
                        kind: error.kind().to_string(),
                    });
                    if !error.is_retryable() {
                        return Err(error);
                    }
                }
            }
        }

        Err(RouteError::AllCandidatesFailed { attempts })
    }

    async fn try_candidate(
        &self,
        candidate: &Candidate,
        body: Value,
        ctx: &DispatchContext,
    ) -> Result<Value, RouteError> {
        let (adapter, urls, api_key, provider) = self.wire_facts(candidate)?;
        let wire_body = adapter.transform_request(body, ctx);

        let mut headers = reqwest::header::HeaderMap::new();
        adapter.auth_headers(&provider, &api_key, &mut headers);

        let mut last_err: Option<RouteError> = None;
        for base_url in &urls {
            let url = adapter.chat_endpoint(base_url);
            debug!(channel = %candidate.channel.id, %url, "dispatching");

            let sent = self
                .client
                .post(&url)
                .headers(headers.clone())
                .json(&wire_body)
                .send()
                .await;

            match sent {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.map_err(|_| RouteError::UpstreamTimeout)?;
                    if !(200..300).contains(&status) {
                        return Err(adapter.classify_error(status, &text));
                    }
                    let parsed: Value = serde_json::from_str(&text).map_err(|_| {
                        RouteError::UpstreamServerError { status: 502 }
                    })?;
                    return adapter.transform_response(parsed);
                }
                Err(e) => {
                    // Connection-level failure: try the next endpoint in the
                    // provider's fallback list.
                    last_err = Some(classify_transport_error(&e));
                    if !e.is_connect() && !e.is_timeout() {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(RouteError::UpstreamTimeout))
    }

    async fn try_candidate_stream(
        &self,
        candidate: &Candidate,
        body: Value,
        ctx: &DispatchContext,
    ) -> Result<SseStream, RouteError> {
        let (adapter, urls, api_key, provider) = self.wire_facts(candidate)?;
        let wire_body = adapter.transform_request(body, ctx);

        let mut headers = reqwest::header::HeaderMap::new();
        adapter.auth_headers(&provider, &api_key, &mut headers);

        let mut last_err: Option<RouteError> = None;
        for base_url in &urls {
            let url = adapter.chat_endpoint(base_url);
            debug!(channel = %candidate.channel.id, %url, "streaming dispatch");

            let sent = self
                .stream_client
                .post(&url)
                .headers(headers.clone())
                .json(&wire_body)
                .send()
                .await;

            match sent {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !(200..300).contains(&status) {
                        let text = response.text().await.unwrap_or_default();
                        return Err(adapter.classify_error(status, &text));
                    }
                    return Ok(relay_stream(response, adapter, ctx.model.clone()));
                }
                Err(e) => {
                    last_err = Some(classify_transport_error(&e));
                    if !e.is_connect() && !e.is_timeout() {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(RouteError::UpstreamTimeout))
    }

    /// Adapter, endpoint list, credential, provider for a candidate.
    fn wire_facts(
        &self,
        candidate: &Candidate,
    ) -> Result<(&'static dyn Adapter, Vec<String>, String, crate::config::Provider), RouteError>
    {
        let channel = &candidate.channel;
        let provider = self
            .registry
            .get_provider(&channel.provider)
            .ok_or_else(|| RouteError::ConfigError(format!(
                "channel `{}` references unknown provider `{}`",
                channel.id, channel.provider
            )))?;

        let urls: Vec<String> = match &channel.base_url {
            Some(override_url) => vec![override_url.clone()],
            None => provider.base_url.all().iter().map(|u| u.to_string()).collect(),
        };

        let adapter = select_adapter(provider.kind, urls.first().map(String::as_str).unwrap_or(""));
        Ok((adapter, urls, channel.api_key.clone(), (*provider).clone()))
    }

    fn record_success(&self, candidate: &Candidate, latency_ms: u64) {
        self.health.record_success(&candidate.channel.id, latency_ms);
        self.blacklist.clear(&candidate.channel.id, &candidate.model_id);
    }

    fn record_failure(&self, candidate: &Candidate, error: &RouteError) {
        let kind = error.kind();
        self.health.record_failure(&candidate.channel.id, kind);
        self.blacklist
            .record_failure(&candidate.channel.id, &candidate.model_id, kind);
        if matches!(error, RouteError::AuthInvalid) {
            let fp = key_fingerprint(&candidate.channel.api_key);
            self.keys.mark_invalid(&candidate.channel.id, &fp, kind);
        }
    }
}

fn classify_transport_error(e: &reqwest::Error) -> RouteError {
    if e.is_timeout() || e.is_connect() {
        RouteError::UpstreamTimeout
    } else {
        RouteError::UpstreamServerError { status: 502 }
    }
}

/// Strip router extension fields from the caller body and collect the
/// `openrouter_*` passthroughs (suffix-keyed).
pub fn sanitize_body(mut body: Value) -> (Value, serde_json::Map<String, Value>) {
    let mut vendor_extra = serde_json::Map::new();
    if let Some(obj) = body.as_object_mut() {
        const EXTENSIONS: &[&str] = &[
            "routing_strategy",
            "required_capabilities",
            "exclude_providers",
            "min_context_length",
            "max_cost_per_1k",
            "prefer_local",
        ];
        for key in EXTENSIONS {
            obj.remove(*key);
        }

        let vendor_keys: Vec<String> = obj
            .keys()
            .filter(|k| k.starts_with("openrouter_"))
            .cloned()
            .collect();
        for key in vendor_keys {
            if let Some(value) = obj.remove(&key) {
                vendor_extra.insert(key["openrouter_".len()..].to_string(), value);
            }
        }
    }
    (body, vendor_extra)
}

/// Relay the upstream body as OpenAI-format SSE.
///
/// Native-SSE adapters proxy bytes verbatim. Translating adapters buffer into
/// lines, feed each `data:` payload through [`Adapter::stream_parse`], and
/// emit canonical chunks terminated by `data: [DONE]`.
fn relay_stream(response: reqwest::Response, adapter: &'static dyn Adapter, model: String) -> SseStream {
    if adapter.native_sse() {
        return Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(anyhow::Error::from)),
        );
    }

    struct Translate {
        inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
        buffer: String,
        pending: VecDeque<Bytes>,
        finished: bool,
        adapter: &'static dyn Adapter,
        model: String,
    }

    impl Translate {
        fn drain_lines(&mut self) {
            while let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                let line = line.trim_end();
                let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
                else {
                    continue;
                };
                match self.adapter.stream_parse(data.trim(), &self.model) {
                    StreamAction::Emit(chunk) => {
                        self.pending.push_back(Bytes::from(format!("data: {chunk}\n\n")));
                    }
                    StreamAction::Done => {
                        self.pending.push_back(Bytes::from_static(b"data: [DONE]\n\n"));
                        self.finished = true;
                    }
                    StreamAction::Ignore => {}
                }
            }
        }
    }

    let state = Translate {
        inner: Box::pin(response.bytes_stream()),
        buffer: String::new(),
        pending: VecDeque::new(),
        finished: false,
        adapter,
        model,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.finished {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(anyhow::Error::from(e)), st));
                }
                None => {
                    // Upstream closed without a stop event — still terminate
                    // the caller's stream cleanly.
                    st.finished = true;
                    if st.pending.is_empty() {
                        return Some((Ok(Bytes::from_static(b"data: [DONE]\n\n")), st));
                    }
                }
            }
        }
    }))
}
