//! Request execution engine: match, filter chain, backend dispatch,
//! loopback re-entry and loop detection.

use std::cell::RefCell;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use monoroute_core::context::state::{
    RequestState, KEY_DYNAMIC_BACKEND, KEY_LB_KEY, KEY_LOOPBACK, KEY_OUTGOING_HOST, KEY_PRESERVE_HOST,
};
use monoroute_core::http::{HttpError, ResponseWithContinue};

use crate::cancel::Waiter;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::matcher::{match_request, MatchInput, MatchedRoute, RoutingTable};
use crate::model::Backend;

/// Read-only view of a request's matchable attributes, passed to every
/// secondary [`crate::registry::Predicate`].
pub struct RequestView<'a> {
    pub method: &'a http::Method,
    pub uri: &'a http::Uri,
    pub headers: &'a http::HeaderMap,
    pub peer_ip: Option<IpAddr>,
    pub state: &'a RequestState,
}

/// Mutable context handed to a filter's `on_request`/`on_response` hook.
/// `response` is `Some` once a filter has written a synthetic response
/// (shunt, or an early request-side response); `state.served` tracks the
/// same fact for the engine's own bookkeeping. `original` is a pristine
/// copy of the inbound request, present only when
/// [`EngineConfig::preserve_original_request`] is on.
pub struct FilterContext<'a> {
    pub request: &'a mut Request<Bytes>,
    pub response: &'a mut Option<Response<Bytes>>,
    pub original: Option<&'a Request<Bytes>>,
    pub peer_ip: Option<IpAddr>,
    pub state: &'a mut RequestState,
}

impl<'a> FilterContext<'a> {
    pub fn serve(&mut self, response: Response<Bytes>) {
        *self.response = Some(response);
        self.state.served = true;
    }
}

/// Data-path error taxonomy: each variant maps to the HTTP status the
/// engine writes when no filter has already produced a response.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no route matched")]
    NoRoute,
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("timeout")]
    Timeout,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("loop detected")]
    LoopDetected,
    #[error("request canceled")]
    Canceled,
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HttpError<Bytes> for EngineError {
    fn to_response(&self) -> Option<Response<Bytes>> {
        let status = match self {
            EngineError::NoRoute => StatusCode::NOT_FOUND,
            EngineError::BackendError(_) => StatusCode::BAD_GATEWAY,
            EngineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            EngineError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            EngineError::LoopDetected => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Canceled => return None,
            EngineError::Fatal(_) => return None,
        };
        Some(generate_response(status, Bytes::new()))
    }
}

/// Build a bare response with the given status and body, used for
/// synthesized not-found/error responses.
pub fn generate_response(status: StatusCode, body: Bytes) -> Response<Bytes> {
    Response::builder().status(status).body(body).expect("static response is always valid")
}

/// Independent deadlines for the backend call: connecting, waiting for
/// response headers, and the whole exchange.
#[derive(Debug, Clone, Copy)]
pub struct EngineTimeouts {
    pub connect: Duration,
    pub response_header: Duration,
    pub total: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            response_header: Duration::from_secs(10),
            total: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How many loopback re-entries a single request may perform before
    /// it fails as a detected loop.
    pub loopback_limit: u32,
    /// Connection-error retries against a freshly selected endpoint,
    /// load-balanced backends only.
    pub backend_retries: u32,
    /// Keep a pristine copy of the inbound request and expose it to
    /// filters as [`FilterContext::original`].
    pub preserve_original_request: bool,
    pub timeouts: EngineTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loopback_limit: 9,
            backend_retries: 1,
            preserve_original_request: false,
            timeouts: EngineTimeouts::default(),
        }
    }
}

/// The extension point for backend proxying. The concrete implementation
/// lives in the binary crate; keeping dispatch behind a trait makes the
/// engine's control flow (loopback/shunt/retry) testable without real
/// sockets.
pub trait BackendDispatcher {
    async fn dispatch(
        &self,
        endpoint_url: &str,
        request: Request<Bytes>,
        timeouts: EngineTimeouts,
    ) -> Result<Response<Bytes>, EngineError>;
}

/// Drives one request through match, filter chain, and backend dispatch,
/// handling loopback re-entry against the same table snapshot and
/// shunt/dynamic/network/load-balanced backends.
pub struct Engine<D> {
    pub config: EngineConfig,
    pub endpoint_registry: crate::endpoint::EndpointRegistry,
    pub dispatcher: D,
    diagnostics: Option<DiagnosticSink>,
    reported_ties: RefCell<HashSet<(u64, Vec<String>)>>,
}

impl<D: BackendDispatcher> Engine<D> {
    pub fn new(config: EngineConfig, endpoint_registry: crate::endpoint::EndpointRegistry, dispatcher: D) -> Self {
        Self {
            config,
            endpoint_registry,
            dispatcher,
            diagnostics: None,
            reported_ties: RefCell::new(HashSet::new()),
        }
    }

    /// Attach a sink for tie-break records; without one, ties are only
    /// logged.
    pub fn with_diagnostics(mut self, sink: DiagnosticSink) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Run the engine for one inbound request against a pinned table
    /// snapshot; the caller samples the live table once and every
    /// loopback re-entry here resolves against that same snapshot.
    ///
    /// Filter chains nest across loopbacks: every route whose
    /// request-side hooks ran contributes a frame, and once a final
    /// response exists the frames unwind innermost-first, so each
    /// invoked request-side hook gets exactly one response-side call.
    pub async fn handle(
        &self,
        table: &RoutingTable,
        mut request: Request<Bytes>,
        peer_ip: Option<IpAddr>,
        cancel: Waiter,
    ) -> ResponseWithContinue<Bytes> {
        let outgoing_host = host_header(&request).unwrap_or_default();
        let mut state = RequestState::new(outgoing_host, table.generation);
        let original = self.config.preserve_original_request.then(|| request.clone());
        let mut frames: Vec<(&crate::matcher::CompiledRoute, usize)> = Vec::new();

        let (mut resp, keep_alive) = loop {
            if cancel.cancelled() {
                break (generate_response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()), false);
            }

            let matched = self.match_route(table, &request, peer_ip, &state);
            let Some(matched) = matched else {
                break (generate_response(StatusCode::NOT_FOUND, Bytes::new()), true);
            };
            state.params = matched.params;

            let Some(route) = table.find_by_id(&matched.route_id) else {
                break (generate_response(StatusCode::NOT_FOUND, Bytes::new()), true);
            };

            let mut response: Option<Response<Bytes>> = None;
            let invoked = self.run_request_filters(
                route,
                &mut request,
                original.as_ref(),
                &mut response,
                peer_ip,
                &mut state,
                &cancel,
            );
            frames.push((route, invoked));

            if let Some(resp) = response {
                break (resp, true);
            }

            let outcome = self.dispatch_backend(route, &request, peer_ip, &mut state, &cancel).await;

            match outcome {
                BackendOutcome::Loopback => {
                    state.loop_count += 1;
                    if state.loop_count > self.config.loopback_limit {
                        let resp = EngineError::LoopDetected
                            .to_response()
                            .expect("loop detection renders a status");
                        break (resp, true);
                    }
                    state.reset_for_rematch();
                    continue;
                }
                BackendOutcome::Response(resp) => break (resp, true),
                BackendOutcome::Error(err) => {
                    let keep_alive = !matches!(err, EngineError::Canceled);
                    let resp = err.to_response().unwrap_or_else(|| {
                        generate_response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
                    });
                    break (resp, keep_alive);
                }
            }
        };

        for (route, invoked) in frames.iter().rev() {
            resp = self.run_response_filters(
                route,
                &mut request,
                original.as_ref(),
                resp,
                peer_ip,
                &mut state,
                *invoked,
            );
        }
        (resp, keep_alive)
    }

    fn match_route(
        &self,
        table: &RoutingTable,
        request: &Request<Bytes>,
        peer_ip: Option<IpAddr>,
        state: &RequestState,
    ) -> Option<MatchedRoute> {
        let host = host_header(request).unwrap_or_default();
        let view = RequestView { method: request.method(), uri: request.uri(), headers: request.headers(), peer_ip, state };
        let input = MatchInput {
            method: request.method().as_str(),
            host: &host,
            path: request.uri().path(),
            headers: request.headers(),
        };
        let outcome = match_request(table, &input, &view);
        if let Some(ids) = outcome.tie {
            self.report_tie(table.generation, ids);
        }
        outcome.matched
    }

    /// Record an ambiguous-priority set, once per (generation, tie-set).
    fn report_tie(&self, generation: u64, ids: Vec<String>) {
        let mut reported = self.reported_ties.borrow_mut();
        if !reported.insert((generation, ids.clone())) {
            return;
        }
        tracing::debug!(generation, ids = ?ids, "priority tie broken by route id");
        if let Some(sink) = &self.diagnostics {
            let detail = ids.join(", ");
            sink.emit(Diagnostic::tie_break(generation, ids[0].clone(), detail));
        }
    }

    /// Invoke request-side filter hooks in declaration order, stopping
    /// once a filter writes a response. Returns how many filters were
    /// actually invoked, so the response-side pass stays symmetric even
    /// when the chain was cut short.
    #[allow(clippy::too_many_arguments)]
    fn run_request_filters(
        &self,
        route: &crate::matcher::CompiledRoute,
        request: &mut Request<Bytes>,
        original: Option<&Request<Bytes>>,
        response: &mut Option<Response<Bytes>>,
        peer_ip: Option<IpAddr>,
        state: &mut RequestState,
        cancel: &Waiter,
    ) -> usize {
        let mut invoked = 0;
        for filter in &route.filters {
            if cancel.cancelled() {
                break;
            }
            let mut ctx = FilterContext {
                request: &mut *request,
                response: &mut *response,
                original,
                peer_ip,
                state: &mut *state,
            };
            filter.on_request(&mut ctx);
            invoked += 1;
            if state.served {
                break;
            }
        }
        invoked
    }

    /// Invoke response-side filter hooks in reverse declaration order,
    /// only for the filters whose request-side hook actually ran.
    #[allow(clippy::too_many_arguments)]
    fn run_response_filters(
        &self,
        route: &crate::matcher::CompiledRoute,
        request: &mut Request<Bytes>,
        original: Option<&Request<Bytes>>,
        response: Response<Bytes>,
        peer_ip: Option<IpAddr>,
        state: &mut RequestState,
        invoked: usize,
    ) -> Response<Bytes> {
        let mut resp_opt = Some(response);
        for filter in route.filters.iter().take(invoked).rev() {
            let mut ctx = FilterContext {
                request: &mut *request,
                response: &mut resp_opt,
                original,
                peer_ip,
                state: &mut *state,
            };
            filter.on_response(&mut ctx);
        }
        resp_opt.unwrap_or_else(|| generate_response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()))
    }

    async fn dispatch_backend(
        &self,
        route: &crate::matcher::CompiledRoute,
        request: &Request<Bytes>,
        peer_ip: Option<IpAddr>,
        state: &mut RequestState,
        cancel: &Waiter,
    ) -> BackendOutcome {
        // A request-side filter can force a re-match regardless of the
        // route's declared backend; the marker is consumed so a loop
        // only happens if the filter keeps re-asserting it.
        if state.state.remove(KEY_LOOPBACK).is_some() {
            return BackendOutcome::Loopback;
        }

        match &route.backend {
            // A shunt expects the filter chain to have served; reaching
            // the backend step without a response means nothing did.
            Backend::Shunt => BackendOutcome::Error(EngineError::NoRoute),
            Backend::Loopback => BackendOutcome::Loopback,
            Backend::Dynamic => match state.state.get(KEY_DYNAMIC_BACKEND) {
                Some(v) => match v.as_str() {
                    Some(url) => self.proxy_network(url.to_string(), request, state, cancel).await,
                    None => BackendOutcome::Error(EngineError::BackendError("dynamic backend value not a string".into())),
                },
                None => BackendOutcome::Error(EngineError::BackendError("no dynamic backend set".into())),
            },
            Backend::Network(url) => self.proxy_network(url.clone(), request, state, cancel).await,
            Backend::LoadBalanced { .. } => {
                let Some(lb) = &route.load_balancer else {
                    return BackendOutcome::Error(EngineError::BackendError("load balancer not configured".into()));
                };
                let hash_key = match state.state.get(KEY_LB_KEY).and_then(|v| v.as_str()) {
                    Some(key) => key.to_string(),
                    None => match peer_ip {
                        Some(ip) => format!("{ip}{}", request.uri().path()),
                        None => request.uri().path().to_string(),
                    },
                };
                let mut attempts = 0;
                loop {
                    let endpoint = match lb.select(&hash_key) {
                        Ok(ep) => ep.to_string(),
                        Err(_) => return BackendOutcome::Error(EngineError::BackendError("no endpoints".into())),
                    };
                    let result = self.proxy_network(endpoint, request, state, cancel).await;
                    match result {
                        BackendOutcome::Error(EngineError::BackendError(_)) if attempts < self.config.backend_retries => {
                            attempts += 1;
                            continue;
                        }
                        other => return other,
                    }
                }
            }
        }
    }

    async fn proxy_network(
        &self,
        url: String,
        request: &Request<Bytes>,
        state: &mut RequestState,
        cancel: &Waiter,
    ) -> BackendOutcome {
        let key = crate::endpoint::endpoint_key(&url);
        self.endpoint_registry.begin_request(&key);
        let started = Instant::now();

        let mut proxied = Request::builder().method(request.method().clone()).uri(request.uri().clone());
        for (name, value) in request.headers() {
            if !is_hop_by_hop(name.as_str()) {
                proxied = proxied.header(name, value);
            }
        }
        let host_value = outgoing_host(state, &url);
        proxied = proxied.header(http::header::HOST, host_value);
        let proxied = proxied.body(request.body().clone()).expect("request builder cannot fail here");

        let dispatch_fut = self.dispatcher.dispatch(&url, proxied, self.config.timeouts);
        let result = if cancel.cancelled() {
            Err(EngineError::Canceled)
        } else {
            dispatch_fut.await
        };

        self.endpoint_registry.end_request(&key, started.elapsed());
        match result {
            Ok(resp) => BackendOutcome::Response(resp),
            Err(e) => BackendOutcome::Error(e),
        }
    }
}

/// The `Host` header to send upstream: an explicit state-bag override
/// wins; otherwise the inbound host is preserved unless `preserveHost`
/// turned preservation off, in which case the host is derived from the
/// chosen backend endpoint.
fn outgoing_host(state: &RequestState, url: &str) -> String {
    if let Some(host) = state.state.get(KEY_OUTGOING_HOST).and_then(|v| v.as_str()) {
        return host.to_string();
    }
    let preserve = state.state.get(KEY_PRESERVE_HOST).and_then(|v| v.as_bool()).unwrap_or(true);
    if preserve {
        state.outgoing_host.clone()
    } else {
        derive_host_from_url(url).unwrap_or_else(|| state.outgoing_host.clone())
    }
}

enum BackendOutcome {
    Response(Response<Bytes>),
    Loopback,
    Error(EngineError),
}

fn host_header(request: &Request<Bytes>) -> Option<String> {
    request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
}

const HOP_BY_HOP: &[&str] =
    &["connection", "keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailer", "transfer-encoding", "upgrade"];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

fn derive_host_from_url(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = without_scheme.split(['/', '?']).next().unwrap_or(without_scheme);
    if authority.is_empty() {
        None
    } else {
        Some(authority.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::registry::{default_filter_registry, default_predicate_registry};

    struct ShuntDispatcher;
    impl BackendDispatcher for ShuntDispatcher {
        async fn dispatch(&self, _endpoint_url: &str, _request: Request<Bytes>, _timeouts: EngineTimeouts) -> Result<Response<Bytes>, EngineError> {
            Ok(generate_response(StatusCode::OK, Bytes::from_static(b"upstream")))
        }
    }

    /// Records the endpoint URL and `Host` header of every dispatched
    /// request, for tests that assert on backend selection or proxied
    /// headers rather than the response body.
    struct RecordingDispatcher {
        seen: RefCell<Vec<(String, String)>>,
    }

    impl RecordingDispatcher {
        fn new() -> Self {
            Self { seen: RefCell::new(Vec::new()) }
        }
    }

    impl BackendDispatcher for RecordingDispatcher {
        async fn dispatch(&self, endpoint_url: &str, request: Request<Bytes>, _timeouts: EngineTimeouts) -> Result<Response<Bytes>, EngineError> {
            let host = request.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
            self.seen.borrow_mut().push((endpoint_url.to_string(), host));
            Ok(generate_response(StatusCode::OK, Bytes::from_static(b"upstream")))
        }
    }

    fn build_table(srcs: &[&str]) -> RoutingTable {
        let preg = default_predicate_registry();
        let freg = default_filter_registry();
        let endpoints = crate::endpoint::EndpointRegistry::new();
        let mut counter = 0;
        let mut defs = Vec::new();
        for src in srcs {
            let nodes = crate::script::parse_routes(src).unwrap();
            defs.push(crate::model::canonicalize(&nodes[0], &mut counter).unwrap());
        }
        crate::compiler::compile(
            defs,
            &preg,
            &freg,
            &endpoints,
            &crate::compiler::default_postprocessors(),
            1,
        )
        .table
    }

    #[monoio::test]
    async fn shunt_route_serves_filter_built_redirect() {
        let table = build_table(&[
            r#"r: Path("/old") -> status(302) -> setResponseHeader("Location", "/new") -> <shunt>;"#,
        ]);
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), ShuntDispatcher);
        let request = Request::builder().method("GET").uri("/old").body(Bytes::new()).unwrap();
        let canceller = crate::cancel::Canceller::new();
        let (resp, _) = engine.handle(&table, request, None, canceller.waiter()).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get("location").unwrap(), "/new");
    }

    #[monoio::test]
    async fn loopback_rematches_with_mutated_header() {
        let table = build_table(&[
            r#"r1: Header("X-Loop","1") -> setRequestHeader("X-Loop","2") -> <loopback>;"#,
            r#"r2: Header("X-Loop","2") -> inlineContent("done") -> <shunt>;"#,
        ]);
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), ShuntDispatcher);
        let request = Request::builder().method("GET").uri("/").header("X-Loop", "1").body(Bytes::new()).unwrap();
        let canceller = crate::cancel::Canceller::new();
        let (resp, _) = engine.handle(&table, request, None, canceller.waiter()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), &Bytes::from_static(b"done"));
    }

    #[monoio::test]
    async fn loopback_nests_response_filters_outermost_last() {
        let table = build_table(&[
            r#"r1: Header("X-Loop","1") -> setRequestHeader("X-Loop","2") -> appendResponseHeader("X-Via","r1") -> <loopback>;"#,
            r#"r2: Header("X-Loop","2") -> inlineContent("done") -> <shunt>;"#,
        ]);
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), ShuntDispatcher);
        let request = Request::builder().method("GET").uri("/").header("X-Loop", "1").body(Bytes::new()).unwrap();
        let canceller = crate::cancel::Canceller::new();
        let (resp, _) = engine.handle(&table, request, None, canceller.waiter()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), &Bytes::from_static(b"done"));
        // The first route's response side still ran, after the second's.
        assert_eq!(resp.headers().get("x-via").unwrap(), "r1");
    }

    #[monoio::test]
    async fn loopback_limit_exceeded_fails_with_loop_detected() {
        let table = build_table(&[
            r#"r1: Header("X-Loop","1") -> setRequestHeader("X-Loop","2") -> <loopback>;"#,
            r#"r2: Header("X-Loop","2") -> inlineContent("done") -> <shunt>;"#,
        ]);
        let config = EngineConfig { loopback_limit: 0, ..Default::default() };
        let engine = Engine::new(config, crate::endpoint::EndpointRegistry::new(), ShuntDispatcher);
        let request = Request::builder().method("GET").uri("/").header("X-Loop", "1").body(Bytes::new()).unwrap();
        let canceller = crate::cancel::Canceller::new();
        let (resp, _) = engine.handle(&table, request, None, canceller.waiter()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[monoio::test]
    async fn no_route_yields_404() {
        let table = build_table(&[r#"r: Path("/only") -> <shunt>;"#]);
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), ShuntDispatcher);
        let request = Request::builder().method("GET").uri("/missing").body(Bytes::new()).unwrap();
        let canceller = crate::cancel::Canceller::new();
        let (resp, _) = engine.handle(&table, request, None, canceller.waiter()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[monoio::test]
    async fn network_backend_preserves_host() {
        let table = build_table(&[
            r#"r: Host(/^www\.example\.org$/) -> preserveHost("true") -> "http://10.0.0.1:8080";"#,
        ]);
        let dispatcher = RecordingDispatcher::new();
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), dispatcher);
        let request = Request::builder()
            .method("GET")
            .uri("/x")
            .header("host", "www.example.org")
            .body(Bytes::new())
            .unwrap();
        let canceller = crate::cancel::Canceller::new();
        let (resp, _) = engine.handle(&table, request, None, canceller.waiter()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let seen = engine.dispatcher.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("http://10.0.0.1:8080".to_string(), "www.example.org".to_string()));
    }

    #[monoio::test]
    async fn disabling_host_preservation_uses_backend_authority() {
        let table = build_table(&[
            r#"r: Path("/x") -> preserveHost("false") -> "http://10.0.0.1:8080";"#,
        ]);
        let dispatcher = RecordingDispatcher::new();
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), dispatcher);
        let request = Request::builder()
            .method("GET")
            .uri("/x")
            .header("host", "www.example.org")
            .body(Bytes::new())
            .unwrap();
        let canceller = crate::cancel::Canceller::new();
        let _ = engine.handle(&table, request, None, canceller.waiter()).await;
        let seen = engine.dispatcher.seen.borrow();
        assert_eq!(seen[0].1, "10.0.0.1:8080");
    }

    #[monoio::test]
    async fn round_robin_alternates_over_two_endpoints() {
        let table = build_table(&[r#"r: * -> <roundRobin, "http://a:80", "http://b:80">;"#]);
        let dispatcher = RecordingDispatcher::new();
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), dispatcher);
        let canceller = crate::cancel::Canceller::new();
        for _ in 0..100 {
            let request = Request::builder().method("GET").uri("/x").body(Bytes::new()).unwrap();
            let (resp, _) = engine.handle(&table, request, None, canceller.waiter()).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let seen = engine.dispatcher.seen.borrow();
        assert_eq!(seen.len(), 100);
        let to_a = seen.iter().filter(|(url, _)| url == "http://a:80").count();
        let to_b = seen.iter().filter(|(url, _)| url == "http://b:80").count();
        assert_eq!(to_a, 50);
        assert_eq!(to_b, 50);
        assert!(seen.iter().zip(seen.iter().skip(1)).all(|((a, _), (b, _))| a != b));
    }

    #[monoio::test]
    async fn weight_predicate_breaks_priority_tie() {
        let table = build_table(&[
            r#"r1: Path("/a") -> "http://x";"#,
            r#"r2: Path("/a") && Weight(10) -> "http://y";"#,
        ]);
        let dispatcher = RecordingDispatcher::new();
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), dispatcher);
        let request = Request::builder().method("GET").uri("/a").body(Bytes::new()).unwrap();
        let canceller = crate::cancel::Canceller::new();
        let (resp, _) = engine.handle(&table, request, None, canceller.waiter()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let seen = engine.dispatcher.seen.borrow();
        assert_eq!(seen[0].0, "http://y");
    }

    #[monoio::test]
    async fn traffic_segments_split_roughly_30_70() {
        crate::predicates::seed_traffic_rng(42);
        let table = build_table(&[
            r#"r1: Path("/t") && TrafficSegment(0.0, 0.3) -> "http://a";"#,
            r#"r2: Path("/t") && TrafficSegment(0.3, 1.0) -> "http://b";"#,
        ]);
        let dispatcher = RecordingDispatcher::new();
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), dispatcher);
        let canceller = crate::cancel::Canceller::new();
        for _ in 0..10_000 {
            let request = Request::builder().method("GET").uri("/t").body(Bytes::new()).unwrap();
            let _ = engine.handle(&table, request, None, canceller.waiter()).await;
        }
        let seen = engine.dispatcher.seen.borrow();
        let to_a = seen.iter().filter(|(url, _)| url == "http://a").count();
        let to_b = seen.iter().filter(|(url, _)| url == "http://b").count();
        // Regression bound over a fixed seed, not a statistical proof.
        assert!((2700..=3300).contains(&to_a), "to_a={to_a}");
        assert!((6700..=7300).contains(&to_b), "to_b={to_b}");
    }

    #[monoio::test]
    async fn handle_uses_the_table_snapshot_it_was_given() {
        let old_table = build_table(&[r#"r: Path("/x") -> inlineContent("old") -> <shunt>;"#]);
        let new_table = build_table(&[r#"r: Path("/x") -> inlineContent("new") -> <shunt>;"#]);
        assert_eq!(old_table.generation, new_table.generation);

        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), ShuntDispatcher);
        let canceller = crate::cancel::Canceller::new();
        let request = Request::builder().method("GET").uri("/x").body(Bytes::new()).unwrap();
        let (resp, _) = engine.handle(&old_table, request, None, canceller.waiter()).await;
        assert_eq!(resp.body(), &Bytes::from_static(b"old"));

        let request = Request::builder().method("GET").uri("/x").body(Bytes::new()).unwrap();
        let (resp, _) = engine.handle(&new_table, request, None, canceller.waiter()).await;
        assert_eq!(resp.body(), &Bytes::from_static(b"new"));
    }

    #[monoio::test]
    async fn tie_is_reported_once_per_generation() {
        let table = build_table(&[
            r#"r1: Path("/a") -> "http://x";"#,
            r#"r2: Path("/a") -> "http://y";"#,
        ]);
        let (sink, mut stream) = crate::diagnostics::channel();
        let probe = sink.clone();
        let engine = Engine::new(EngineConfig::default(), crate::endpoint::EndpointRegistry::new(), RecordingDispatcher::new())
            .with_diagnostics(sink);
        let canceller = crate::cancel::Canceller::new();
        for _ in 0..3 {
            let request = Request::builder().method("GET").uri("/a").body(Bytes::new()).unwrap();
            let _ = engine.handle(&table, request, None, canceller.waiter()).await;
        }
        probe.emit(Diagnostic::shutdown());

        let first = stream.recv().await.unwrap();
        assert_eq!(first.kind, crate::diagnostics::DiagnosticKind::TieBreak);
        assert_eq!(first.table_generation, Some(1));
        // The sentinel arrives next: three identical ties produced one record.
        let second = stream.recv().await.unwrap();
        assert_eq!(second.kind, crate::diagnostics::DiagnosticKind::Shutdown);
    }
}
