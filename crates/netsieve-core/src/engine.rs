//! The interception engine.
//!
//! Owns the buffer store, pending table, rule matcher and dispatcher, and
//! exposes the ingress operations adapters call. Every ingress call runs
//! synchronously on the caller's thread and never panics outward.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::buffer_store::{FlowBufferStore, Framed};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::flow::{FlowId, Side, Transport};
use crate::message::{collect_body, CompletedRecord, ParsedRequest, ResponsePart};
use crate::parser::{is_interim, RawMessage};
use crate::pending::PendingRequestTable;
use crate::rules::{RuleMatcher, RuleStore};
use crate::verdict::{BlobStore, Disposition, VerdictDispatcher, VerdictSink};

/// An exchange reported by a structured source (HTTP client library, web
/// engine, platform engine) rather than as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCall {
    /// Source of the call.
    pub transport: Transport,
    /// Request method.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Request header lines.
    pub request_headers: String,
    /// Request body.
    pub request_body: Option<Vec<u8>>,
    /// Request `Content-Type`.
    pub request_content_type: Option<String>,
    /// Response, if the call has completed.
    pub response: Option<ResponsePart>,
    /// Call-site snapshot.
    pub snapshot: Option<String>,
}

impl CompletedCall {
    /// Creates a call with no headers, bodies or response.
    pub fn new(transport: Transport, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport,
            method: method.into(),
            url: url.into(),
            request_headers: String::new(),
            request_body: None,
            request_content_type: None,
            response: None,
            snapshot: None,
        }
    }

    /// Sets the request headers.
    pub fn with_request_headers(mut self, headers: impl Into<String>) -> Self {
        self.request_headers = headers.into();
        self
    }

    /// Sets the request body and its content type.
    pub fn with_request_body(mut self, body: Vec<u8>, content_type: Option<String>) -> Self {
        self.request_body = Some(body);
        self.request_content_type = content_type;
        self
    }

    /// Sets the response.
    pub fn with_response(mut self, response: ResponsePart) -> Self {
        self.response = Some(response);
        self
    }

    /// Sets the call-site snapshot.
    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }
}

/// Traffic reconstruction and block-decision engine.
pub struct InterceptEngine {
    config: EngineConfig,
    buffers: FlowBufferStore,
    pending: PendingRequestTable,
    matcher: RuleMatcher,
    dispatcher: VerdictDispatcher,
}

impl InterceptEngine {
    /// Creates an engine over the given collaborators.
    pub fn new(
        config: EngineConfig,
        rules: Arc<dyn RuleStore>,
        blobs: Arc<dyn BlobStore>,
        sink: Arc<dyn VerdictSink>,
    ) -> Result<Self> {
        config.validate()?;

        tracing::debug!(
            max_buffer_bytes = config.max_buffer_bytes,
            max_pending_per_flow = config.max_pending_per_flow,
            rule_cache_capacity = config.rule_cache_capacity,
            "Creating intercept engine"
        );

        Ok(Self {
            buffers: FlowBufferStore::new(config.max_buffer_bytes),
            pending: PendingRequestTable::new(config.max_pending_per_flow),
            matcher: RuleMatcher::new(rules, config.rule_cache_capacity, config.rule_cache_ttl()),
            dispatcher: VerdictDispatcher::new(
                blobs,
                sink,
                config.dedup_capacity,
                config.blob_threshold_bytes,
            ),
            config,
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Ingress
    // =========================================================================

    /// Feeds bytes observed on a flow.
    pub fn on_bytes(&self, flow: FlowId, side: Side, bytes: &[u8]) -> Disposition {
        self.on_bytes_with_snapshot(flow, side, bytes, None)
    }

    /// Feeds bytes observed on a flow, attaching a call-site snapshot to any
    /// request they complete.
    pub fn on_bytes_with_snapshot(
        &self,
        flow: FlowId,
        side: Side,
        bytes: &[u8],
        snapshot: Option<&str>,
    ) -> Disposition {
        guarded("on_bytes", || {
            // Responses framed by this call answer the queued requests in order.
            let answers_head = |n: usize| self.pending.is_head_at(flow, n);
            self.buffers
                .on_bytes(flow, side, bytes, answers_head)
                .into_iter()
                .fold(Disposition::Continue, |disposition, framed| {
                    let next = match framed {
                        Framed::Message(message) | Framed::Truncated(message) => match side {
                            Side::Request => self.handle_request(flow, &message, snapshot),
                            Side::Response => self.handle_response(flow, &message),
                        },
                        Framed::Lost { dropped } => self.handle_lost(flow, side, dropped),
                    };
                    disposition.or(next)
                })
        })
    }

    /// Evaluates an exchange reported by a structured source.
    pub fn on_completed_call(&self, call: CompletedCall) -> Disposition {
        guarded("on_completed_call", || {
            let mut request = ParsedRequest::new(call.transport, call.method, call.url);
            request.headers = call.request_headers;
            request.body = collect_body(
                call.request_body,
                self.config.collect_request_body,
                self.config.max_body_bytes,
            );
            request.content_type = call.request_content_type;
            request.snapshot = call.snapshot;

            let response = call.response.map(|mut response| {
                response.body = collect_body(
                    response.body,
                    self.config.collect_response_body,
                    self.config.max_body_bytes,
                );
                response
            });

            let matched = self.matcher.match_any(&request.canonical);
            self.dispatcher.dispatch(&request, response.as_ref(), matched)
        })
    }

    /// Evaluates a DNS resolution. An empty address list is ignored.
    pub fn on_dns_resolution(
        &self,
        host: &str,
        addresses: &[String],
        snapshot: Option<&str>,
    ) -> Disposition {
        guarded("on_dns_resolution", || {
            let host = host.trim();
            if host.is_empty() || addresses.is_empty() {
                return Disposition::Continue;
            }

            let mut request = ParsedRequest::new(Transport::Dns, "DNS", host);
            request.dns_host = Some(host.to_string());
            request.dns_addresses = addresses.to_vec();
            request.snapshot = snapshot.map(str::to_string);

            let matched = self.matcher.match_any(host);
            self.dispatcher.dispatch(&request, None, matched)
        })
    }

    /// Releases every buffer and pending request held for a flow.
    pub fn on_flow_closed(&self, flow: FlowId) {
        self.buffers.remove_flow(flow);
        let dropped = self.pending.remove_flow(flow);
        if dropped > 0 {
            tracing::debug!(flow = %flow, dropped, "Flow closed with requests awaiting response");
        }
    }

    /// Trims caches when the host signals memory pressure.
    pub fn on_memory_pressure(&self) {
        let cached = self.matcher.cached();
        self.matcher.clear_cache();
        tracing::info!(cached, "Cleared rule cache on memory pressure");
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of live accumulators.
    pub fn buffered_flows(&self) -> usize {
        self.buffers.len()
    }

    /// Number of requests awaiting a response across all flows.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Number of requests awaiting a response on `flow`.
    pub fn pending_for(&self, flow: FlowId) -> usize {
        self.pending.pending_for(flow)
    }

    /// Number of cached rule answers.
    pub fn cached_rules(&self) -> usize {
        self.matcher.cached()
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    fn handle_request(&self, flow: FlowId, message: &RawMessage, snapshot: Option<&str>) -> Disposition {
        let mut request = match ParsedRequest::from_message(flow, message) {
            Ok(request) => request,
            Err(reason) => {
                tracing::debug!(flow = %flow, %reason, "Dropping unusable request");
                return Disposition::Continue;
            }
        };
        request.body = collect_body(
            request.body,
            self.config.collect_request_body,
            self.config.max_body_bytes,
        );
        request.snapshot = snapshot.map(str::to_string);

        // A request blocked before its response never becomes pending.
        if let Some(matched) = self.matcher.match_any(&request.canonical) {
            return self.dispatcher.dispatch(&request, None, Some(matched));
        }

        tracing::trace!(flow = %flow, url = %request.url, "Request pending");
        self.pending.push(flow, request);
        Disposition::Continue
    }

    fn handle_response(&self, flow: FlowId, message: &RawMessage) -> Disposition {
        let mut response = match ResponsePart::from_message(message) {
            Ok(response) => response,
            Err(reason) => {
                tracing::debug!(flow = %flow, %reason, "Dropping unusable response");
                return Disposition::Continue;
            }
        };

        // Interim responses precede the final one for the same request.
        if is_interim(response.status) {
            return Disposition::Continue;
        }

        let Some(request) = self.pending.take_oldest(flow) else {
            tracing::debug!(flow = %flow, status = response.status, "Response without pending request");
            return Disposition::Continue;
        };

        response.body = collect_body(
            response.body,
            self.config.collect_response_body,
            self.config.max_body_bytes,
        );

        let record = CompletedRecord { request, response };
        let matched = self.matcher.match_any(&record.request.canonical);
        self.dispatcher.dispatch_completed(&record, matched)
    }

    /// A message overflowed the buffer before its head was complete. A lost
    /// response still ends the oldest pending exchange, which is reported
    /// without one.
    fn handle_lost(&self, flow: FlowId, side: Side, dropped: usize) -> Disposition {
        if side == Side::Request {
            tracing::warn!(flow = %flow, dropped, "Dropped request with oversized head");
            return Disposition::Continue;
        }

        let Some(request) = self.pending.take_oldest(flow) else {
            return Disposition::Continue;
        };
        tracing::warn!(flow = %flow, url = %request.url, dropped, "Dropped response with oversized head");
        let matched = self.matcher.match_any(&request.canonical);
        self.dispatcher.dispatch(&request, None, matched)
    }
}

impl std::fmt::Debug for InterceptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptEngine")
            .field("config", &self.config)
            .field("buffers", &self.buffers)
            .field("pending", &self.pending)
            .field("matcher", &self.matcher)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

fn guarded(operation: &'static str, f: impl FnOnce() -> Disposition) -> Disposition {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(disposition) => disposition,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(operation, panic = %message, "Recovered from panic in intercept pipeline");
            Disposition::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::rules::{MemoryRuleStore, RuleMatch, RuleType};
    use crate::verdict::{BodyRef, Channel, Classification, MemoryBlobStore, VerdictEvent};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<VerdictEvent>>,
    }

    impl CollectingSink {
        fn on(&self, channel: Channel) -> Vec<VerdictEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| e.channel == channel)
                .cloned()
                .collect()
        }
    }

    impl VerdictSink for CollectingSink {
        fn publish(&self, event: VerdictEvent) {
            self.events.lock().push(event);
        }
    }

    struct PanickingStore;

    impl RuleStore for PanickingStore {
        fn query(&self, _: RuleType, _: &str) -> std::result::Result<Option<RuleMatch>, StoreError> {
            panic!("rule store exploded");
        }
    }

    struct Harness {
        engine: InterceptEngine,
        rules: Arc<MemoryRuleStore>,
        sink: Arc<CollectingSink>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let rules = Arc::new(MemoryRuleStore::new());
        let sink = Arc::new(CollectingSink::default());
        let engine = InterceptEngine::new(
            config,
            Arc::clone(&rules) as Arc<dyn RuleStore>,
            Arc::new(MemoryBlobStore::new()),
            Arc::clone(&sink) as Arc<dyn VerdictSink>,
        )
        .unwrap();
        Harness { engine, rules, sink }
    }

    fn get(path: &str) -> Vec<u8> {
        format!("GET {path} HTTP/1.1\r\nHost: site.test\r\n\r\n").into_bytes()
    }

    fn ok(body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    // ==================== Request/Response Tests ====================

    #[test]
    fn request_then_response_dispatches_pass() {
        let h = harness(EngineConfig::default());
        let flow = FlowId::tls(1);

        assert_eq!(h.engine.on_bytes(flow, Side::Request, &get("/a?x=1")), Disposition::Continue);
        assert_eq!(h.engine.pending_for(flow), 1);
        assert!(h.sink.events.lock().is_empty());

        assert_eq!(h.engine.on_bytes(flow, Side::Response, &ok("hi")), Disposition::Continue);
        assert_eq!(h.engine.pending_requests(), 0);
        assert_eq!(h.engine.buffered_flows(), 0);

        let passed = h.sink.on(Channel::Passed);
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].url, "https://site.test/a?x=1");
        assert_eq!(passed[0].canonical, "https://site.test/a");
        assert_eq!(passed[0].status, Some(200));
        assert_eq!(passed[0].transport, Transport::Tls);
        // Response bodies are not collected by default.
        assert_eq!(passed[0].response_body, None);
        assert_eq!(h.sink.on(Channel::All).len(), 1);
    }

    #[test]
    fn response_body_collected_when_enabled() {
        let h = harness(EngineConfig::default().with_body_collection(true, true));
        let flow = FlowId::plain(1);
        h.engine.on_bytes(flow, Side::Request, &get("/"));
        h.engine.on_bytes(flow, Side::Response, &ok("hello"));

        let passed = h.sink.on(Channel::Passed);
        assert_eq!(
            passed[0].response_body,
            Some(BodyRef::Inline { bytes: b"hello".to_vec() })
        );
        assert_eq!(passed[0].content_descriptor.as_deref(), Some("text/plain"));
    }

    #[test]
    fn pipelined_requests_correlate_in_order() {
        let h = harness(EngineConfig::default());
        let flow = FlowId::plain(2);

        let mut requests = get("/first");
        requests.extend(get("/second"));
        h.engine.on_bytes(flow, Side::Request, &requests);
        assert_eq!(h.engine.pending_for(flow), 2);

        let mut responses = ok("1");
        responses.extend(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        h.engine.on_bytes(flow, Side::Response, &responses);

        let passed = h.sink.on(Channel::Passed);
        assert_eq!(passed.len(), 2);
        assert_eq!(passed[0].url, "http://site.test/first");
        assert_eq!(passed[0].status, Some(200));
        assert_eq!(passed[1].url, "http://site.test/second");
        assert_eq!(passed[1].status, Some(404));
    }

    #[test]
    fn interim_response_does_not_consume_request() {
        let h = harness(EngineConfig::default());
        let flow = FlowId::plain(3);
        h.engine.on_bytes(flow, Side::Request, &get("/upload"));

        h.engine.on_bytes(flow, Side::Response, b"HTTP/1.1 100 Continue\r\n\r\n");
        assert_eq!(h.engine.pending_for(flow), 1);

        h.engine.on_bytes(flow, Side::Response, &ok("done"));
        assert_eq!(h.sink.on(Channel::Passed)[0].status, Some(200));
    }

    #[test]
    fn response_without_request_is_discarded() {
        let h = harness(EngineConfig::default());
        let disposition = h.engine.on_bytes(FlowId::plain(4), Side::Response, &ok("orphan"));
        assert_eq!(disposition, Disposition::Continue);
        assert!(h.sink.events.lock().is_empty());
    }

    #[test]
    fn fragmented_request_is_reassembled() {
        let h = harness(EngineConfig::default());
        let flow = FlowId::tls(5);
        for byte in get("/slow") {
            h.engine.on_bytes(flow, Side::Request, &[byte]);
        }
        assert_eq!(h.engine.pending_for(flow), 1);
    }

    #[test]
    fn connect_creates_nothing() {
        let h = harness(EngineConfig::default());
        let flow = FlowId::plain(6);
        h.engine.on_bytes(
            flow,
            Side::Request,
            b"CONNECT site.test:443 HTTP/1.1\r\nHost: site.test:443\r\n\r\n",
        );
        assert_eq!(h.engine.pending_requests(), 0);
        assert!(h.sink.events.lock().is_empty());
    }

    // ==================== Blocking Tests ====================

    #[test]
    fn matching_request_is_blocked_before_response() {
        let h = harness(EngineConfig::default());
        h.rules.add(RuleType::Domain, "site.test");
        let flow = FlowId::tls(7);

        let disposition = h.engine.on_bytes(flow, Side::Request, &get("/ad.js"));
        assert!(disposition.is_abort());
        assert_eq!(h.engine.pending_for(flow), 0);

        let blocked = h.sink.on(Channel::Blocked);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].classification, Classification::Blocked);
        assert_eq!(blocked[0].status, None);
        assert_eq!(
            blocked[0].matched,
            Some(RuleMatch::new(RuleType::Domain, "site.test"))
        );

        let err = disposition.into_io_result().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn repeated_requests_notify_once_but_always_block() {
        let h = harness(EngineConfig::default());
        h.rules.add(RuleType::Keyword, "tracker");
        let flow = FlowId::plain(8);

        let mut two = get("/tracker.gif?id=1");
        two.extend(get("/tracker.gif?id=2"));
        assert!(h.engine.on_bytes(flow, Side::Request, &two).is_abort());
        assert!(h.engine.on_bytes(flow, Side::Request, &get("/tracker.gif")).is_abort());

        assert_eq!(h.sink.on(Channel::Blocked).len(), 1);
        assert_eq!(h.sink.on(Channel::All).len(), 1);
    }

    #[test]
    fn completed_call_is_checked() {
        let h = harness(EngineConfig::default());
        h.rules.add(RuleType::Url, "https://api.test/v1/ads");

        let blocked = h.engine.on_completed_call(
            CompletedCall::new(Transport::Library, "POST", "https://api.test/v1/ads/slot?x=1")
                .with_request_body(b"{}".to_vec(), Some("application/json".into()))
                .with_snapshot("at Client.execute"),
        );
        assert!(blocked.is_abort());

        let passed = h.engine.on_completed_call(
            CompletedCall::new(Transport::Web, "GET", "https://api.test/v1/feed").with_response(ResponsePart {
                status: 200,
                status_message: "OK".into(),
                headers: String::new(),
                body: Some(b"[]".to_vec()),
                content_descriptor: Some("application/json".into()),
            }),
        );
        assert_eq!(passed, Disposition::Continue);

        let blocked = h.sink.on(Channel::Blocked);
        assert_eq!(blocked[0].transport, Transport::Library);
        assert_eq!(blocked[0].snapshot.as_deref(), Some("at Client.execute"));
        assert_eq!(blocked[0].request_body, Some(BodyRef::Inline { bytes: b"{}".to_vec() }));

        let passed = h.sink.on(Channel::Passed);
        assert_eq!(passed[0].transport, Transport::Web);
        assert_eq!(passed[0].response_body, None);
    }

    // ==================== DNS Tests ====================

    #[test]
    fn dns_resolution_is_checked_by_host() {
        let h = harness(EngineConfig::default());
        h.rules.add(RuleType::Domain, "tracker.test");
        let addresses = vec!["10.0.0.1".to_string()];

        assert!(h.engine.on_dns_resolution("eu.tracker.test", &addresses, None).is_abort());
        assert_eq!(h.engine.on_dns_resolution("clean.test", &addresses, None), Disposition::Continue);

        let blocked = h.sink.on(Channel::Blocked);
        assert_eq!(blocked[0].transport, Transport::Dns);
        assert_eq!(blocked[0].dns_host.as_deref(), Some("eu.tracker.test"));
        assert_eq!(blocked[0].dns_addresses, addresses);
        assert_eq!(h.sink.on(Channel::Passed).len(), 1);
    }

    #[test]
    fn dns_without_addresses_is_ignored() {
        let h = harness(EngineConfig::default());
        h.rules.add(RuleType::Domain, "tracker.test");
        assert_eq!(h.engine.on_dns_resolution("tracker.test", &[], None), Disposition::Continue);
        assert!(h.sink.events.lock().is_empty());
        assert_eq!(h.rules.query_count(), 0);
    }

    // ==================== Lifecycle Tests ====================

    #[test]
    fn closing_a_flow_releases_its_state() {
        let h = harness(EngineConfig::default());
        let flow = FlowId::tls(9);
        h.engine.on_bytes(flow, Side::Request, &get("/a"));
        h.engine.on_bytes(flow, Side::Request, b"GET /partial");
        h.engine.on_bytes(flow, Side::Response, b"HTTP/1.1 200");
        h.engine.on_bytes(FlowId::tls(10), Side::Request, &get("/b"));

        h.engine.on_flow_closed(flow);
        assert_eq!(h.engine.pending_for(flow), 0);
        assert_eq!(h.engine.pending_requests(), 1);
        assert_eq!(h.engine.buffered_flows(), 0);
    }

    #[test]
    fn memory_pressure_clears_rule_cache() {
        let h = harness(EngineConfig::default());
        h.engine.on_bytes(FlowId::plain(1), Side::Request, &get("/a"));
        assert!(h.engine.cached_rules() > 0);

        h.engine.on_memory_pressure();
        assert_eq!(h.engine.cached_rules(), 0);
    }

    #[test]
    fn oversized_request_head_is_dropped() {
        let h = harness(EngineConfig::default().with_max_buffer_bytes(32));
        let flow = FlowId::plain(11);
        h.engine.on_bytes(flow, Side::Request, b"GET /this-header-never-ends-and-keeps-going");
        assert_eq!(h.engine.pending_for(flow), 0);

        h.engine.on_bytes(flow, Side::Request, &get("/"));
        assert_eq!(h.engine.pending_for(flow), 1);
        assert_eq!(h.engine.buffered_flows(), 0);
    }

    // ==================== Overflow Correlation Tests ====================

    fn status(code: u16, body: &str) -> Vec<u8> {
        format!("HTTP/1.1 {code} X\r\nContent-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    #[test]
    fn oversized_response_body_keeps_correlation() {
        let h = harness(EngineConfig::default().with_max_buffer_bytes(64));
        let flow = FlowId::plain(12);

        h.engine.on_bytes(flow, Side::Request, &get("/big"));
        let big = status(200, &"b".repeat(100));
        let split = big.len() - 30;
        h.engine.on_bytes(flow, Side::Response, &big[..split]);
        h.engine.on_bytes(flow, Side::Response, &big[split..]);

        h.engine.on_bytes(flow, Side::Request, &get("/small"));
        h.engine.on_bytes(flow, Side::Response, &status(201, "s"));
        h.engine.on_bytes(flow, Side::Request, &get("/third"));
        h.engine.on_bytes(flow, Side::Response, &status(404, ""));

        let passed: Vec<_> = h
            .sink
            .on(Channel::Passed)
            .into_iter()
            .map(|e| (e.url, e.status))
            .collect();
        assert_eq!(
            passed,
            vec![
                ("http://site.test/big".to_string(), Some(200)),
                ("http://site.test/small".to_string(), Some(201)),
                ("http://site.test/third".to_string(), Some(404)),
            ]
        );
        assert_eq!(h.engine.pending_requests(), 0);
        assert_eq!(h.engine.buffered_flows(), 0);
    }

    #[test]
    fn oversized_response_head_ends_the_oldest_exchange() {
        let h = harness(EngineConfig::default().with_max_buffer_bytes(64));
        let flow = FlowId::plain(13);

        let mut requests = get("/lost");
        requests.extend(get("/next"));
        h.engine.on_bytes(flow, Side::Request, &requests);

        let mut huge = b"HTTP/1.1 200 OK\r\nX-Filler: ".to_vec();
        huge.extend_from_slice(&[b'f'; 80]);
        h.engine.on_bytes(flow, Side::Response, &huge);
        assert_eq!(h.engine.pending_for(flow), 1);

        let mut rest = b"\r\n\r\n".to_vec();
        rest.extend(status(204, ""));
        h.engine.on_bytes(flow, Side::Response, &rest);

        let passed = h.sink.on(Channel::Passed);
        assert_eq!(passed.len(), 2);
        assert_eq!(passed[0].url, "http://site.test/lost");
        assert_eq!(passed[0].status, None);
        assert_eq!(passed[1].url, "http://site.test/next");
        assert_eq!(passed[1].status, Some(204));
        assert_eq!(h.engine.pending_requests(), 0);
    }

    // ==================== HEAD Tests ====================

    #[test]
    fn head_response_does_not_wait_for_a_body() {
        let h = harness(EngineConfig::default());
        let flow = FlowId::tls(14);

        h.engine.on_bytes(flow, Side::Request, b"HEAD /file HTTP/1.1\r\nHost: site.test\r\n\r\n");
        h.engine.on_bytes(
            flow,
            Side::Response,
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n",
        );
        assert_eq!(h.engine.pending_for(flow), 0);
        assert_eq!(h.engine.buffered_flows(), 0);

        h.engine.on_bytes(flow, Side::Request, &get("/after"));
        h.engine.on_bytes(flow, Side::Response, &ok("done"));

        let passed = h.sink.on(Channel::Passed);
        assert_eq!(passed.len(), 2);
        assert_eq!(passed[0].url, "https://site.test/file");
        assert_eq!(passed[0].status, Some(200));
        assert_eq!(passed[1].url, "https://site.test/after");
        assert_eq!(passed[1].status, Some(200));
    }

    #[test]
    fn pipelined_head_and_get_share_one_response_batch() {
        let h = harness(EngineConfig::default());
        let flow = FlowId::plain(15);

        let mut requests = b"HEAD /h HTTP/1.1\r\nHost: site.test\r\n\r\n".to_vec();
        requests.extend(get("/g"));
        h.engine.on_bytes(flow, Side::Request, &requests);

        let mut responses = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n".to_vec();
        responses.extend(ok("body"));
        h.engine.on_bytes(flow, Side::Response, &responses);

        let passed = h.sink.on(Channel::Passed);
        assert_eq!(passed.len(), 2);
        assert_eq!(passed[0].url, "http://site.test/h");
        assert_eq!(passed[1].url, "http://site.test/g");
        assert_eq!(h.engine.pending_requests(), 0);
        assert_eq!(h.engine.buffered_flows(), 0);
    }

    #[test]
    fn panics_become_continue() {
        let sink = Arc::new(CollectingSink::default());
        let engine = InterceptEngine::new(
            EngineConfig::default(),
            Arc::new(PanickingStore),
            Arc::new(MemoryBlobStore::new()),
            Arc::clone(&sink) as Arc<dyn VerdictSink>,
        )
        .unwrap();

        let disposition = engine.on_bytes(FlowId::plain(1), Side::Request, &get("/"));
        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(
            engine.on_dns_resolution("a.test", &["1.1.1.1".to_string()], None),
            Disposition::Continue
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = InterceptEngine::new(
            EngineConfig::default().with_dedup_capacity(0),
            Arc::new(MemoryRuleStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(CollectingSink::default()),
        );
        assert!(result.is_err());
    }
}
