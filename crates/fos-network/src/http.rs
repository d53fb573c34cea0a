//! HTTP(S) Transport Adapter
//!
//! Wraps one in-flight request and runs it through the filter pipeline.
//!
//! Flow:
//! 1. onBeforeRequest: block, redirect (synthesized, the transport never
//!    sees the original URL) or proceed
//! 2. onBeforeSendHeaders: apply the net header change, notify
//!    onSendHeaders, start the transport
//! 3. Response or redirect headers arrive: onHeadersReceived may block,
//!    rewrite headers or turn the response into a redirect
//! 4. Redirects go to the caller; following one replays the pipeline for
//!    the new URL under the same request id
//! 5. Body chunks stream through; completion or error is terminal

use crate::config::AdapterConfig;
use crate::redirect::{self, RedirectInfo};
use crate::transport::{CompletionStatus, HttpTransport, LoaderClient, RequestParams, TransportRequest};
use fos_webrequest::{
    CompletionCode, FilteredRequest, NetError, Outcome, PhaseCallback, PhaseDecision, RequestCoordinator,
    RequestId, ResponseHead,
};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};
use url::Url;

/// Where the request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStage {
    Created,
    BeforeRequest,
    BeforeSendHeaders,
    AwaitingResponse,
    HeadersReceived,
    /// A redirect was handed to the caller
    AwaitingFollowRedirect,
    ResponseDelivered,
    Completed,
    Failed,
    /// Torn down so the transport can recreate the request
    Restarted,
}

impl HttpStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Restarted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Idle,
    Running,
    /// The transport reported a redirect and waits to follow it
    RedirectPending,
}

/// Response headers under filter review
enum Received {
    Response,
    Redirect(RedirectInfo),
}

struct HttpState {
    stage: HttpStage,
    request: FilteredRequest,
    transport: TransportState,
    redirect: Option<RedirectInfo>,
    /// Target of the redirect the transport reported
    transport_redirect_url: Option<Url>,
    /// Header edits the caller made when following redirects
    redirect_removed: Vec<HeaderName>,
    redirect_modified: HeaderMap,
    /// Bumped for every phase; stale continuations are ignored
    epoch: u64,
    released: bool,
}

struct AdapterCore {
    coordinator: RequestCoordinator,
    config: AdapterConfig,
    routing_key: i32,
    transport_local_id: i32,
    transport: Arc<dyn HttpTransport>,
    client: Arc<dyn LoaderClient>,
    state: Mutex<HttpState>,
}

/// One HTTP request in flight. Dropping it before completion counts as a
/// client disconnect.
pub struct HttpRequestAdapter {
    core: Arc<AdapterCore>,
}

impl HttpRequestAdapter {
    /// Create the adapter and run onBeforeRequest.
    pub fn start(
        coordinator: RequestCoordinator,
        config: AdapterConfig,
        params: RequestParams,
        transport: Arc<dyn HttpTransport>,
        client: Arc<dyn LoaderClient>,
    ) -> Self {
        let id = coordinator.generate_id(params.routing_key, params.transport_local_id);
        let routing_key = params.routing_key;
        let transport_local_id = params.transport_local_id;
        let request = params.into_request(id);

        debug!("{} started: {} {}", id, request.method, request.url);

        let core = Arc::new(AdapterCore {
            coordinator,
            config,
            routing_key,
            transport_local_id,
            transport,
            client,
            state: Mutex::new(HttpState {
                stage: HttpStage::Created,
                request,
                transport: TransportState::Idle,
                redirect: None,
                transport_redirect_url: None,
                redirect_removed: Vec::new(),
                redirect_modified: HeaderMap::new(),
                epoch: 0,
                released: false,
            }),
        });
        core.run_before_request();
        Self { core }
    }

    pub fn id(&self) -> RequestId {
        self.core.state.lock().request.id
    }

    pub fn stage(&self) -> HttpStage {
        self.core.state.lock().stage
    }

    pub fn url(&self) -> Url {
        self.core.state.lock().request.url.clone()
    }

    /// The transport received the final response headers.
    pub fn on_receive_response(&self, head: ResponseHead) {
        self.core.headers_arrived(head, Received::Response);
    }

    /// The transport received a redirect response.
    pub fn on_receive_redirect(&self, redirect: RedirectInfo, head: ResponseHead) {
        self.core.headers_arrived(head, Received::Redirect(redirect));
    }

    pub fn on_data(&self, chunk: Bytes) {
        if self.core.state.lock().stage != HttpStage::ResponseDelivered {
            trace!("Dropping body chunk outside of response stage");
            return;
        }
        self.core.client.on_data(chunk);
    }

    /// The transport finished, successfully or not.
    pub fn on_complete(&self, status: CompletionStatus) {
        self.core.transport_complete(status);
    }

    /// The caller follows the redirect it was handed, optionally editing
    /// request headers.
    pub fn follow_redirect(&self, removed_headers: Vec<HeaderName>, modified_headers: HeaderMap) {
        self.core.follow_redirect(removed_headers, modified_headers);
    }

    /// The caller tore the request down.
    pub fn disconnect(&self) {
        self.core.abandon(NetError::ClientDisconnected);
    }

    /// Tear down without notifying filters, keeping the logical id for the
    /// request the transport recreates under the same local id.
    pub fn detach_for_restart(self) {
        let core = &self.core;
        let (id, transport_active) = {
            let mut state = core.state.lock();
            if state.stage.is_terminal() {
                return;
            }
            state.stage = HttpStage::Restarted;
            (state.request.id, state.transport != TransportState::Idle)
        };

        if transport_active {
            core.transport.cancel(NetError::ClientDisconnected);
        }
        core.coordinator.save_id(core.routing_key, core.transport_local_id, id);
        core.release();
        debug!("{} detached for restart", id);
    }
}

impl Drop for HttpRequestAdapter {
    fn drop(&mut self) {
        self.core.abandon(NetError::ClientDisconnected);
    }
}

impl AdapterCore {
    /// Clone the request and start a new epoch, unless the request is done.
    fn enter(&self, stage: HttpStage) -> Option<(FilteredRequest, u64)> {
        let mut state = self.state.lock();
        if state.stage.is_terminal() {
            return None;
        }
        state.stage = stage;
        state.epoch += 1;
        Some((state.request.clone(), state.epoch))
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.epoch == epoch && !state.stage.is_terminal()
    }

    fn continuation<F>(self: &Arc<Self>, epoch: u64, then: F) -> PhaseCallback
    where
        F: FnOnce(&Arc<AdapterCore>, PhaseDecision) + Send + 'static,
    {
        let weak: Weak<AdapterCore> = Arc::downgrade(self);
        Box::new(move |decision: PhaseDecision| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            if !core.is_current(epoch) {
                trace!("Stale {} decision for {}", decision.phase, decision.request_id);
                return;
            }
            then(&core, decision);
        })
    }

    fn run_before_request(self: &Arc<Self>) {
        let Some((request, epoch)) = self.enter(HttpStage::BeforeRequest) else {
            return;
        };
        let done = self.continuation(epoch, |core, decision| core.before_request_done(decision));
        self.coordinator.on_before_request(&request, done);
    }

    fn before_request_done(self: &Arc<Self>, decision: PhaseDecision) {
        if let Outcome::Block { collapse } = decision.outcome {
            self.fail(CompletionStatus::blocked(collapse));
            return;
        }
        match decision.redirect_url {
            Some(url) => self.synthesize_redirect(url),
            None => self.run_before_send_headers(),
        }
    }

    /// Answer a filter redirect locally with a fabricated redirect response.
    fn synthesize_redirect(self: &Arc<Self>, url: Url) {
        let (from, method) = {
            let state = self.state.lock();
            (state.request.url.clone(), state.request.method.clone())
        };

        if !self.config.redirect_policy.is_safe(&from, &url) {
            warn!("Unsafe filter redirect from {} to {}", from, url);
            self.fail(CompletionStatus::failed(NetError::UnsafeRedirect));
            return;
        }

        match redirect::internal_redirect(&url, &self.config) {
            Ok(head) => {
                let info = RedirectInfo::compute(&method, head.status, url);
                self.deliver_redirect(info, head);
            }
            Err(e) => {
                warn!("Cannot synthesize redirect to {}: {}", url, e);
                self.fail(CompletionStatus::failed(NetError::UnsafeRedirect));
            }
        }
    }

    fn deliver_redirect(self: &Arc<Self>, info: RedirectInfo, head: ResponseHead) {
        let request = {
            let mut state = self.state.lock();
            if state.stage.is_terminal() {
                return;
            }
            state.stage = HttpStage::AwaitingFollowRedirect;
            state.request.response_head = Some(head.clone());
            state.redirect = Some(info.clone());
            state.request.clone()
        };

        debug!("{} redirecting to {}", request.id, info.new_url);
        self.coordinator.on_before_redirect(&request, &info.new_url);
        self.client.on_receive_redirect(&info, &head);
    }

    fn follow_redirect(self: &Arc<Self>, removed: Vec<HeaderName>, modified: HeaderMap) {
        {
            let mut state = self.state.lock();
            if state.stage != HttpStage::AwaitingFollowRedirect {
                warn!("follow_redirect in stage {:?}", state.stage);
                return;
            }
            let Some(info) = state.redirect.take() else {
                return;
            };

            for name in &removed {
                state.request.headers.remove(name);
            }
            for name in modified.keys() {
                state.request.headers.remove(name);
                for value in modified.get_all(name) {
                    state.request.headers.append(name.clone(), value.clone());
                }
            }
            state.redirect_removed.extend(removed);
            state.redirect_modified.extend(modified);

            state.request.method = info.new_method;
            state.request.redirect_to(info.new_url);
        }
        self.run_before_request();
    }

    fn run_before_send_headers(self: &Arc<Self>) {
        let Some((request, epoch)) = self.enter(HttpStage::BeforeSendHeaders) else {
            return;
        };
        let done = self.continuation(epoch, |core, decision| core.before_send_headers_done(decision));
        self.coordinator.on_before_send_headers(&request, done);
    }

    fn before_send_headers_done(self: &Arc<Self>, decision: PhaseDecision) {
        if let Outcome::Block { collapse } = decision.outcome {
            self.fail(CompletionStatus::blocked(collapse));
            return;
        }

        let (request, transport_state, removed, modified, override_url) = {
            let mut state = self.state.lock();
            if let Some(delta) = &decision.request_headers {
                state.request.headers = delta.headers.clone();
            }

            let mut removed = std::mem::take(&mut state.redirect_removed);
            let mut modified = std::mem::take(&mut state.redirect_modified);
            if let Some(delta) = decision.request_headers {
                modified.extend(delta.modified);
                removed.extend(delta.removed);
            }

            let override_url = match &state.transport_redirect_url {
                Some(url) if *url != state.request.url => Some(state.request.url.clone()),
                _ => None,
            };

            let transport_state = state.transport;
            state.transport = TransportState::Running;
            state.transport_redirect_url = None;
            state.stage = HttpStage::AwaitingResponse;
            (state.request.clone(), transport_state, removed, modified, override_url)
        };

        self.coordinator.on_send_headers(&request);

        match transport_state {
            TransportState::Idle => {
                let raw = self.coordinator.has_extra_headers_filter(&request);
                self.transport.start(&TransportRequest::from_request(&request, raw));
            }
            TransportState::RedirectPending => {
                self.transport
                    .follow_redirect(&removed, &modified, override_url.as_ref());
            }
            TransportState::Running => {
                warn!("{} sent headers while the transport was running", request.id);
            }
        }
    }

    fn headers_arrived(self: &Arc<Self>, head: ResponseHead, received: Received) {
        let (request, epoch) = {
            let mut state = self.state.lock();
            if state.stage != HttpStage::AwaitingResponse {
                trace!("Ignoring response headers in stage {:?}", state.stage);
                return;
            }
            state.stage = HttpStage::HeadersReceived;
            state.epoch += 1;
            if let Received::Redirect(info) = &received {
                state.transport = TransportState::RedirectPending;
                state.transport_redirect_url = Some(info.new_url.clone());
            }
            state.request.response_head = Some(head.clone());
            (state.request.clone(), state.epoch)
        };

        let original = head.clone();
        let done = self.continuation(epoch, move |core, decision| {
            core.headers_received_done(decision, original, received)
        });
        self.coordinator.on_headers_received(&request, &head, done);
    }

    fn headers_received_done(self: &Arc<Self>, decision: PhaseDecision, original: ResponseHead, received: Received) {
        if let Outcome::Block { collapse } = decision.outcome {
            self.fail(CompletionStatus::blocked(collapse));
            return;
        }

        let head = decision.response.unwrap_or(original);

        if let Some(url) = decision.redirect_url {
            let (from, method) = {
                let state = self.state.lock();
                (state.request.url.clone(), state.request.method.clone())
            };
            if !self.config.redirect_policy.is_safe(&from, &url) {
                warn!("Unsafe filter redirect from {} to {}", from, url);
                self.fail(CompletionStatus::failed(NetError::UnsafeRedirect));
                return;
            }

            if let Received::Response = received {
                // The transport's response is discarded; the follow-up
                // request starts a fresh attempt.
                self.transport.cancel(NetError::ClientDisconnected);
                self.state.lock().transport = TransportState::Idle;
            }
            let info = RedirectInfo::compute(&method, head.status, url);
            self.deliver_redirect(info, head);
            return;
        }

        match received {
            Received::Redirect(info) => self.deliver_redirect(info, head),
            Received::Response => {
                let request = {
                    let mut state = self.state.lock();
                    state.stage = HttpStage::ResponseDelivered;
                    state.request.response_head = Some(head.clone());
                    state.request.clone()
                };
                self.coordinator.on_response_started(&request);
                self.client.on_receive_response(&head);
            }
        }
    }

    fn transport_complete(self: &Arc<Self>, status: CompletionStatus) {
        let request = {
            let mut state = self.state.lock();
            if state.stage.is_terminal() {
                return;
            }
            state.stage = if status.is_ok() { HttpStage::Completed } else { HttpStage::Failed };
            state.transport = TransportState::Idle;
            state.request.clone()
        };

        match status.error {
            None => self.coordinator.on_completed(&request, CompletionCode::Ok),
            Some(error) => self.coordinator.on_error_occurred(&request, error),
        }
        self.client.on_complete(&status);
        self.release();
    }

    /// Terminate with a filter-caused error before or instead of the
    /// transport's own completion.
    fn fail(self: &Arc<Self>, status: CompletionStatus) {
        let error = status.error.unwrap_or(NetError::BlockedByFilter);
        let (request, transport_active) = {
            let mut state = self.state.lock();
            if state.stage.is_terminal() {
                return;
            }
            state.stage = HttpStage::Failed;
            let active = state.transport != TransportState::Idle;
            state.transport = TransportState::Idle;
            (state.request.clone(), active)
        };

        debug!("{} failed: {}", request.id, error);
        if transport_active {
            self.transport.cancel(error);
        }
        self.coordinator.on_error_occurred(&request, error);
        self.client.on_complete(&status);
        self.release();
    }

    /// The caller went away; nothing is reported back to it.
    fn abandon(&self, error: NetError) {
        let (request, started, transport_active) = {
            let mut state = self.state.lock();
            if state.stage.is_terminal() {
                return;
            }
            let started = state.stage != HttpStage::Created;
            state.stage = HttpStage::Failed;
            let active = state.transport != TransportState::Idle;
            state.transport = TransportState::Idle;
            (state.request.clone(), started, active)
        };

        debug!("{} abandoned: {}", request.id, error);
        if transport_active {
            self.transport.cancel(error);
        }
        if started {
            let reported = if self.coordinator.has_pending_phase(request.id) {
                NetError::AbortedDuringTeardown
            } else {
                error
            };
            self.coordinator.on_error_occurred(&request, reported);
        }
        self.release();
    }

    fn release(&self) {
        let id = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.request.id
        };
        self.coordinator.request_will_be_destroyed(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ClientEvent, RecordingClient, RecordingFilter, RecordingTransport, TransportCall};
    use fos_webrequest::{Destination, Filter, FilterContext, FilterKind, HeaderChanges, Phase, Reply, Responder, Verdict};
    use std::time::Duration;
    use hyper::StatusCode;
    use hyper::header::{HeaderValue, CONTENT_SECURITY_POLICY};

    struct Harness {
        coordinator: RequestCoordinator,
        transport: Arc<RecordingTransport>,
        client: Arc<RecordingClient>,
    }

    impl Harness {
        fn new(filters: &[Arc<RecordingFilter>]) -> Self {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
            let coordinator = RequestCoordinator::with_defaults();
            for filter in filters {
                coordinator.install(filter.clone());
            }
            Self {
                coordinator,
                transport: Arc::new(RecordingTransport::default()),
                client: Arc::new(RecordingClient::default()),
            }
        }

        fn start(&self, url: &str) -> HttpRequestAdapter {
            self.start_with(RequestParams::new(Url::parse(url).unwrap(), Destination::Document))
        }

        fn start_with(&self, params: RequestParams) -> HttpRequestAdapter {
            HttpRequestAdapter::start(
                self.coordinator.clone(),
                AdapterConfig::default(),
                params,
                self.transport.clone(),
                self.client.clone(),
            )
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_full_load() {
        let filter = Arc::new(
            RecordingFilter::new("rewriter", 0)
                .send_headers_verdict(Verdict::headers(HeaderChanges::new().try_set("dnt", "1").unwrap()))
                .response_verdict(Verdict::headers(
                    HeaderChanges::new()
                        .try_set("content-security-policy", "script-src 'self'")
                        .unwrap(),
                )),
        );
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://site.test/");
        let started = harness.transport.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].headers.get("dnt").unwrap(), "1");
        assert_eq!(adapter.stage(), HttpStage::AwaitingResponse);

        adapter.on_receive_response(ResponseHead::new(StatusCode::OK));
        adapter.on_data(Bytes::from_static(b"<html>"));
        adapter.on_complete(CompletionStatus::ok());

        let events = harness.client.events();
        match &events[0] {
            ClientEvent::Response(head) => assert!(head.headers.contains_key(CONTENT_SECURITY_POLICY)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[1], ClientEvent::Data(Bytes::from_static(b"<html>")));
        assert_eq!(events[2], ClientEvent::Complete(CompletionStatus::ok()));

        for phase in [
            Phase::BeforeRequest,
            Phase::BeforeSendHeaders,
            Phase::SendHeaders,
            Phase::HeadersReceived,
            Phase::ResponseStarted,
            Phase::Completed,
        ] {
            assert_eq!(filter.count(phase), 1, "{}", phase);
        }
        assert!(!harness.coordinator.is_tracking(adapter.id()));
    }

    #[test]
    fn test_blocked_before_request() {
        let filter = Arc::new(
            RecordingFilter::new("blocker", 0).request_verdict(Verdict::cancel().collapsed(true)),
        );
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://ads.test/banner.png");

        assert!(harness.transport.calls().is_empty());
        assert_eq!(harness.client.events(), vec![ClientEvent::Complete(CompletionStatus::blocked(true))]);
        assert_eq!(filter.count(Phase::ErrorOccurred), 1);
        assert_eq!(filter.count(Phase::BeforeSendHeaders), 0);
        assert_eq!(adapter.stage(), HttpStage::Failed);
        assert!(!harness.coordinator.is_tracking(adapter.id()));
    }

    #[test]
    fn test_filter_redirect_is_synthesized() {
        let filter = Arc::new(
            RecordingFilter::new("redirector", 0)
                .redirecting(url("https://site.test/"), url("https://mirror.test/")),
        );
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://site.test/");

        assert!(harness.transport.calls().is_empty());
        match &harness.client.events()[0] {
            ClientEvent::Redirect(info, head) => {
                assert_eq!(info.new_url, url("https://mirror.test/"));
                assert_eq!(head.status_line(), "HTTP/1.1 307 Internal Redirect");
                assert_eq!(head.location(), Some("https://mirror.test/"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(filter.count(Phase::BeforeRedirect), 1);

        adapter.follow_redirect(Vec::new(), HeaderMap::new());

        let started = harness.transport.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].url, url("https://mirror.test/"));

        adapter.on_receive_response(ResponseHead::new(StatusCode::OK));
        adapter.on_complete(CompletionStatus::ok());

        assert_eq!(filter.count(Phase::BeforeRequest), 2);
        assert_eq!(filter.count(Phase::BeforeSendHeaders), 1);
        assert_eq!(filter.count(Phase::HeadersReceived), 1);
        assert_eq!(filter.count(Phase::Completed), 1);

        let ids = filter.ids();
        assert!(ids.iter().all(|id| *id == adapter.id()), "{:?}", ids);
    }

    #[test]
    fn test_unsafe_filter_redirect_fails() {
        let filter = Arc::new(
            RecordingFilter::new("redirector", 0).request_verdict(Verdict::redirect(url("data:text/html,gotcha"))),
        );
        let harness = Harness::new(&[filter.clone()]);

        let _adapter = harness.start("https://site.test/");

        assert_eq!(
            harness.client.events(),
            vec![ClientEvent::Complete(CompletionStatus::failed(NetError::UnsafeRedirect))]
        );
        assert_eq!(filter.count(Phase::ErrorOccurred), 1);
    }

    #[test]
    fn test_server_redirect_replays_phases() {
        let filter = Arc::new(RecordingFilter::new("observer", 0));
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("http://site.test/old");
        let target = url("https://site.test/new");
        let head = ResponseHead::redirect(StatusCode::MOVED_PERMANENTLY, "Moved Permanently", &target).unwrap();
        adapter.on_receive_redirect(
            RedirectInfo::compute(&hyper::Method::GET, StatusCode::MOVED_PERMANENTLY, target.clone()),
            head,
        );

        assert!(matches!(harness.client.events()[0], ClientEvent::Redirect(..)));

        let mut modified = HeaderMap::new();
        modified.insert("x-follow", HeaderValue::from_static("yes"));
        adapter.follow_redirect(Vec::new(), modified);

        let follows = harness.transport.follows();
        assert_eq!(follows.len(), 1);
        assert!(follows[0].2.is_none());
        assert_eq!(follows[0].1.get("x-follow").unwrap(), "yes");
        assert_eq!(adapter.url(), target);

        adapter.on_receive_response(ResponseHead::new(StatusCode::OK));
        adapter.on_complete(CompletionStatus::ok());

        assert_eq!(filter.count(Phase::BeforeRequest), 2);
        assert_eq!(filter.count(Phase::SendHeaders), 2);
        assert_eq!(filter.count(Phase::HeadersReceived), 2);
        assert_eq!(filter.count(Phase::BeforeRedirect), 1);
        assert_eq!(filter.count(Phase::ResponseStarted), 1);
        assert_eq!(filter.count(Phase::Completed), 1);
    }

    #[test]
    fn test_filter_redirect_after_server_redirect_overrides_target() {
        let filter = Arc::new(
            RecordingFilter::new("redirector", 0)
                .redirecting(url("https://site.test/new"), url("https://mirror.test/new")),
        );
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://site.test/old");
        let target = url("https://site.test/new");
        let head = ResponseHead::redirect(StatusCode::FOUND, "Found", &target).unwrap();
        adapter.on_receive_redirect(RedirectInfo::compute(&hyper::Method::GET, StatusCode::FOUND, target), head);
        adapter.follow_redirect(Vec::new(), HeaderMap::new());
        // The filter redirects the follow-up; the caller follows again.
        adapter.follow_redirect(Vec::new(), HeaderMap::new());

        let follows = harness.transport.follows();
        assert_eq!(follows.len(), 1);
        assert_eq!(follows[0].2, Some(url("https://mirror.test/new")));
        assert_eq!(harness.transport.started().len(), 1);
    }

    #[test]
    fn test_headers_received_redirect_restarts_transport() {
        let filter = Arc::new(
            RecordingFilter::new("redirector", 0).response_verdict(Verdict::redirect(url("https://cdn.test/asset"))),
        );
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://site.test/asset");
        adapter.on_receive_response(ResponseHead::new(StatusCode::OK));

        assert!(harness.transport.calls().contains(&TransportCall::Cancel(NetError::ClientDisconnected)));
        match &harness.client.events()[0] {
            ClientEvent::Redirect(info, head) => {
                assert_eq!(head.status, StatusCode::FOUND);
                assert_eq!(info.new_url, url("https://cdn.test/asset"));
            }
            other => panic!("unexpected {:?}", other),
        }

        adapter.follow_redirect(Vec::new(), HeaderMap::new());
        let started = harness.transport.started();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].url, url("https://cdn.test/asset"));
    }

    #[test]
    fn test_blocked_on_response_cancels_transport() {
        let filter = Arc::new(RecordingFilter::new("blocker", 0).response_verdict(Verdict::cancel()));
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://site.test/");
        adapter.on_receive_response(ResponseHead::new(StatusCode::OK));

        assert!(harness.transport.calls().contains(&TransportCall::Cancel(NetError::BlockedByFilter)));
        assert_eq!(harness.client.events(), vec![ClientEvent::Complete(CompletionStatus::blocked(false))]);
        assert_eq!(filter.count(Phase::ResponseStarted), 0);
    }

    #[test]
    fn test_network_error() {
        let filter = Arc::new(RecordingFilter::new("observer", 0));
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://down.test/");
        adapter.on_complete(CompletionStatus::failed(NetError::Network(-105)));

        assert_eq!(filter.count(Phase::ErrorOccurred), 1);
        assert_eq!(filter.count(Phase::Completed), 0);
        assert_eq!(
            harness.client.events(),
            vec![ClientEvent::Complete(CompletionStatus::failed(NetError::Network(-105)))]
        );
        assert_eq!(adapter.stage(), HttpStage::Failed);
    }

    #[test]
    fn test_disconnect_while_filter_pending() {
        let filter = Arc::new(RecordingFilter::new("slow", 0).asynchronous());
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://site.test/");
        assert_eq!(harness.coordinator.pending_count(), 1);

        adapter.disconnect();
        assert_eq!(harness.coordinator.pending_count(), 0);

        filter.answer_all();
        assert!(harness.client.events().is_empty());
        assert!(harness.transport.calls().is_empty());
        assert_eq!(filter.errors(), vec![NetError::AbortedDuringTeardown]);
    }

    #[test]
    fn test_drop_cancels_running_transport() {
        let harness = Harness::new(&[]);

        let adapter = harness.start("https://site.test/");
        let id = adapter.id();
        drop(adapter);

        assert!(harness.transport.calls().contains(&TransportCall::Cancel(NetError::ClientDisconnected)));
        assert!(!harness.coordinator.is_tracking(id));
    }

    #[test]
    fn test_restart_keeps_logical_id() {
        let harness = Harness::new(&[]);
        let params = RequestParams::new(url("https://site.test/"), Destination::Document).with_transport_id(4, 21);

        let first = harness.start_with(params.clone());
        let id = first.id();
        first.detach_for_restart();

        let recreated = harness.start_with(params.clone());
        assert_eq!(recreated.id(), id);

        let unrelated = harness.start_with(params);
        assert_ne!(unrelated.id(), id);
    }

    #[test]
    fn test_async_filter_resumes_pipeline() {
        let filter = Arc::new(RecordingFilter::new("slow", 0).asynchronous());
        let harness = Harness::new(&[filter.clone()]);

        let adapter = harness.start("https://site.test/");
        assert_eq!(adapter.stage(), HttpStage::BeforeRequest);

        filter.answer_all();
        assert_eq!(adapter.stage(), HttpStage::BeforeSendHeaders);

        filter.answer_all();
        assert_eq!(adapter.stage(), HttpStage::AwaitingResponse);
        assert_eq!(harness.transport.started().len(), 1);
    }

    #[tokio::test]
    async fn test_filter_answering_from_task() {
        struct Deferred;
        impl Filter for Deferred {
            fn kind(&self) -> FilterKind {
                FilterKind::Extension
            }
            fn priority(&self) -> i32 {
                0
            }
            fn on_before_request(&self, _ctx: &FilterContext, _r: &FilteredRequest, responder: Responder) -> Reply {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    responder.respond(Verdict::allow());
                });
                Reply::Pending
            }
        }

        let harness = Harness::new(&[]);
        harness.coordinator.install(Arc::new(Deferred));

        let adapter = harness.start("https://site.test/");
        assert!(harness.transport.started().is_empty());

        for _ in 0..100 {
            if !harness.transport.started().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(harness.transport.started().len(), 1);
        assert_eq!(adapter.stage(), HttpStage::AwaitingResponse);
    }
}
