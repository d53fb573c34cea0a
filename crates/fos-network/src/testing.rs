//! Recording doubles shared by the adapter tests.

use crate::redirect::RedirectInfo;
use crate::transport::{CompletionStatus, HttpTransport, LoaderClient, TransportRequest};
use fos_webrequest::{
    CompletionCode, Filter, FilterContext, FilterKind, FilteredRequest, NetError, Phase, Reply, RequestId, Responder,
    ResponseHead, Verdict,
};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName};
use parking_lot::Mutex;
use url::Url;

/// Filter with fixed verdicts that records every call it receives.
pub struct RecordingFilter {
    name: &'static str,
    priority: i32,
    asynchronous: bool,
    before_request: Verdict,
    before_send_headers: Verdict,
    headers_received: Verdict,
    redirects: Vec<(Url, Url)>,
    blocked_hosts: Vec<&'static str>,
    parked: Mutex<Vec<(Responder, Verdict)>>,
    seen: Mutex<Vec<(Phase, RequestId)>>,
    errors: Mutex<Vec<NetError>>,
    completions: Mutex<Vec<CompletionCode>>,
}

impl RecordingFilter {
    pub fn new(name: &'static str, priority: i32) -> Self {
        Self {
            name,
            priority,
            asynchronous: false,
            before_request: Verdict::allow(),
            before_send_headers: Verdict::allow(),
            headers_received: Verdict::allow(),
            redirects: Vec::new(),
            blocked_hosts: Vec::new(),
            parked: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
        }
    }

    /// Park responders instead of answering in place
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn request_verdict(mut self, verdict: Verdict) -> Self {
        self.before_request = verdict;
        self
    }

    pub fn send_headers_verdict(mut self, verdict: Verdict) -> Self {
        self.before_send_headers = verdict;
        self
    }

    pub fn response_verdict(mut self, verdict: Verdict) -> Self {
        self.headers_received = verdict;
        self
    }

    /// Redirect requests for `from` to `to` in onBeforeRequest
    pub fn redirecting(mut self, from: Url, to: Url) -> Self {
        self.redirects.push((from, to));
        self
    }

    /// Cancel requests for `host` in onBeforeRequest
    pub fn blocking_host(mut self, host: &'static str) -> Self {
        self.blocked_hosts.push(host);
        self
    }

    /// Answer every parked responder with its scripted verdict.
    pub fn answer_all(&self) {
        let parked = std::mem::take(&mut *self.parked.lock());
        for (responder, verdict) in parked {
            responder.respond(verdict);
        }
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.seen.lock().iter().filter(|(p, _)| *p == phase).count()
    }

    /// Request ids seen, in call order
    pub fn ids(&self) -> Vec<RequestId> {
        self.seen.lock().iter().map(|(_, id)| *id).collect()
    }

    pub fn errors(&self) -> Vec<NetError> {
        self.errors.lock().clone()
    }

    pub fn completions(&self) -> Vec<CompletionCode> {
        self.completions.lock().clone()
    }

    fn record(&self, phase: Phase, request: &FilteredRequest) {
        self.seen.lock().push((phase, request.id));
    }

    fn answer(&self, responder: Responder, verdict: Verdict) -> Reply {
        if self.asynchronous {
            self.parked.lock().push((responder, verdict));
            Reply::Pending
        } else {
            Reply::Ready(verdict)
        }
    }
}

impl Filter for RecordingFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Extension
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        self.name
    }

    fn on_before_request(&self, _ctx: &FilterContext, request: &FilteredRequest, responder: Responder) -> Reply {
        self.record(Phase::BeforeRequest, request);
        let verdict = match self.redirects.iter().find(|(from, _)| *from == request.url) {
            Some((_, to)) => Verdict::redirect(to.clone()),
            None if request.host().is_some_and(|host| self.blocked_hosts.contains(&host)) => Verdict::cancel(),
            None => self.before_request.clone(),
        };
        self.answer(responder, verdict)
    }

    fn on_before_send_headers(&self, _ctx: &FilterContext, request: &FilteredRequest, responder: Responder) -> Reply {
        self.record(Phase::BeforeSendHeaders, request);
        self.answer(responder, self.before_send_headers.clone())
    }

    fn on_send_headers(&self, _ctx: &FilterContext, request: &FilteredRequest) {
        self.record(Phase::SendHeaders, request);
    }

    fn on_headers_received(
        &self,
        _ctx: &FilterContext,
        request: &FilteredRequest,
        _response: &ResponseHead,
        responder: Responder,
    ) -> Reply {
        self.record(Phase::HeadersReceived, request);
        self.answer(responder, self.headers_received.clone())
    }

    fn on_before_redirect(&self, _ctx: &FilterContext, request: &FilteredRequest, _new_url: &Url) {
        self.record(Phase::BeforeRedirect, request);
    }

    fn on_response_started(&self, _ctx: &FilterContext, request: &FilteredRequest) {
        self.record(Phase::ResponseStarted, request);
    }

    fn on_completed(&self, _ctx: &FilterContext, request: &FilteredRequest, code: CompletionCode) {
        self.record(Phase::Completed, request);
        self.completions.lock().push(code);
    }

    fn on_error_occurred(&self, _ctx: &FilterContext, request: &FilteredRequest, error: NetError) {
        self.record(Phase::ErrorOccurred, request);
        self.errors.lock().push(error);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Start(TransportRequest),
    Follow {
        removed: Vec<HeaderName>,
        modified: HeaderMap,
        new_url: Option<Url>,
    },
    Cancel(NetError),
}

#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn started(&self) -> Vec<TransportRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Start(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn follows(&self) -> Vec<(Vec<HeaderName>, HeaderMap, Option<Url>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Follow {
                    removed,
                    modified,
                    new_url,
                } => Some((removed.clone(), modified.clone(), new_url.clone())),
                _ => None,
            })
            .collect()
    }
}

impl HttpTransport for RecordingTransport {
    fn start(&self, request: &TransportRequest) {
        self.calls.lock().push(TransportCall::Start(request.clone()));
    }

    fn follow_redirect(&self, removed_headers: &[HeaderName], modified_headers: &HeaderMap, new_url: Option<&Url>) {
        self.calls.lock().push(TransportCall::Follow {
            removed: removed_headers.to_vec(),
            modified: modified_headers.clone(),
            new_url: new_url.cloned(),
        });
    }

    fn cancel(&self, error: NetError) {
        self.calls.lock().push(TransportCall::Cancel(error));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Redirect(RedirectInfo, ResponseHead),
    Response(ResponseHead),
    Data(Bytes),
    Complete(CompletionStatus),
}

#[derive(Default)]
pub struct RecordingClient {
    events: Mutex<Vec<ClientEvent>>,
}

impl RecordingClient {
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }
}

impl LoaderClient for RecordingClient {
    fn on_receive_redirect(&self, redirect: &RedirectInfo, head: &ResponseHead) {
        self.events
            .lock()
            .push(ClientEvent::Redirect(redirect.clone(), head.clone()));
    }

    fn on_receive_response(&self, head: &ResponseHead) {
        self.events.lock().push(ClientEvent::Response(head.clone()));
    }

    fn on_data(&self, chunk: Bytes) {
        self.events.lock().push(ClientEvent::Data(chunk));
    }

    fn on_complete(&self, status: &CompletionStatus) {
        self.events.lock().push(ClientEvent::Complete(*status));
    }
}
