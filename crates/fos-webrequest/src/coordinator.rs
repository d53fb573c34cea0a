//! Request Coordinator
//!
//! Dispatches each lifecycle phase to every filter in the chain and merges
//! the verdicts into one [`PhaseDecision`].
//!
//! Flow for a verdict-producing phase:
//! 1. Mark the phase signaled for the request; an already signaled phase
//!    proceeds without asking the filters again
//! 2. Register a pending phase, then ask each filter in chain order
//! 3. Synchronous verdicts are stored immediately; asynchronous filters
//!    are counted once the loop is done
//! 4. When the loop is done and every asynchronous answer is in, the
//!    verdicts are merged and the continuation runs
//!
//! No lock is held while a filter or a continuation runs, so filters may
//! answer from inside their own call and continuations may start the next
//! phase right away.

use crate::chain::FilterChain;
use crate::config::WebRequestConfig;
use crate::error::NetError;
use crate::filter::{Filter, FilterContext, Reply, Verdict};
use crate::headers;
use crate::identity::IdentityGenerator;
use crate::pending::{PendingPhase, PhaseCallback, PhaseDecision};
use crate::phase::{CompletionCode, Phase, PhaseSet};
use crate::request::{FilteredRequest, RequestId, ResponseHead};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};
use url::Url;

type PhaseKey = (RequestId, Phase);

/// Coordinator statistics
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub phases_dispatched: AtomicU64,
    pub requests_blocked: AtomicU64,
    pub redirects_issued: AtomicU64,
}

#[derive(Default)]
struct CoordinatorState {
    pending: HashMap<PhaseKey, PendingPhase>,
    signaled: HashMap<RequestId, PhaseSet>,
    identity: IdentityGenerator,
    next_token: u64,
}

struct CoordinatorInner {
    context: FilterContext,
    config: WebRequestConfig,
    chain: FilterChain,
    state: Mutex<CoordinatorState>,
    stats: CoordinatorStats,
}

/// Handle for an asynchronous answer to one phase.
///
/// Answers for a request that was destroyed in the meantime are dropped.
pub struct Responder {
    inner: Weak<CoordinatorInner>,
    key: PhaseKey,
    token: u64,
    index: usize,
}

impl Responder {
    pub fn request_id(&self) -> RequestId {
        self.key.0
    }

    pub fn phase(&self) -> Phase {
        self.key.1
    }

    pub fn respond(self, verdict: Verdict) {
        match self.inner.upgrade() {
            Some(inner) => inner.resolve(self.key, self.token, self.index, verdict),
            None => trace!("Coordinator gone, dropping {} answer", self.key.1),
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", &self.key.0)
            .field("phase", &self.key.1)
            .field("filter", &self.index)
            .finish()
    }
}

/// One coordinator per browsing context. Cloning yields another handle to
/// the same state.
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RequestCoordinator {
    pub fn new(context: FilterContext, config: WebRequestConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                context,
                config,
                chain: FilterChain::new(),
                state: Mutex::new(CoordinatorState::default()),
                stats: CoordinatorStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FilterContext::default(), WebRequestConfig::default())
    }

    pub fn chain(&self) -> &FilterChain {
        &self.inner.chain
    }

    pub fn context(&self) -> &FilterContext {
        &self.inner.context
    }

    pub fn install(&self, filter: Arc<dyn Filter>) {
        self.inner.chain.install(filter);
    }

    pub fn remove(&self, filter: &Arc<dyn Filter>) -> bool {
        self.inner.chain.remove(filter)
    }

    /// Logical id for a transport request, see [`IdentityGenerator`].
    pub fn generate_id(&self, routing_key: i32, transport_local_id: i32) -> RequestId {
        self.inner.state.lock().identity.generate(routing_key, transport_local_id)
    }

    pub fn save_id(&self, routing_key: i32, transport_local_id: i32, id: RequestId) {
        self.inner.state.lock().identity.save_id(routing_key, transport_local_id, id);
    }

    pub fn forget_id(&self, routing_key: i32, transport_local_id: i32) {
        self.inner.state.lock().identity.forget(routing_key, transport_local_id);
    }

    /// Whether any installed filter wants extra headers for `request`, so
    /// the transport must expose raw headers.
    pub fn has_extra_headers_filter(&self, request: &FilteredRequest) -> bool {
        self.inner
            .chain
            .snapshot()
            .iter()
            .any(|f| f.wants_extra_headers(request))
    }

    pub fn on_before_request<F>(&self, request: &FilteredRequest, done: F)
    where
        F: FnOnce(PhaseDecision) + Send + 'static,
    {
        self.inner.dispatch(Phase::BeforeRequest, request, None, Box::new(done));
    }

    pub fn on_before_send_headers<F>(&self, request: &FilteredRequest, done: F)
    where
        F: FnOnce(PhaseDecision) + Send + 'static,
    {
        self.inner.dispatch(Phase::BeforeSendHeaders, request, None, Box::new(done));
    }

    pub fn on_send_headers(&self, request: &FilteredRequest) {
        self.inner.notify(request, Phase::SendHeaders, |f, ctx, r| f.on_send_headers(ctx, r));
    }

    pub fn on_headers_received<F>(&self, request: &FilteredRequest, response: &ResponseHead, done: F)
    where
        F: FnOnce(PhaseDecision) + Send + 'static,
    {
        self.inner
            .dispatch(Phase::HeadersReceived, request, Some(response), Box::new(done));
    }

    /// Notify a redirect and start a new epoch: the pre-redirect phases
    /// fire again for the new URL.
    pub fn on_before_redirect(&self, request: &FilteredRequest, new_url: &Url) {
        self.clear_signaled(request.id, PhaseSet::pre_redirect());
        self.inner.notify(request, Phase::BeforeRedirect, |f, ctx, r| {
            f.on_before_redirect(ctx, r, new_url)
        });
    }

    pub fn on_response_started(&self, request: &FilteredRequest) {
        self.inner
            .notify(request, Phase::ResponseStarted, |f, ctx, r| f.on_response_started(ctx, r));
    }

    pub fn on_completed(&self, request: &FilteredRequest, code: CompletionCode) {
        self.inner
            .notify(request, Phase::Completed, |f, ctx, r| f.on_completed(ctx, r, code));
    }

    pub fn on_error_occurred(&self, request: &FilteredRequest, error: NetError) {
        self.inner
            .notify(request, Phase::ErrorOccurred, |f, ctx, r| f.on_error_occurred(ctx, r, error));
    }

    /// Allow `phases` to fire again for `id`.
    pub fn clear_signaled(&self, id: RequestId, phases: PhaseSet) {
        if let Some(set) = self.inner.state.lock().signaled.get_mut(&id) {
            set.clear(phases);
        }
    }

    /// Release everything retained for `id`. Pending phases are dropped
    /// without running their continuations; late answers become no-ops.
    ///
    /// Returns whether any phase was still awaiting filter answers.
    pub fn request_will_be_destroyed(&self, id: RequestId) -> bool {
        let dropped: Vec<PendingPhase> = {
            let mut state = self.inner.state.lock();
            state.signaled.remove(&id);
            Phase::ALL
                .iter()
                .filter_map(|phase| state.pending.remove(&(id, *phase)))
                .collect()
        };

        for pending in &dropped {
            debug!(
                "{} destroyed with {} filter answer(s) outstanding: {}",
                id,
                pending.outstanding(),
                NetError::AbortedDuringTeardown
            );
        }
        !dropped.is_empty()
    }

    /// Whether a phase of `id` is still awaiting filter answers
    pub fn has_pending_phase(&self, id: RequestId) -> bool {
        self.inner.state.lock().pending.keys().any(|(rid, _)| *rid == id)
    }

    /// Number of phases awaiting filter answers
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether any state is retained for `id`
    pub fn is_tracking(&self, id: RequestId) -> bool {
        let state = self.inner.state.lock();
        state.signaled.contains_key(&id) || state.pending.keys().any(|(rid, _)| *rid == id)
    }

    /// Get statistics: (phases dispatched, requests blocked, redirects issued)
    pub fn stats(&self) -> (u64, u64, u64) {
        let stats = &self.inner.stats;
        (
            stats.phases_dispatched.load(Ordering::Relaxed),
            stats.requests_blocked.load(Ordering::Relaxed),
            stats.redirects_issued.load(Ordering::Relaxed),
        )
    }
}

/// Request (and response) as shown to filters that do not want extra
/// headers
struct StrippedView {
    request: FilteredRequest,
    response: Option<ResponseHead>,
}

impl CoordinatorInner {
    fn dispatch(
        self: &Arc<Self>,
        phase: Phase,
        request: &FilteredRequest,
        response: Option<&ResponseHead>,
        done: PhaseCallback,
    ) {
        let key = (request.id, phase);
        let filters = self.chain.snapshot();

        let token = {
            let mut state = self.state.lock();
            if !state.signaled.entry(request.id).or_default().insert(phase) {
                drop(state);
                debug!("{} already signaled for {}, proceeding", phase, request.id);
                done(PhaseDecision::proceed(request.id, phase));
                return;
            }
            state.next_token += 1;
            let token = state.next_token;
            state.pending.insert(
                key,
                PendingPhase::new(
                    token,
                    request.id,
                    phase,
                    filters.len(),
                    request.headers.clone(),
                    response.cloned(),
                    done,
                ),
            );
            token
        };

        self.stats.phases_dispatched.fetch_add(1, Ordering::Relaxed);
        trace!("Dispatching {} for {} to {} filter(s)", phase, request.id, filters.len());

        let mut stripped: Option<StrippedView> = None;
        let mut dispatched = 0;

        for (index, filter) in filters.iter().enumerate() {
            let responder = Responder {
                inner: Arc::downgrade(self),
                key,
                token,
                index,
            };

            let (view, view_response) = if self.config.strip_extra_headers
                && !filter.wants_extra_headers(request)
            {
                let view = stripped.get_or_insert_with(|| self.strip(request, response));
                (&view.request, view.response.as_ref())
            } else {
                (request, response)
            };

            let reply = match (phase, view_response) {
                (Phase::BeforeRequest, _) => filter.on_before_request(&self.context, view, responder),
                (Phase::BeforeSendHeaders, _) => {
                    filter.on_before_send_headers(&self.context, view, responder)
                }
                (Phase::HeadersReceived, Some(head)) => {
                    filter.on_headers_received(&self.context, view, head, responder)
                }
                _ => Reply::Ready(Verdict::allow()),
            };

            let mut state = self.state.lock();
            let Some(pending) = state.pending.get_mut(&key).filter(|p| p.token == token) else {
                debug!("{} torn down during {} dispatch", request.id, phase);
                return;
            };
            match reply {
                Reply::Ready(verdict) => {
                    if !pending.record_ready(index, verdict) {
                        // Already answered through the responder, which
                        // counted as resolved.
                        dispatched += 1;
                    }
                }
                Reply::Pending => dispatched += 1,
            }
        }

        let finished = {
            let mut state = self.state.lock();
            match state.pending.get_mut(&key) {
                Some(pending) if pending.token == token => {
                    pending.finish_dispatch(dispatched);
                    if pending.is_complete() {
                        state.pending.remove(&key)
                    } else {
                        trace!("{} for {} awaits {} filter(s)", phase, request.id, pending.outstanding());
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(pending) = finished {
            self.complete(pending);
        }
    }

    fn resolve(&self, key: PhaseKey, token: u64, index: usize, verdict: Verdict) {
        let finished = {
            let mut state = self.state.lock();
            match state.pending.get_mut(&key) {
                Some(pending) if pending.token == token => {
                    pending.record_async(index, verdict);
                    if pending.is_complete() {
                        state.pending.remove(&key)
                    } else {
                        None
                    }
                }
                _ => {
                    trace!("Late {} answer for {} ignored", key.1, key.0);
                    None
                }
            }
        };

        if let Some(pending) = finished {
            self.complete(pending);
        }
    }

    fn complete(&self, mut pending: PendingPhase) {
        let decision = pending.aggregate();

        if decision.is_blocked() {
            self.stats.requests_blocked.fetch_add(1, Ordering::Relaxed);
            debug!("{} blocked in {}", decision.request_id, decision.phase);
        }
        if let Some(url) = &decision.redirect_url {
            self.stats.redirects_issued.fetch_add(1, Ordering::Relaxed);
            debug!("{} redirected in {} to {}", decision.request_id, decision.phase, url);
        }

        match pending.take_completion() {
            Some(done) => done(decision),
            None => warn!("{} for {} completed twice", decision.phase, decision.request_id),
        }
    }

    fn notify<F>(&self, request: &FilteredRequest, phase: Phase, call: F)
    where
        F: Fn(&dyn Filter, &FilterContext, &FilteredRequest),
    {
        if phase != Phase::BeforeRedirect {
            let mut state = self.state.lock();
            if !state.signaled.entry(request.id).or_default().insert(phase) {
                trace!("{} already signaled for {}", phase, request.id);
                return;
            }
        }

        self.stats.phases_dispatched.fetch_add(1, Ordering::Relaxed);
        let filters = self.chain.snapshot();
        let mut stripped: Option<StrippedView> = None;

        for filter in filters.iter() {
            let view = if self.config.strip_extra_headers && !filter.wants_extra_headers(request) {
                &stripped
                    .get_or_insert_with(|| self.strip(request, None))
                    .request
            } else {
                request
            };
            call(filter.as_ref(), &self.context, view);
        }
    }

    fn strip(&self, request: &FilteredRequest, response: Option<&ResponseHead>) -> StrippedView {
        let mut view = request.clone();
        view.headers = headers::strip_extra(&request.headers, &self.config);
        if let Some(head) = view.response_head.as_mut() {
            head.headers = headers::strip_extra(&head.headers, &self.config);
        }
        let response = response.map(|head| {
            let mut head = head.clone();
            head.headers = headers::strip_extra(&head.headers, &self.config);
            head
        });
        StrippedView { request: view, response }
    }
}
