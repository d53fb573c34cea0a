//! Scatter/gather bookkeeping for one in-flight phase of one request.
//!
//! Verdicts are stored per filter index and merged in chain order when
//! the last answer arrives, so the result never depends on the order in
//! which asynchronous filters call back.

use crate::error::NetError;
use crate::filter::{Decision, Verdict};
use crate::headers::{self, HeaderDelta};
use crate::phase::Phase;
use crate::request::{RequestId, ResponseHead};
use hyper::StatusCode;
use hyper::header::{HeaderMap, HeaderValue, LOCATION};
use tracing::{trace, warn};
use url::Url;

/// Continuation invoked exactly once with the aggregated decision
pub type PhaseCallback = Box<dyn FnOnce(PhaseDecision) + Send>;

/// Resolved cancel decision of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Proceed,
    Block {
        /// Suppress layout space for the blocked resource
        collapse: bool,
    },
}

/// Aggregate of every filter's verdict for one phase
#[derive(Debug, Clone)]
pub struct PhaseDecision {
    pub request_id: RequestId,
    pub phase: Phase,
    pub outcome: Outcome,
    /// Winning redirect target, only when the request proceeds
    pub redirect_url: Option<Url>,
    /// Net request header change (before-send-headers phase)
    pub request_headers: Option<HeaderDelta>,
    /// Effective response head when filters changed it (headers-received
    /// phase); a redirect turns it into a `302 Found`
    pub response: Option<ResponseHead>,
}

impl PhaseDecision {
    pub fn proceed(request_id: RequestId, phase: Phase) -> Self {
        Self {
            request_id,
            phase,
            outcome: Outcome::Proceed,
            redirect_url: None,
            request_headers: None,
            response: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.outcome, Outcome::Block { .. })
    }

    /// Error to surface when the phase blocked the request
    pub fn error(&self) -> Option<NetError> {
        self.is_blocked().then_some(NetError::BlockedByFilter)
    }
}

pub(crate) struct PendingPhase {
    pub(crate) token: u64,
    request_id: RequestId,
    phase: Phase,
    slots: Vec<Option<Verdict>>,
    /// Filters that answered `Reply::Pending`, counted after the loop
    dispatched: usize,
    /// Asynchronous answers received so far
    resolved: usize,
    dispatch_done: bool,
    request_headers: HeaderMap,
    response: Option<ResponseHead>,
    completion: Option<PhaseCallback>,
}

impl PendingPhase {
    pub(crate) fn new(
        token: u64,
        request_id: RequestId,
        phase: Phase,
        filter_count: usize,
        request_headers: HeaderMap,
        response: Option<ResponseHead>,
        completion: PhaseCallback,
    ) -> Self {
        Self {
            token,
            request_id,
            phase,
            slots: vec![None; filter_count],
            dispatched: 0,
            resolved: 0,
            dispatch_done: false,
            request_headers,
            response,
            completion: Some(completion),
        }
    }

    /// Store a synchronous verdict. Returns false if the filter already
    /// answered through its responder; that answer stands.
    pub(crate) fn record_ready(&mut self, index: usize, verdict: Verdict) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(verdict);
                true
            }
            _ => false,
        }
    }

    /// Store an asynchronous verdict. Duplicate answers are ignored.
    pub(crate) fn record_async(&mut self, index: usize, verdict: Verdict) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(verdict);
                self.resolved += 1;
                true
            }
            _ => {
                warn!(
                    "Ignoring duplicate {} answer from filter #{} for {}",
                    self.phase, index, self.request_id
                );
                false
            }
        }
    }

    pub(crate) fn finish_dispatch(&mut self, dispatched: usize) {
        self.dispatched += dispatched;
        self.dispatch_done = true;
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.dispatch_done && self.dispatched == self.resolved
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.dispatched.saturating_sub(self.resolved)
    }

    pub(crate) fn take_completion(&mut self) -> Option<PhaseCallback> {
        self.completion.take()
    }

    fn answers(&self) -> impl Iterator<Item = (usize, &Verdict)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|v| (index, v)))
    }

    pub(crate) fn aggregate(&self) -> PhaseDecision {
        let mut decision = Decision::Allow;
        let mut collapse = false;
        let mut redirect: Option<(usize, &Url)> = None;

        for (index, verdict) in self.answers() {
            if verdict.decision > decision {
                decision = verdict.decision;
                if decision == Decision::Cancel {
                    collapse = verdict.collapse;
                }
            }

            let Some(url) = verdict.redirect_url.as_ref() else {
                continue;
            };
            if !self.phase.allows_redirect() {
                trace!("{} ignores redirect from filter #{}", self.phase, index);
                continue;
            }
            let outranks = redirect.is_none_or(|(rank, _)| index >= rank);
            if outranks && decision == Decision::Allow {
                redirect = Some((index, url));
            }
        }

        let mut result = PhaseDecision::proceed(self.request_id, self.phase);
        if decision == Decision::Cancel {
            result.outcome = Outcome::Block { collapse };
            return result;
        }

        result.redirect_url = redirect.map(|(_, url)| url.clone());

        let changes = self
            .answers()
            .filter_map(|(_, verdict)| verdict.header_changes.as_ref());

        match self.phase {
            Phase::BeforeSendHeaders => {
                let after = headers::replay(&self.request_headers, changes);
                result.request_headers = Some(HeaderDelta::between(&self.request_headers, &after));
            }
            Phase::HeadersReceived => {
                if let Some(original) = &self.response {
                    let mut head = original.clone();
                    head.headers = headers::replay(&original.headers, changes);
                    if let Some(url) = &result.redirect_url {
                        force_redirect(&mut head, url);
                    }
                    if head != *original {
                        result.response = Some(head);
                    }
                }
            }
            _ => {}
        }

        result
    }
}

/// Make `head` look like a server redirect to `url`.
fn force_redirect(head: &mut ResponseHead, url: &Url) {
    match HeaderValue::from_str(url.as_str()) {
        Ok(location) => {
            head.status = StatusCode::FOUND;
            head.reason = Some("Found".to_string());
            head.headers.insert(LOCATION, location);
        }
        Err(_) => warn!("Redirect target is not a valid Location: {}", url),
    }
}
