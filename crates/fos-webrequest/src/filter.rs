//! The filter contract.
//!
//! A filter votes on every phase of every request. Verdict-producing
//! phases may be answered right away with [`Reply::Ready`], or later
//! through the [`Responder`] after returning [`Reply::Pending`].

use crate::coordinator::Responder;
use crate::error::NetError;
use crate::headers::HeaderChanges;
use crate::phase::CompletionCode;
use crate::request::{FilteredRequest, ResponseHead};
use serde::{Deserialize, Serialize};
use url::Url;

/// Coarse ordering bucket. Filters run ordered by `(kind, priority)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    /// Built into the embedder
    Embedder,
    /// Ad and tracker blocking
    ContentBlocking,
    /// Installed by extensions
    Extension,
}

/// Cancel decision, ordered `Allow < Cancel < PreventCancel`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Decision {
    #[default]
    Allow,
    Cancel,
    /// Forces the request through even if another filter cancels it.
    /// Only filters entitled to override blocking may use it.
    PreventCancel,
}

/// One filter's answer for one phase
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    /// Ask the caller to suppress layout space for a blocked resource
    pub collapse: bool,
    pub redirect_url: Option<Url>,
    pub header_changes: Option<HeaderChanges>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn cancel() -> Self {
        Self {
            decision: Decision::Cancel,
            ..Self::default()
        }
    }

    pub fn prevent_cancel() -> Self {
        Self {
            decision: Decision::PreventCancel,
            ..Self::default()
        }
    }

    pub fn redirect(url: Url) -> Self {
        Self {
            redirect_url: Some(url),
            ..Self::default()
        }
    }

    pub fn headers(changes: HeaderChanges) -> Self {
        Self {
            header_changes: Some(changes),
            ..Self::default()
        }
    }

    pub fn collapsed(mut self, collapse: bool) -> Self {
        self.collapse = collapse;
        self
    }

    pub fn with_headers(mut self, changes: HeaderChanges) -> Self {
        self.header_changes = Some(changes);
        self
    }
}

/// How a filter answered a verdict-producing phase
#[derive(Debug)]
pub enum Reply {
    /// Answered synchronously; the responder may be dropped
    Ready(Verdict),
    /// The filter kept the responder and will answer through it
    Pending,
}

/// Browsing-context information handed to every filter call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterContext {
    /// Opaque id of the browsing context (profile)
    pub browser_context_id: u64,
    pub off_the_record: bool,
}

/// A pluggable unit that votes on whether and how requests proceed.
///
/// Phases a filter does not care about fall back to no-op defaults.
pub trait Filter: Send + Sync {
    fn kind(&self) -> FilterKind;

    /// Fine-grained order within `kind`; lower runs first
    fn priority(&self) -> i32;

    fn name(&self) -> &str {
        "filter"
    }

    /// Whether this filter must see extra headers (cookies, referrer, ...)
    fn wants_extra_headers(&self, _request: &FilteredRequest) -> bool {
        false
    }

    fn on_before_request(
        &self,
        _ctx: &FilterContext,
        _request: &FilteredRequest,
        _responder: Responder,
    ) -> Reply {
        Reply::Ready(Verdict::allow())
    }

    fn on_before_send_headers(
        &self,
        _ctx: &FilterContext,
        _request: &FilteredRequest,
        _responder: Responder,
    ) -> Reply {
        Reply::Ready(Verdict::allow())
    }

    fn on_send_headers(&self, _ctx: &FilterContext, _request: &FilteredRequest) {}

    fn on_headers_received(
        &self,
        _ctx: &FilterContext,
        _request: &FilteredRequest,
        _response: &ResponseHead,
        _responder: Responder,
    ) -> Reply {
        Reply::Ready(Verdict::allow())
    }

    fn on_before_redirect(&self, _ctx: &FilterContext, _request: &FilteredRequest, _new_url: &Url) {}

    fn on_response_started(&self, _ctx: &FilterContext, _request: &FilteredRequest) {}

    fn on_completed(&self, _ctx: &FilterContext, _request: &FilteredRequest, _code: CompletionCode) {}

    fn on_error_occurred(&self, _ctx: &FilterContext, _request: &FilteredRequest, _error: NetError) {}
}
