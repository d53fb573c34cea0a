//! fOS Network Layer
//!
//! Protocol adapters that run real transport events through the
//! web request pipeline, plus the content blocking filter.
//!
//! Architecture:
//! 1. A transport event arrives at an adapter
//! 2. The adapter updates its `FilteredRequest` and runs a phase on the
//!    `RequestCoordinator`
//! 3. The aggregated decision is applied to the transport (block,
//!    redirect, header rewrite) and forwarded to the caller

mod config;
mod content_filter;
mod http;
mod redirect;
mod transport;
mod webtransport;
mod websocket;

#[cfg(test)]
mod testing;

pub use config::{AdapterConfig, ContentFilterConfig, RedirectPolicy};
pub use content_filter::{
    ContentBlockingFilter, ContentFilterStats, DomainRuleMatcher, MatchedRule, RuleListError, RuleMatcher, RuleQuery,
};
pub use http::{HttpRequestAdapter, HttpStage};
pub use redirect::{RedirectInfo, SchemeClass};
pub use transport::{CompletionStatus, HttpTransport, LoaderClient, RequestParams, TransportRequest};
pub use webtransport::{WebTransportAdapter, WebTransportClient, WebTransportConnector};
pub use websocket::{
    AuthChallenge, Credentials, HandshakeConnector, HandshakeRequest, WebSocketAdapter, WebSocketClient,
};
