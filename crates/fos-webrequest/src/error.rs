//! Error types for the request pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal error reported to the transport and to the original caller.
///
/// The numeric codes follow the network stack's negative error codes so
/// the embedder can surface them without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum NetError {
    /// A filter resolved the request to Cancel
    #[error("request blocked by filter")]
    BlockedByFilter,

    /// A redirect target failed validation
    #[error("unsafe redirect")]
    UnsafeRedirect,

    /// Failure reported by the real transport
    #[error("network error ({0})")]
    Network(i32),

    /// The caller tore the request down before completion
    #[error("client disconnected")]
    ClientDisconnected,

    /// A pending phase was dropped because its request was destroyed
    #[error("aborted during teardown")]
    AbortedDuringTeardown,
}

impl NetError {
    /// Numeric error code seen by the transport layer.
    pub fn code(&self) -> i32 {
        match self {
            Self::BlockedByFilter => -20,
            Self::UnsafeRedirect => -311,
            Self::Network(code) => *code,
            Self::ClientDisconnected | Self::AbortedDuringTeardown => -3,
        }
    }
}

/// Errors raised by the pipeline's own API.
#[derive(Debug, Error)]
pub enum WebRequestError {
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(String),

    #[error("Invalid header value for '{0}'")]
    InvalidHeaderValue(String),

    #[error("Unknown request: {0}")]
    UnknownRequest(u64),
}

impl WebRequestError {
    pub(crate) fn invalid_url(url: &str, source: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            source,
        }
    }
}
