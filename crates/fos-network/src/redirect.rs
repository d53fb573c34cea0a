//! Redirect validation and synthesis.
//!
//! A filter redirect must look exactly like a server redirect to the code
//! downstream, so the adapters fabricate a redirect response for it and
//! send it through the normal redirect path.

use crate::config::{AdapterConfig, RedirectPolicy};
use fos_webrequest::{ResponseHead, WebRequestError};
use hyper::{Method, StatusCode};
use url::Url;

/// Group of schemes a redirect may move between
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeClass {
    /// http, https
    Web,
    /// ws, wss
    Socket,
    /// data, blob, file, about, javascript
    Local,
    Other(String),
}

impl SchemeClass {
    pub fn of(url: &Url) -> Self {
        match url.scheme() {
            "http" | "https" => Self::Web,
            "ws" | "wss" => Self::Socket,
            "data" | "blob" | "file" | "about" | "javascript" => Self::Local,
            other => Self::Other(other.to_string()),
        }
    }
}

impl RedirectPolicy {
    /// Whether a request for `from` may be redirected to `to`.
    pub fn is_safe(&self, from: &Url, to: &Url) -> bool {
        if self
            .allowed_target_prefixes
            .iter()
            .any(|prefix| to.as_str().starts_with(prefix.as_str()))
        {
            return true;
        }

        let (from_class, to_class) = (SchemeClass::of(from), SchemeClass::of(to));
        if to_class == SchemeClass::Local {
            return false;
        }
        if from_class == to_class {
            return true;
        }
        self.allow_cross_scheme && from_class != SchemeClass::Local
    }
}

/// Where a redirect leads and how the follow-up request is issued
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectInfo {
    pub status: StatusCode,
    pub new_url: Url,
    pub new_method: Method,
}

impl RedirectInfo {
    /// 303 always becomes GET (except HEAD), 301/302 turn POST into GET,
    /// 307/308 keep the method.
    pub fn compute(method: &Method, status: StatusCode, new_url: Url) -> Self {
        let new_method = match status.as_u16() {
            303 if *method != Method::HEAD => Method::GET,
            301 | 302 if *method == Method::POST => Method::GET,
            _ => method.clone(),
        };
        Self {
            status,
            new_url,
            new_method,
        }
    }
}

/// Fabricated redirect response for a filter-initiated redirect.
pub fn internal_redirect(location: &Url, config: &AdapterConfig) -> Result<ResponseHead, WebRequestError> {
    let status = StatusCode::from_u16(config.internal_redirect_status)
        .unwrap_or(StatusCode::TEMPORARY_REDIRECT);
    ResponseHead::redirect(status, &config.internal_redirect_reason, location)
}
