//! Coordinator configuration.

use serde::{Deserialize, Serialize};

/// Headers hidden from filters that do not ask for extra headers.
const DEFAULT_EXTRA_HEADERS: &[&str] = &[
    "accept-encoding",
    "accept-language",
    "cookie",
    "referer",
    "set-cookie",
];

/// Request coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRequestConfig {
    /// Strip `extra_headers` from the view handed to filters that do not
    /// want them
    pub strip_extra_headers: bool,

    /// Header names (case-insensitive) treated as extra headers
    pub extra_headers: Vec<String>,
}

impl Default for WebRequestConfig {
    fn default() -> Self {
        Self {
            strip_extra_headers: true,
            extra_headers: DEFAULT_EXTRA_HEADERS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl WebRequestConfig {
    /// Check whether a header name is one of the configured extra headers.
    pub fn is_extra_header(&self, name: &str) -> bool {
        self.extra_headers.iter().any(|h| h.eq_ignore_ascii_case(name))
    }
}
