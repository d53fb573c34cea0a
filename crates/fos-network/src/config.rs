//! Adapter and filter configuration.

use serde::{Deserialize, Serialize};

/// Which redirect targets the adapters honor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectPolicy {
    /// URL prefixes that are always safe targets, e.g. an extension's
    /// resource origin
    pub allowed_target_prefixes: Vec<String>,
    /// Allow redirects between scheme classes (web <-> socket). Local
    /// schemes still need an allow-listed prefix.
    pub allow_cross_scheme: bool,
}

/// Protocol adapter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub redirect_policy: RedirectPolicy,
    /// Reason phrase of redirects synthesized for filter redirects
    pub internal_redirect_reason: String,
    /// Status code of redirects synthesized for filter redirects
    pub internal_redirect_status: u16,
    /// Filter redirects a socket handshake may take before it fails
    pub max_socket_redirects: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            redirect_policy: RedirectPolicy::default(),
            internal_redirect_reason: "Internal Redirect".to_string(),
            internal_redirect_status: 307,
            max_socket_redirects: 20,
        }
    }
}

/// Content blocking filter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFilterConfig {
    /// Order within the content blocking bucket
    pub priority: i32,
    /// Ask callers to collapse blocked images, media and frames
    pub collapse_blocked: bool,
    /// Let an allow rule override cancels from other filters
    pub prevent_cancel_on_allow_rule: bool,
    /// Document hosts (and their subdomains) where generic block rules
    /// do not apply
    pub generic_block_exempt_hosts: Vec<String>,
}

impl Default for ContentFilterConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            collapse_blocked: true,
            prevent_cancel_on_allow_rule: false,
            generic_block_exempt_hosts: Vec::new(),
        }
    }
}
