//! Content Blocking Filter
//!
//! Filter that asks a rule matcher about every request and turns the
//! matched rule into a verdict.
//!
//! Flow:
//! 1. onBeforeRequest builds a [`RuleQuery`] (document origin, resource
//!    type, third-party flag, generic-block exemption)
//! 2. Allow rules allow, redirect rules redirect, block rules cancel
//! 3. onHeadersReceived appends the rule's CSP policy to document
//!    responses
//!
//! [`DomainRuleMatcher`] understands the domain subset of the EasyList
//! format:
//! - Domain blocking: ||example.com^
//! - Exception rules: @@||allowed.com^
//! - Options: $third-party,image,domain=site.com|other.com,redirect=URL,csp=POLICY

use crate::config::ContentFilterConfig;
use fos_webrequest::{
    Destination, Filter, FilterContext, FilterKind, FilteredRequest, HeaderChanges, Reply, Responder, ResponseHead,
    Verdict,
};
use hyper::header::{HeaderValue, CONTENT_SECURITY_POLICY};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use url::{Origin, Url};

/// Errors while loading a rule list
#[derive(Debug, Error)]
pub enum RuleListError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid rule format: {0}")]
    InvalidRule(String),

    #[error("Unknown rule option '{option}' in {rule}")]
    UnknownOption { rule: String, option: String },

    #[error("Invalid redirect target in {rule}")]
    InvalidRedirect {
        rule: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Empty rule list")]
    EmptyList,
}

/// What a rule matcher is asked about one request
#[derive(Debug, Clone)]
pub struct RuleQuery<'a> {
    pub url: &'a Url,
    /// Host of the document that issued the request
    pub document_host: Option<&'a str>,
    pub destination: Destination,
    /// Request goes to another site than its document
    pub third_party: bool,
    /// Generic block rules are disabled for the document
    pub generic_block_exempt: bool,
}

/// The part of a matched rule a filter acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRule {
    pub is_allow: bool,
    pub redirect_target: Option<Url>,
    pub csp_policy: Option<String>,
}

impl MatchedRule {
    /// A plain blocking rule
    pub fn is_block(&self) -> bool {
        !self.is_allow && self.redirect_target.is_none() && self.csp_policy.is_none()
    }
}

/// Rule engine consulted by [`ContentBlockingFilter`]
pub trait RuleMatcher: Send + Sync {
    fn match_request(&self, query: &RuleQuery<'_>) -> Option<MatchedRule>;
}

#[derive(Debug, Clone, PartialEq)]
struct DomainRule {
    is_allow: bool,
    third_party_only: bool,
    /// Empty: every resource type
    destinations: Vec<Destination>,
    /// Empty: a generic rule
    document_domains: Vec<String>,
    redirect_target: Option<Url>,
    csp_policy: Option<String>,
}

impl DomainRule {
    fn is_generic(&self) -> bool {
        self.document_domains.is_empty()
    }

    fn applies(&self, query: &RuleQuery<'_>) -> bool {
        if self.third_party_only && !query.third_party {
            return false;
        }
        if !self.destinations.is_empty() && !self.destinations.contains(&query.destination) {
            return false;
        }
        if !self.is_generic() {
            let Some(document) = query.document_host else {
                return false;
            };
            if !self.document_domains.iter().any(|d| host_matches(document, d)) {
                return false;
            }
        }
        if self.is_generic() && !self.is_allow && query.generic_block_exempt {
            return false;
        }
        true
    }

    /// Allow beats redirect beats block beats CSP
    fn rank(&self) -> u8 {
        if self.is_allow {
            3
        } else if self.redirect_target.is_some() {
            2
        } else if self.csp_policy.is_none() {
            1
        } else {
            0
        }
    }
}

/// Rule matcher indexed by domain; a rule for `example.com` also covers
/// its subdomains.
#[derive(Debug, Default)]
pub struct DomainRuleMatcher {
    rules: HashMap<String, Vec<DomainRule>>,
    rule_count: usize,
}

impl DomainRuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a rule list from a reader
    pub fn parse<R: Read>(reader: R) -> Result<Self, RuleListError> {
        let mut matcher = Self::new();
        let mut line_count = 0;

        for line in BufReader::new(reader).lines() {
            let line = line?;
            line_count += 1;
            matcher.add_rule(&line)?;
        }

        if matcher.rule_count == 0 {
            return Err(RuleListError::EmptyList);
        }

        info!(
            "Parsed rule list: {} lines, {} rules, {} domains",
            line_count,
            matcher.rule_count,
            matcher.rules.len()
        );
        Ok(matcher)
    }

    /// Add one rule line. Returns false for blank lines and comments.
    pub fn add_rule(&mut self, line: &str) -> Result<bool, RuleListError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('[') {
            return Ok(false);
        }

        let (is_allow, body) = match trimmed.strip_prefix("@@") {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (pattern, options) = match body.split_once('$') {
            Some((pattern, options)) => (pattern, Some(options)),
            None => (body, None),
        };

        let domain = pattern
            .strip_prefix("||")
            .map(|p| p.trim_end_matches('^').trim_end_matches('/'))
            .filter(|d| !d.is_empty() && !d.contains(['/', '*', '^']))
            .ok_or_else(|| RuleListError::InvalidRule(trimmed.to_string()))?
            .to_ascii_lowercase();

        let mut rule = DomainRule {
            is_allow,
            third_party_only: false,
            destinations: Vec::new(),
            document_domains: Vec::new(),
            redirect_target: None,
            csp_policy: None,
        };
        if let Some(options) = options {
            Self::parse_options(trimmed, options, &mut rule)?;
        }

        trace!("Rule for {}: {:?}", domain, rule);
        self.rules.entry(domain).or_default().push(rule);
        self.rule_count += 1;
        Ok(true)
    }

    fn parse_options(raw: &str, options: &str, rule: &mut DomainRule) -> Result<(), RuleListError> {
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (option, None),
            };

            match (name, value) {
                ("third-party", None) => rule.third_party_only = true,
                ("domain", Some(domains)) => rule
                    .document_domains
                    .extend(domains.split('|').map(|d| d.trim().to_ascii_lowercase())),
                ("redirect", Some(target)) => {
                    let url = Url::parse(target).map_err(|source| RuleListError::InvalidRedirect {
                        rule: raw.to_string(),
                        source,
                    })?;
                    rule.redirect_target = Some(url);
                }
                ("csp", Some(policy)) => rule.csp_policy = Some(policy.to_string()),
                (name, None) => match destination_option(name) {
                    Some(destination) => rule.destinations.push(destination),
                    None => {
                        return Err(RuleListError::UnknownOption {
                            rule: raw.to_string(),
                            option: name.to_string(),
                        });
                    }
                },
                (name, Some(_)) => {
                    return Err(RuleListError::UnknownOption {
                        rule: raw.to_string(),
                        option: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rule_count
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }
}

impl RuleMatcher for DomainRuleMatcher {
    fn match_request(&self, query: &RuleQuery<'_>) -> Option<MatchedRule> {
        let host = query.url.host_str()?.to_ascii_lowercase();

        // Walk parent domains: a.b.example.com, b.example.com, example.com, com
        let mut candidate = host.as_str();
        let mut best: Option<&DomainRule> = None;
        loop {
            if let Some(rules) = self.rules.get(candidate) {
                for rule in rules.iter().filter(|r| r.applies(query)) {
                    if best.is_none_or(|b| rule.rank() > b.rank()) {
                        best = Some(rule);
                    }
                }
            }
            match candidate.split_once('.') {
                Some((_, parent)) => candidate = parent,
                None => break,
            }
        }

        best.map(|rule| MatchedRule {
            is_allow: rule.is_allow,
            redirect_target: rule.redirect_target.clone(),
            csp_policy: rule.csp_policy.clone(),
        })
    }
}

fn destination_option(name: &str) -> Option<Destination> {
    Some(match name {
        "document" => Destination::Document,
        "subdocument" => Destination::SubFrame,
        "stylesheet" => Destination::Stylesheet,
        "script" => Destination::Script,
        "image" => Destination::Image,
        "font" => Destination::Font,
        "xmlhttprequest" => Destination::XmlHttpRequest,
        "media" => Destination::Media,
        "websocket" => Destination::WebSocket,
        "webtransport" => Destination::WebTransport,
        "other" => Destination::Other,
        _ => return None,
    })
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|rest| rest.ends_with('.'))
}

/// Last two labels of a host, standing in for its registrable domain
fn site_of(host: &str) -> &str {
    let mut dots = host.rmatch_indices('.');
    dots.next();
    match dots.next() {
        Some((index, _)) => &host[index + 1..],
        None => host,
    }
}

/// Content filter statistics
#[derive(Debug, Default)]
pub struct ContentFilterStats {
    pub checked_requests: AtomicU64,
    pub blocked_requests: AtomicU64,
    pub redirected_requests: AtomicU64,
    pub csp_injections: AtomicU64,
}

/// Ad/tracker blocking filter backed by a [`RuleMatcher`]
pub struct ContentBlockingFilter {
    matcher: Arc<dyn RuleMatcher>,
    config: ContentFilterConfig,
    stats: ContentFilterStats,
}

impl ContentBlockingFilter {
    pub fn new(matcher: Arc<dyn RuleMatcher>, config: ContentFilterConfig) -> Self {
        Self {
            matcher,
            config,
            stats: ContentFilterStats::default(),
        }
    }

    /// Get statistics: (checked, blocked, redirected)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.checked_requests.load(Ordering::Relaxed),
            self.stats.blocked_requests.load(Ordering::Relaxed),
            self.stats.redirected_requests.load(Ordering::Relaxed),
        )
    }

    pub fn csp_injections(&self) -> u64 {
        self.stats.csp_injections.load(Ordering::Relaxed)
    }

    fn lookup(&self, request: &FilteredRequest) -> Option<MatchedRule> {
        let initiator_host = request.initiator.as_ref().and_then(|origin| match origin {
            Origin::Tuple(_, host, _) => Some(host.to_string()),
            Origin::Opaque(_) => None,
        });
        // A top-level document is its own document.
        let document_host: Option<&str> = match (&initiator_host, request.destination) {
            (Some(host), _) => Some(host.as_str()),
            (None, Destination::Document) => request.host(),
            (None, _) => None,
        };

        let third_party = match (document_host, request.host()) {
            (Some(document), Some(host)) => site_of(document) != site_of(host),
            _ => false,
        };
        let generic_block_exempt = document_host.is_some_and(|document| {
            self.config
                .generic_block_exempt_hosts
                .iter()
                .any(|exempt| host_matches(document, exempt))
        });

        self.matcher.match_request(&RuleQuery {
            url: &request.url,
            document_host,
            destination: request.destination,
            third_party,
            generic_block_exempt,
        })
    }

    fn collapses(&self, destination: Destination) -> bool {
        self.config.collapse_blocked
            && matches!(destination, Destination::Image | Destination::Media | Destination::SubFrame)
    }
}

impl Filter for ContentBlockingFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::ContentBlocking
    }

    fn priority(&self) -> i32 {
        self.config.priority
    }

    fn name(&self) -> &str {
        "content-blocking"
    }

    fn on_before_request(&self, _ctx: &FilterContext, request: &FilteredRequest, _responder: Responder) -> Reply {
        self.stats.checked_requests.fetch_add(1, Ordering::Relaxed);

        let Some(rule) = self.lookup(request) else {
            return Reply::Ready(Verdict::allow());
        };

        let verdict = if rule.is_allow {
            trace!("Allow rule for {}", request.url);
            if self.config.prevent_cancel_on_allow_rule {
                Verdict::prevent_cancel()
            } else {
                Verdict::allow()
            }
        } else if let Some(target) = rule.redirect_target {
            self.stats.redirected_requests.fetch_add(1, Ordering::Relaxed);
            debug!("Redirecting {} to {}", request.url, target);
            Verdict::redirect(target)
        } else if rule.csp_policy.is_some() {
            Verdict::allow()
        } else {
            self.stats.blocked_requests.fetch_add(1, Ordering::Relaxed);
            debug!("Blocked {} ({:?})", request.url, request.destination);
            Verdict::cancel().collapsed(self.collapses(request.destination))
        };
        Reply::Ready(verdict)
    }

    fn on_headers_received(
        &self,
        _ctx: &FilterContext,
        request: &FilteredRequest,
        response: &ResponseHead,
        _responder: Responder,
    ) -> Reply {
        if !request.destination.is_frame() {
            return Reply::Ready(Verdict::allow());
        }
        let Some(policy) = self.lookup(request).and_then(|rule| rule.csp_policy) else {
            return Reply::Ready(Verdict::allow());
        };
        let value = match HeaderValue::from_str(&policy) {
            Ok(value) => value,
            Err(_) => {
                warn!("CSP policy for {} is not a valid header value", request.url);
                return Reply::Ready(Verdict::allow());
            }
        };

        let mut changes = HeaderChanges::new();
        for existing in response.headers.get_all(CONTENT_SECURITY_POLICY) {
            changes = changes.set_header(CONTENT_SECURITY_POLICY, existing.clone());
        }
        changes = changes.set_header(CONTENT_SECURITY_POLICY, value);

        self.stats.csp_injections.fetch_add(1, Ordering::Relaxed);
        debug!("Adding CSP to {}: {}", request.url, policy);
        Reply::Ready(Verdict::headers(changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingFilter;
    use fos_webrequest::{Outcome, PhaseDecision, RequestCoordinator, RequestId};
    use hyper::StatusCode;
    use parking_lot::Mutex;

    const RULES: &str = "\
[Adblock Plus 2.0]
! Test list
||ads.test^
||tracker.test^$third-party
||pixels.test^$image
@@||ok.ads.test^
||news.test^$csp=script-src 'self'
||cdn.test^$script,redirect=https://local.test/noop.js
||widgets.test^$domain=blog.test
";

    fn matcher() -> DomainRuleMatcher {
        DomainRuleMatcher::parse(RULES.as_bytes()).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn query<'a>(target: &'a Url, document: Option<&'a str>, destination: Destination) -> RuleQuery<'a> {
        RuleQuery {
            url: target,
            document_host: document,
            destination,
            third_party: true,
            generic_block_exempt: false,
        }
    }

    #[test]
    fn test_parse_rule_list() {
        let matcher = matcher();
        assert_eq!(matcher.len(), 7);
        assert!(!matcher.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            DomainRuleMatcher::parse("! only comments\n".as_bytes()),
            Err(RuleListError::EmptyList)
        ));
        assert!(matches!(
            DomainRuleMatcher::new().add_rule("/banner/*"),
            Err(RuleListError::InvalidRule(_))
        ));
        assert!(matches!(
            DomainRuleMatcher::new().add_rule("||ads.test^$popunder"),
            Err(RuleListError::UnknownOption { .. })
        ));
        assert!(matches!(
            DomainRuleMatcher::new().add_rule("||ads.test^$redirect=noop.js"),
            Err(RuleListError::InvalidRedirect { .. })
        ));
    }

    #[test]
    fn test_parent_domain_match() {
        let matcher = matcher();
        let target = url("https://a.b.ads.test/banner.png");

        let rule = matcher
            .match_request(&query(&target, Some("site.test"), Destination::Image))
            .unwrap();
        assert!(rule.is_block());

        let safe = url("https://notads.test/");
        assert!(matcher
            .match_request(&query(&safe, Some("site.test"), Destination::Image))
            .is_none());
    }

    #[test]
    fn test_exception_beats_block() {
        let target = url("https://ok.ads.test/logo.png");
        let rule = matcher()
            .match_request(&query(&target, Some("site.test"), Destination::Image))
            .unwrap();
        assert!(rule.is_allow);
    }

    #[test]
    fn test_option_restrictions() {
        let matcher = matcher();

        let tracker = url("https://tracker.test/t.js");
        let mut first_party = query(&tracker, Some("tracker.test"), Destination::Script);
        first_party.third_party = false;
        assert!(matcher.match_request(&first_party).is_none());
        assert!(matcher
            .match_request(&query(&tracker, Some("site.test"), Destination::Script))
            .is_some());

        let pixel = url("https://pixels.test/p");
        assert!(matcher
            .match_request(&query(&pixel, Some("site.test"), Destination::Script))
            .is_none());
        assert!(matcher
            .match_request(&query(&pixel, Some("site.test"), Destination::Image))
            .is_some());

        let widget = url("https://widgets.test/w.js");
        assert!(matcher
            .match_request(&query(&widget, Some("www.blog.test"), Destination::Script))
            .is_some());
        assert!(matcher
            .match_request(&query(&widget, Some("shop.test"), Destination::Script))
            .is_none());
    }

    #[test]
    fn test_generic_block_exemption() {
        let matcher = matcher();
        let target = url("https://ads.test/banner.png");
        let widget = url("https://widgets.test/w.js");

        let mut exempt = query(&target, Some("blog.test"), Destination::Image);
        exempt.generic_block_exempt = true;
        assert!(matcher.match_request(&exempt).is_none());

        // Domain-specific rules still apply.
        let mut specific = query(&widget, Some("blog.test"), Destination::Script);
        specific.generic_block_exempt = true;
        assert!(matcher.match_request(&specific).is_some());
    }

    #[test]
    fn test_site_of() {
        assert_eq!(site_of("a.b.example.com"), "example.com");
        assert_eq!(site_of("example.com"), "example.com");
        assert_eq!(site_of("localhost"), "localhost");
    }

    fn coordinator_with(config: ContentFilterConfig) -> (RequestCoordinator, Arc<ContentBlockingFilter>) {
        let coordinator = RequestCoordinator::with_defaults();
        let filter = Arc::new(ContentBlockingFilter::new(Arc::new(matcher()), config));
        coordinator.install(filter.clone());
        (coordinator, filter)
    }

    fn request(id: u64, target: &str, destination: Destination) -> FilteredRequest {
        FilteredRequest::new(RequestId(id), url(target), destination)
            .with_initiator(url("https://site.test/").origin())
    }

    fn decide(coordinator: &RequestCoordinator, request: &FilteredRequest) -> PhaseDecision {
        let out = Arc::new(Mutex::new(None));
        let slot = out.clone();
        coordinator.on_before_request(request, move |decision| *slot.lock() = Some(decision));
        let decision = out.lock().take();
        decision.unwrap()
    }

    #[test]
    fn test_blocked_image_collapses() {
        let (coordinator, filter) = coordinator_with(ContentFilterConfig::default());

        let image = decide(&coordinator, &request(1, "https://ads.test/b.png", Destination::Image));
        assert_eq!(image.outcome, Outcome::Block { collapse: true });

        let script = decide(&coordinator, &request(2, "https://ads.test/b.js", Destination::Script));
        assert_eq!(script.outcome, Outcome::Block { collapse: false });

        assert_eq!(filter.stats(), (2, 2, 0));
    }

    #[test]
    fn test_collapse_can_be_disabled() {
        let (coordinator, _) = coordinator_with(ContentFilterConfig {
            collapse_blocked: false,
            ..ContentFilterConfig::default()
        });
        let image = decide(&coordinator, &request(1, "https://ads.test/b.png", Destination::Image));
        assert_eq!(image.outcome, Outcome::Block { collapse: false });
    }

    #[test]
    fn test_redirect_rule() {
        let (coordinator, filter) = coordinator_with(ContentFilterConfig::default());
        let decision = decide(&coordinator, &request(1, "https://cdn.test/lib.js", Destination::Script));

        assert_eq!(decision.outcome, Outcome::Proceed);
        assert_eq!(decision.redirect_url, Some(url("https://local.test/noop.js")));
        assert_eq!(filter.stats().2, 1);
    }

    #[test]
    fn test_allow_rule_can_prevent_cancel() {
        let target = "https://ok.ads.test/logo.png";
        for (prevent, expected_blocked) in [(false, true), (true, false)] {
            let (coordinator, _) = coordinator_with(ContentFilterConfig {
                prevent_cancel_on_allow_rule: prevent,
                ..ContentFilterConfig::default()
            });
            coordinator.install(Arc::new(RecordingFilter::new("strict", 0).request_verdict(Verdict::cancel())));

            let decision = decide(&coordinator, &request(1, target, Destination::Image));
            assert_eq!(decision.is_blocked(), expected_blocked);
        }
    }

    #[test]
    fn test_csp_added_to_documents() {
        let (coordinator, filter) = coordinator_with(ContentFilterConfig::default());
        let document = FilteredRequest::new(RequestId(1), url("https://news.test/"), Destination::Document);

        assert_eq!(decide(&coordinator, &document).outcome, Outcome::Proceed);

        let response = ResponseHead::new(StatusCode::OK)
            .with_header(CONTENT_SECURITY_POLICY, HeaderValue::from_static("img-src *"));
        let out = Arc::new(Mutex::new(None));
        let slot = out.clone();
        coordinator.on_headers_received(&document, &response, move |decision| *slot.lock() = Some(decision));

        let decision = out.lock().take().unwrap();
        let head = decision.response.unwrap();
        let policies: Vec<_> = head
            .headers
            .get_all(CONTENT_SECURITY_POLICY)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(policies, vec!["img-src *", "script-src 'self'"]);
        assert_eq!(filter.csp_injections(), 1);
    }

    #[test]
    fn test_exempt_document_skips_generic_blocks() {
        let (coordinator, _) = coordinator_with(ContentFilterConfig {
            generic_block_exempt_hosts: vec!["site.test".to_string()],
            ..ContentFilterConfig::default()
        });
        let decision = decide(&coordinator, &request(1, "https://ads.test/b.png", Destination::Image));
        assert_eq!(decision.outcome, Outcome::Proceed);
    }
}
