//! The filtered request record and its response head.

use crate::error::WebRequestError;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use hyper::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::{Origin, Url};

/// Stable logical identifier of a request.
///
/// Survives transport-level recreation of the underlying request object
/// (see [`crate::IdentityGenerator`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({})", self.0)
    }
}

/// What the request is fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Main frame document
    Document,
    /// Nested frame document
    SubFrame,
    /// CSS stylesheet
    Stylesheet,
    /// JavaScript
    Script,
    /// Image
    Image,
    /// Font
    Font,
    /// XHR/Fetch request
    XmlHttpRequest,
    /// Media (video/audio)
    Media,
    /// WebSocket handshake
    WebSocket,
    /// WebTransport handshake
    WebTransport,
    /// Other/Unknown
    Other,
}

impl Destination {
    /// Guess the destination from an Accept header or the path extension.
    pub fn from_accept_or_path(accept: Option<&str>, path: &str) -> Self {
        let path = path.to_ascii_lowercase();
        let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        match ext {
            "js" | "mjs" => return Self::Script,
            "css" => return Self::Stylesheet,
            "woff" | "woff2" | "ttf" | "otf" => return Self::Font,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "avif" => return Self::Image,
            "mp4" | "webm" | "mp3" | "ogg" | "m3u8" => return Self::Media,
            _ => {}
        }

        if let Some(accept) = accept {
            if accept.contains("text/html") { return Self::Document; }
            if accept.contains("text/css") { return Self::Stylesheet; }
            if accept.contains("javascript") { return Self::Script; }
            if accept.contains("image/") { return Self::Image; }
            if accept.contains("font/") { return Self::Font; }
        }

        Self::Other
    }

    /// Documents loaded into a frame
    pub fn is_frame(&self) -> bool {
        matches!(self, Self::Document | Self::SubFrame)
    }
}

/// Response status line and headers
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Reason phrase, when it differs from the canonical one
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Build a redirect response pointing at `location`.
    pub fn redirect(status: StatusCode, reason: &str, location: &Url) -> Result<Self, WebRequestError> {
        let value = HeaderValue::from_str(location.as_str())
            .map_err(|_| WebRequestError::InvalidHeaderValue(LOCATION.to_string()))?;
        let mut head = Self::new(status);
        head.reason = Some(reason.to_string());
        head.headers.insert(LOCATION, value);
        Ok(head)
    }

    /// Status line as it appears on the wire, e.g. `HTTP/1.1 302 Found`
    pub fn status_line(&self) -> String {
        let reason = self
            .reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("");
        format!("HTTP/1.1 {} {}", self.status.as_u16(), reason)
    }

    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection() && self.headers.contains_key(LOCATION)
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION)?.to_str().ok()
    }
}

/// State of one logical request as seen by filters.
///
/// Owned by the adapter driving the request. Mutated in place when the URL
/// changes on redirect or headers are rewritten.
#[derive(Debug, Clone)]
pub struct FilteredRequest {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub destination: Destination,
    /// Origin of the document that initiated the request
    pub initiator: Option<Origin>,
    /// Opaque renderer process identifier
    pub process_id: i32,
    /// Opaque frame identifier
    pub frame_id: i32,
    pub navigation_id: Option<i64>,
    /// Nullable until response headers arrive
    pub response_head: Option<ResponseHead>,
}

impl FilteredRequest {
    pub fn new(id: RequestId, url: Url, destination: Destination) -> Self {
        Self {
            id,
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            destination,
            initiator: None,
            process_id: 0,
            frame_id: 0,
            navigation_id: None,
            response_head: None,
        }
    }

    /// Parse `url` and create a request for it.
    pub fn parse(id: RequestId, url: &str, destination: Destination) -> Result<Self, WebRequestError> {
        let parsed = Url::parse(url).map_err(|e| WebRequestError::invalid_url(url, e))?;
        Ok(Self::new(id, parsed, destination))
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_initiator(mut self, initiator: Origin) -> Self {
        self.initiator = Some(initiator);
        self
    }

    pub fn with_frame(mut self, process_id: i32, frame_id: i32) -> Self {
        self.process_id = process_id;
        self.frame_id = frame_id;
        self
    }

    pub fn with_navigation_id(mut self, navigation_id: i64) -> Self {
        self.navigation_id = Some(navigation_id);
        self
    }

    /// Host of the target URL, lowercase
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// Move the request to a redirect target. The previous response head
    /// belongs to the old URL and is dropped.
    pub fn redirect_to(&mut self, url: Url) {
        self.url = url;
        self.response_head = None;
    }
}
