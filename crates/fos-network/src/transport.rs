//! Boundary between the HTTP adapter, the real network stack and the
//! original caller.
//!
//! Implementations deliver their events later through the adapter's
//! methods, never from inside these calls.

use crate::redirect::RedirectInfo;
use fos_webrequest::{Destination, FilteredRequest, NetError, RequestId, ResponseHead};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName};
use hyper::Method;
use url::{Origin, Url};

/// A transport request as handed to an adapter
#[derive(Debug, Clone)]
pub struct RequestParams {
    /// Routes the transport's requests (e.g. one per loader factory)
    pub routing_key: i32,
    /// The transport's own request id; 0 when it has none
    pub transport_local_id: i32,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub destination: Destination,
    pub initiator: Option<Origin>,
    pub process_id: i32,
    pub frame_id: i32,
    pub navigation_id: Option<i64>,
}

impl RequestParams {
    pub fn new(url: Url, destination: Destination) -> Self {
        Self {
            routing_key: 0,
            transport_local_id: 0,
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            destination,
            initiator: None,
            process_id: 0,
            frame_id: 0,
            navigation_id: None,
        }
    }

    pub fn with_transport_id(mut self, routing_key: i32, transport_local_id: i32) -> Self {
        self.routing_key = routing_key;
        self.transport_local_id = transport_local_id;
        self
    }

    pub(crate) fn into_request(self, id: RequestId) -> FilteredRequest {
        let mut request = FilteredRequest::new(id, self.url, self.destination)
            .with_method(self.method)
            .with_headers(self.headers)
            .with_frame(self.process_id, self.frame_id);
        request.initiator = self.initiator;
        request.navigation_id = self.navigation_id;
        request
    }
}

/// What the adapter asks the real transport to send
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    /// A filter wants to see raw extra headers
    pub report_raw_headers: bool,
}

impl TransportRequest {
    pub(crate) fn from_request(request: &FilteredRequest, report_raw_headers: bool) -> Self {
        Self {
            url: request.url.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            report_raw_headers,
        }
    }
}

/// Final status of a load as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStatus {
    pub error: Option<NetError>,
    /// The blocked resource should not take layout space
    pub should_collapse: bool,
}

impl CompletionStatus {
    pub fn ok() -> Self {
        Self {
            error: None,
            should_collapse: false,
        }
    }

    pub fn failed(error: NetError) -> Self {
        Self {
            error: Some(error),
            should_collapse: false,
        }
    }

    pub fn blocked(collapse: bool) -> Self {
        Self {
            error: Some(NetError::BlockedByFilter),
            should_collapse: collapse,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The real network stack for one HTTP request
pub trait HttpTransport: Send + Sync {
    /// Start (or start over) sending `request`
    fn start(&self, request: &TransportRequest);

    /// Follow the redirect the transport reported. `new_url` overrides the
    /// server's target when a filter redirected the follow-up request.
    fn follow_redirect(&self, removed_headers: &[HeaderName], modified_headers: &HeaderMap, new_url: Option<&Url>);

    /// Abort the attempt; no further events are expected
    fn cancel(&self, error: NetError);
}

/// The original caller of an HTTP request
pub trait LoaderClient: Send + Sync {
    fn on_receive_redirect(&self, redirect: &RedirectInfo, head: &ResponseHead);

    fn on_receive_response(&self, head: &ResponseHead);

    fn on_data(&self, chunk: Bytes);

    fn on_complete(&self, status: &CompletionStatus);
}
