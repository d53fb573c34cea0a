//! WebSocket Stream Adapter
//!
//! Runs an opening handshake through the filter pipeline. The handshake
//! has the shape of a request and response, but a successful one hands the
//! connection off instead of streaming a body.
//!
//! Flow:
//! 1. onBeforeRequest: block, or move to another socket URL
//! 2. onBeforeSendHeaders / onSendHeaders, then connect
//! 3. Handshake response: onHeadersReceived, then onResponseStarted and
//!    onCompleted with the protocol upgrade code
//! 4. Authentication challenge: the same headers-received aggregation runs
//!    before the challenge reaches the caller; supplying credentials
//!    retries the handshake

use crate::config::AdapterConfig;
use crate::transport::RequestParams;
use fos_webrequest::{
    CompletionCode, Destination, FilteredRequest, NetError, Phase, PhaseCallback, PhaseDecision, PhaseSet,
    RequestCoordinator, RequestId, ResponseHead,
};
use hyper::header::HeaderMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};
use url::Url;

/// Opening handshake as handed to the connector
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub url: Url,
    pub headers: HeaderMap,
    /// A filter wants to see raw extra headers
    pub report_raw_headers: bool,
}

/// HTTP authentication challenge received during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// Authentication scheme, e.g. "basic"
    pub scheme: String,
    pub realm: Option<String>,
    /// Challenge came from a proxy
    pub is_proxy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// The network side of the handshake
pub trait HandshakeConnector: Send + Sync {
    fn connect(&self, request: &HandshakeRequest);

    /// Answer an auth challenge; `None` gives up on authentication
    fn supply_credentials(&self, credentials: Option<&Credentials>);

    fn abort(&self, error: NetError);
}

/// The page that opened the socket
pub trait WebSocketClient: Send + Sync {
    fn on_connection_established(&self, response: &ResponseHead);

    fn on_auth_required(&self, challenge: &AuthChallenge, response: &ResponseHead);

    fn on_failure(&self, error: NetError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    BeforeRequest,
    BeforeSendHeaders,
    Connecting,
    HeadersReceived,
    AwaitingCredentials,
    Established,
    Failed,
}

impl Stage {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }
}

struct SocketState {
    stage: Stage,
    request: FilteredRequest,
    connected: bool,
    epoch: u64,
    redirects: u32,
    released: bool,
}

struct SocketCore {
    coordinator: RequestCoordinator,
    config: AdapterConfig,
    connector: Arc<dyn HandshakeConnector>,
    client: Arc<dyn WebSocketClient>,
    state: Mutex<SocketState>,
}

/// One WebSocket opening handshake
pub struct WebSocketAdapter {
    core: Arc<SocketCore>,
}

impl WebSocketAdapter {
    pub fn start(
        coordinator: RequestCoordinator,
        config: AdapterConfig,
        mut params: RequestParams,
        connector: Arc<dyn HandshakeConnector>,
        client: Arc<dyn WebSocketClient>,
    ) -> Self {
        params.destination = Destination::WebSocket;
        let id = coordinator.generate_id(params.routing_key, params.transport_local_id);
        let request = params.into_request(id);
        debug!("{} opening socket to {}", id, request.url);

        let core = Arc::new(SocketCore {
            coordinator,
            config,
            connector,
            client,
            state: Mutex::new(SocketState {
                stage: Stage::BeforeRequest,
                request,
                connected: false,
                epoch: 0,
                redirects: 0,
                released: false,
            }),
        });
        core.run_before_request();
        Self { core }
    }

    pub fn id(&self) -> RequestId {
        self.core.state.lock().request.id
    }

    pub fn url(&self) -> Url {
        self.core.state.lock().request.url.clone()
    }

    pub fn is_established(&self) -> bool {
        self.core.state.lock().stage == Stage::Established
    }

    pub fn is_failed(&self) -> bool {
        self.core.state.lock().stage == Stage::Failed
    }

    /// The server answered the handshake.
    pub fn on_handshake_response(&self, response: ResponseHead) {
        self.core.response_arrived(response, None);
    }

    /// The server (or a proxy) asked for credentials.
    pub fn on_auth_required(&self, challenge: AuthChallenge, response: ResponseHead) {
        self.core.response_arrived(response, Some(challenge));
    }

    /// The caller answered an auth challenge.
    pub fn continue_with_auth(&self, credentials: Option<Credentials>) {
        self.core.continue_with_auth(credentials);
    }

    /// The handshake failed on the network side.
    pub fn on_failure(&self, error: NetError) {
        self.core.network_failure(error);
    }

    pub fn disconnect(&self) {
        self.core.abandon();
    }
}

impl Drop for WebSocketAdapter {
    fn drop(&mut self) {
        self.core.abandon();
    }
}

impl SocketCore {
    fn enter(&self, stage: Stage) -> Option<(FilteredRequest, u64)> {
        let mut state = self.state.lock();
        if state.stage.is_terminal() {
            return None;
        }
        state.stage = stage;
        state.epoch += 1;
        Some((state.request.clone(), state.epoch))
    }

    fn continuation<F>(self: &Arc<Self>, epoch: u64, then: F) -> PhaseCallback
    where
        F: FnOnce(&Arc<SocketCore>, PhaseDecision) + Send + 'static,
    {
        let weak: Weak<SocketCore> = Arc::downgrade(self);
        Box::new(move |decision: PhaseDecision| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            let current = {
                let state = core.state.lock();
                state.epoch == epoch && !state.stage.is_terminal()
            };
            if !current {
                trace!("Stale {} decision for {}", decision.phase, decision.request_id);
                return;
            }
            then(&core, decision);
        })
    }

    fn run_before_request(self: &Arc<Self>) {
        let Some((request, epoch)) = self.enter(Stage::BeforeRequest) else {
            return;
        };
        let done = self.continuation(epoch, |core, decision| core.before_request_done(decision));
        self.coordinator.on_before_request(&request, done);
    }

    fn before_request_done(self: &Arc<Self>, decision: PhaseDecision) {
        if decision.is_blocked() {
            self.fail(NetError::BlockedByFilter);
            return;
        }

        if let Some(target) = decision.redirect_url {
            let from = self.state.lock().request.url.clone();
            if !matches!(target.scheme(), "ws" | "wss") || !self.config.redirect_policy.is_safe(&from, &target) {
                warn!("Unsafe socket redirect from {} to {}", from, target);
                self.fail(NetError::UnsafeRedirect);
                return;
            }

            // Handshakes cannot be redirected on the wire; the new URL goes
            // through the pipeline again and is connected to directly.
            let moved = {
                let mut state = self.state.lock();
                state.redirects += 1;
                if state.redirects > self.config.max_socket_redirects {
                    None
                } else {
                    state.request.redirect_to(target.clone());
                    Some(state.request.clone())
                }
            };
            let Some(request) = moved else {
                warn!("Too many socket redirects from {}", from);
                self.fail(NetError::UnsafeRedirect);
                return;
            };
            debug!("{} socket moved to {}", request.id, target);
            self.coordinator.on_before_redirect(&request, &target);
            self.run_before_request();
            return;
        }

        self.run_before_send_headers();
    }

    fn run_before_send_headers(self: &Arc<Self>) {
        let Some((request, epoch)) = self.enter(Stage::BeforeSendHeaders) else {
            return;
        };
        let done = self.continuation(epoch, |core, decision| core.before_send_headers_done(decision));
        self.coordinator.on_before_send_headers(&request, done);
    }

    fn before_send_headers_done(self: &Arc<Self>, decision: PhaseDecision) {
        if decision.is_blocked() {
            self.fail(NetError::BlockedByFilter);
            return;
        }

        let request = {
            let mut state = self.state.lock();
            if let Some(delta) = decision.request_headers {
                state.request.headers = delta.headers;
            }
            state.stage = Stage::Connecting;
            state.connected = true;
            state.request.clone()
        };

        self.coordinator.on_send_headers(&request);
        self.connector.connect(&HandshakeRequest {
            url: request.url.clone(),
            headers: request.headers.clone(),
            report_raw_headers: self.coordinator.has_extra_headers_filter(&request),
        });
    }

    fn response_arrived(self: &Arc<Self>, response: ResponseHead, challenge: Option<AuthChallenge>) {
        let (request, epoch) = {
            let mut state = self.state.lock();
            if state.stage != Stage::Connecting {
                trace!("Ignoring handshake response in stage {:?}", state.stage);
                return;
            }
            state.stage = Stage::HeadersReceived;
            state.epoch += 1;
            state.request.response_head = Some(response.clone());
            (state.request.clone(), state.epoch)
        };

        let original = response.clone();
        let done = self.continuation(epoch, move |core, decision| {
            core.headers_received_done(decision, original, challenge)
        });
        self.coordinator.on_headers_received(&request, &response, done);
    }

    fn headers_received_done(
        self: &Arc<Self>,
        decision: PhaseDecision,
        original: ResponseHead,
        challenge: Option<AuthChallenge>,
    ) {
        if decision.is_blocked() {
            self.fail(NetError::BlockedByFilter);
            return;
        }
        if decision.redirect_url.is_some() {
            warn!("{} handshake response cannot be redirected", decision.request_id);
            self.fail(NetError::UnsafeRedirect);
            return;
        }

        let response = decision.response.unwrap_or(original);

        if let Some(challenge) = challenge {
            self.state.lock().stage = Stage::AwaitingCredentials;
            self.client.on_auth_required(&challenge, &response);
            return;
        }

        let request = {
            let mut state = self.state.lock();
            state.stage = Stage::Established;
            state.request.response_head = Some(response.clone());
            state.request.clone()
        };

        debug!("{} socket established", request.id);
        self.coordinator.on_response_started(&request);
        self.coordinator
            .on_completed(&request, CompletionCode::ProtocolUpgrade);
        self.client.on_connection_established(&response);
        self.release();
    }

    fn continue_with_auth(&self, credentials: Option<Credentials>) {
        let id = {
            let mut state = self.state.lock();
            if state.stage != Stage::AwaitingCredentials {
                warn!("continue_with_auth in stage {:?}", state.stage);
                return;
            }
            state.stage = Stage::Connecting;
            state.request.id
        };

        // The retried handshake gets its own headers-received round.
        self.coordinator
            .clear_signaled(id, PhaseSet::of(&[Phase::HeadersReceived]));
        self.connector.supply_credentials(credentials.as_ref());
    }

    fn network_failure(&self, error: NetError) {
        let request = {
            let mut state = self.state.lock();
            if state.stage.is_terminal() {
                return;
            }
            state.stage = Stage::Failed;
            state.connected = false;
            state.request.clone()
        };

        self.coordinator.on_error_occurred(&request, error);
        self.client.on_failure(error);
        self.release();
    }

    fn fail(&self, error: NetError) {
        let (request, connected) = {
            let mut state = self.state.lock();
            if state.stage.is_terminal() {
                return;
            }
            state.stage = Stage::Failed;
            let connected = std::mem::replace(&mut state.connected, false);
            (state.request.clone(), connected)
        };

        debug!("{} socket failed: {}", request.id, error);
        if connected {
            self.connector.abort(error);
        }
        self.coordinator.on_error_occurred(&request, error);
        self.client.on_failure(error);
        self.release();
    }

    fn abandon(&self) {
        let (request, connected) = {
            let mut state = self.state.lock();
            if state.stage.is_terminal() {
                return;
            }
            state.stage = Stage::Failed;
            let connected = std::mem::replace(&mut state.connected, false);
            (state.request.clone(), connected)
        };

        if connected {
            self.connector.abort(NetError::ClientDisconnected);
        }
        let error = if self.coordinator.has_pending_phase(request.id) {
            NetError::AbortedDuringTeardown
        } else {
            NetError::ClientDisconnected
        };
        self.coordinator.on_error_occurred(&request, error);
        self.release();
    }

    fn release(&self) {
        let id = {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.released, true) {
                return;
            }
            state.request.id
        };
        self.coordinator.request_will_be_destroyed(id);
    }
}
