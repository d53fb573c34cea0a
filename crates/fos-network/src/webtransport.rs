//! WebTransport Handshake Adapter
//!
//! Only onBeforeRequest gates a WebTransport session. There are no header
//! phases; the filters' answer is a plain allow or deny.

use crate::transport::RequestParams;
use fos_webrequest::{
    CompletionCode, Destination, FilteredRequest, NetError, PhaseDecision, RequestCoordinator, RequestId,
    ResponseHead,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use url::Url;

/// The network side of the session handshake
pub trait WebTransportConnector: Send + Sync {
    fn connect(&self, url: &Url);

    fn abort(&self, error: NetError);
}

/// The page that opened the session
pub trait WebTransportClient: Send + Sync {
    fn on_connection_established(&self, response: &ResponseHead);

    fn on_failure(&self, error: NetError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Gating,
    Connecting,
    Established,
    Failed,
}

struct HandshakeCore {
    coordinator: RequestCoordinator,
    connector: Arc<dyn WebTransportConnector>,
    client: Arc<dyn WebTransportClient>,
    request: FilteredRequest,
    stage: Mutex<Stage>,
}

/// One WebTransport session handshake
pub struct WebTransportAdapter {
    core: Arc<HandshakeCore>,
}

impl WebTransportAdapter {
    pub fn start(
        coordinator: RequestCoordinator,
        mut params: RequestParams,
        connector: Arc<dyn WebTransportConnector>,
        client: Arc<dyn WebTransportClient>,
    ) -> Self {
        params.destination = Destination::WebTransport;
        let id = coordinator.generate_id(params.routing_key, params.transport_local_id);
        let request = params.into_request(id);

        let core = Arc::new(HandshakeCore {
            coordinator,
            connector,
            client,
            request,
            stage: Mutex::new(Stage::Gating),
        });

        let weak: Weak<HandshakeCore> = Arc::downgrade(&core);
        core.coordinator.on_before_request(&core.request, move |decision| {
            if let Some(core) = weak.upgrade() {
                core.gated(decision);
            }
        });
        Self { core }
    }

    pub fn id(&self) -> RequestId {
        self.core.request.id
    }

    pub fn is_established(&self) -> bool {
        *self.core.stage.lock() == Stage::Established
    }

    pub fn is_failed(&self) -> bool {
        *self.core.stage.lock() == Stage::Failed
    }

    /// The connector finished the handshake.
    pub fn on_handshake_complete(&self, result: Result<ResponseHead, NetError>) {
        let core = &self.core;
        {
            let mut stage = core.stage.lock();
            if *stage != Stage::Connecting {
                return;
            }
            *stage = if result.is_ok() { Stage::Established } else { Stage::Failed };
        }

        match result {
            Ok(response) => {
                core.coordinator
                    .on_completed(&core.request, CompletionCode::ProtocolUpgrade);
                core.client.on_connection_established(&response);
            }
            Err(error) => {
                core.coordinator.on_error_occurred(&core.request, error);
                core.client.on_failure(error);
            }
        }
        core.coordinator.request_will_be_destroyed(core.request.id);
    }
}

impl Drop for WebTransportAdapter {
    fn drop(&mut self) {
        let core = &self.core;
        let connecting = {
            let mut stage = core.stage.lock();
            if matches!(*stage, Stage::Established | Stage::Failed) {
                return;
            }
            std::mem::replace(&mut *stage, Stage::Failed) == Stage::Connecting
        };

        if connecting {
            core.connector.abort(NetError::ClientDisconnected);
        }
        let error = if core.coordinator.has_pending_phase(core.request.id) {
            NetError::AbortedDuringTeardown
        } else {
            NetError::ClientDisconnected
        };
        core.coordinator.on_error_occurred(&core.request, error);
        core.coordinator.request_will_be_destroyed(core.request.id);
    }
}

impl HandshakeCore {
    fn gated(&self, decision: PhaseDecision) {
        let denial = if decision.is_blocked() {
            Some(NetError::BlockedByFilter)
        } else if let Some(url) = &decision.redirect_url {
            warn!("{} WebTransport handshakes cannot be redirected (to {})", self.request.id, url);
            Some(NetError::UnsafeRedirect)
        } else {
            None
        };

        {
            let mut stage = self.stage.lock();
            if *stage != Stage::Gating {
                return;
            }
            *stage = if denial.is_some() { Stage::Failed } else { Stage::Connecting };
        }

        match denial {
            Some(error) => {
                debug!("{} handshake denied: {}", self.request.id, error);
                self.coordinator.on_error_occurred(&self.request, error);
                self.client.on_failure(error);
                self.coordinator.request_will_be_destroyed(self.request.id);
            }
            None => self.connector.connect(&self.request.url),
        }
    }
}
