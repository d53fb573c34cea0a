//! Request lifecycle phases and the signaled-phase bitmap.

use crate::error::NetError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One named point in a request's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    BeforeRequest,
    BeforeSendHeaders,
    SendHeaders,
    HeadersReceived,
    BeforeRedirect,
    ResponseStarted,
    Completed,
    ErrorOccurred,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::BeforeRequest,
        Phase::BeforeSendHeaders,
        Phase::SendHeaders,
        Phase::HeadersReceived,
        Phase::BeforeRedirect,
        Phase::ResponseStarted,
        Phase::Completed,
        Phase::ErrorOccurred,
    ];

    fn bit(self) -> u16 {
        1 << self as u16
    }

    /// Phases whose filters answer with a verdict
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            Phase::BeforeRequest | Phase::BeforeSendHeaders | Phase::HeadersReceived
        )
    }

    /// Phases that may carry a redirect
    pub fn allows_redirect(self) -> bool {
        matches!(self, Phase::BeforeRequest | Phase::HeadersReceived)
    }

    /// Phases that may carry header changes
    pub fn allows_header_changes(self) -> bool {
        matches!(self, Phase::BeforeSendHeaders | Phase::HeadersReceived)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeRequest => "onBeforeRequest",
            Self::BeforeSendHeaders => "onBeforeSendHeaders",
            Self::SendHeaders => "onSendHeaders",
            Self::HeadersReceived => "onHeadersReceived",
            Self::BeforeRedirect => "onBeforeRedirect",
            Self::ResponseStarted => "onResponseStarted",
            Self::Completed => "onCompleted",
            Self::ErrorOccurred => "onErrorOccurred",
        };
        f.write_str(name)
    }
}

/// Bitmask of phases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PhaseSet(u16);

impl PhaseSet {
    pub const EMPTY: PhaseSet = PhaseSet(0);

    /// Phases replayed when a request is redirected
    pub fn pre_redirect() -> Self {
        Self::of(&[
            Phase::BeforeRequest,
            Phase::BeforeSendHeaders,
            Phase::SendHeaders,
            Phase::HeadersReceived,
        ])
    }

    pub fn of(phases: &[Phase]) -> Self {
        Self(phases.iter().fold(0, |bits, p| bits | p.bit()))
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    /// Insert `phase`, returning false if it was already present.
    pub fn insert(&mut self, phase: Phase) -> bool {
        let fresh = !self.contains(phase);
        self.0 |= phase.bit();
        fresh
    }

    pub fn clear(&mut self, phases: PhaseSet) {
        self.0 &= !phases.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// How a request finished, as reported in the completed phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionCode {
    Ok,
    /// The handshake succeeded and the connection was handed to the data
    /// phase; the transport is still open
    ProtocolUpgrade,
    Failed(NetError),
}

impl CompletionCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ProtocolUpgrade => -160,
            Self::Failed(error) => error.code(),
        }
    }
}
