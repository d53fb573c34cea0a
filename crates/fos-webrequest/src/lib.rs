//! fOS Web Request Pipeline
//!
//! Coordinates a prioritized chain of request filters (ad/tracker
//! blockers, header rewriters) across the lifecycle of every request.
//!
//! Architecture:
//! 1. An adapter builds a [`FilteredRequest`] and asks the
//!    [`RequestCoordinator`] to run a [`Phase`]
//! 2. The coordinator fans the phase out to every [`Filter`] in the
//!    [`FilterChain`], synchronously or asynchronously
//! 3. Verdicts are merged by chain order into one [`PhaseDecision`]
//! 4. The adapter applies the decision to the real transport

mod chain;
mod config;
mod coordinator;
mod error;
mod filter;
mod headers;
mod identity;
mod pending;
mod phase;
mod request;

pub use chain::{ChainObserver, FilterChain};
pub use config::WebRequestConfig;
pub use coordinator::{CoordinatorStats, RequestCoordinator, Responder};
pub use error::{NetError, WebRequestError};
pub use filter::{Decision, Filter, FilterContext, FilterKind, Reply, Verdict};
pub use headers::{HeaderChanges, HeaderDelta};
pub use identity::IdentityGenerator;
pub use pending::{Outcome, PhaseCallback, PhaseDecision};
pub use phase::{CompletionCode, Phase, PhaseSet};
pub use request::{Destination, FilteredRequest, RequestId, ResponseHead};
