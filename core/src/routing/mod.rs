//! Overlay routing — who hears what, and who counts as a neighbor
//!
//! Two halves:
//! - Dispatch: the receive-path policy run once per inbound message.
//!   Suppresses own echoes, intercepts control traffic, filters addressed
//!   messages, delivers the rest.
//! - Discovery: the probe/response protocol deciding which peers are exactly
//!   one hop away, since the mesh transport itself exposes no topology.

pub mod discovery;
pub mod dispatch;

pub(crate) use discovery::DiscoveryEngine;
pub(crate) use dispatch::{DispatchOutcome, Dispatcher};
