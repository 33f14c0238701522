// Wire envelope — every frame crossing the mesh is one of these

use serde::{Deserialize, Serialize};

/// TTL sentinel meaning "flood to the whole reachable mesh".
pub const UNBOUNDED_HOPS: u32 = u32::MAX;

/// Control-content marker opening a neighbor probe.
pub(crate) const PROBE_MARKER: &str = "QUERY";
/// Control-content marker opening a probe response.
pub(crate) const REPLY_MARKER: &str = "RESPO";
/// Control content announcing a node entering the mesh.
pub(crate) const ENTER_MARKER: &str = "ENTER";
/// Control content announcing a node leaving the mesh.
pub(crate) const LEAVE_MARKER: &str = "LEAVE";

/// One unit of exchange on the overlay.
///
/// The mesh transport carries these opaquely (as bincode frames) and is
/// assumed to decrement `hopcount` on each relay. Everything else is fixed at
/// construction: `orig_hopcount` in particular is never touched again, so a
/// receiver can compute hops traveled as `orig_hopcount - hopcount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayMessage {
    /// Originating node id. Left empty by the constructors and stamped by
    /// the send path.
    pub sender: String,
    /// Payload. For control traffic this is a marker prefix plus an optional
    /// round token.
    pub contents: String,
    /// Ids whose application should receive this message; `None` means
    /// broadcast to everyone reachable.
    pub receivers: Option<Vec<String>>,
    /// Remaining TTL, decremented by the transport in flight.
    pub hopcount: u32,
    /// TTL at origination.
    pub orig_hopcount: u32,
    /// Internal protocol traffic, never surfaced to the application and
    /// excluded from traffic accounting.
    pub control: bool,
}

impl OverlayMessage {
    /// Broadcast to every reachable peer (unbounded TTL).
    pub fn broadcast(contents: impl Into<String>) -> Self {
        Self {
            sender: String::new(),
            contents: contents.into(),
            receivers: None,
            hopcount: UNBOUNDED_HOPS,
            orig_hopcount: UNBOUNDED_HOPS,
            control: false,
        }
    }

    /// Broadcast with a bounded flood radius.
    pub fn broadcast_within(contents: impl Into<String>, hop_limit: u32) -> Self {
        Self {
            sender: String::new(),
            contents: contents.into(),
            receivers: None,
            hopcount: hop_limit,
            orig_hopcount: hop_limit,
            control: false,
        }
    }

    /// Addressed to an explicit id list (unicast or multicast). The flood
    /// still reaches the whole mesh; receivers filter at the application
    /// boundary.
    pub fn addressed(contents: impl Into<String>, receivers: Vec<String>) -> Self {
        Self {
            sender: String::new(),
            contents: contents.into(),
            receivers: Some(receivers),
            hopcount: UNBOUNDED_HOPS,
            orig_hopcount: UNBOUNDED_HOPS,
            control: false,
        }
    }

    /// Neighbor probe for one discovery round. TTL 1 keeps it from crossing
    /// more than one hop.
    pub(crate) fn probe(token: &str) -> Self {
        Self {
            sender: String::new(),
            contents: format!("{PROBE_MARKER}{token}"),
            receivers: None,
            hopcount: 1,
            orig_hopcount: 1,
            control: true,
        }
    }

    /// Answer to a neighbor probe, echoing the round token back.
    pub(crate) fn probe_reply(token: &str) -> Self {
        Self {
            sender: String::new(),
            contents: format!("{REPLY_MARKER}{token}"),
            receivers: None,
            hopcount: 1,
            orig_hopcount: 1,
            control: true,
        }
    }

    /// Presence notice flooded when this node comes online.
    pub(crate) fn presence_enter() -> Self {
        Self {
            sender: String::new(),
            contents: ENTER_MARKER.to_string(),
            receivers: None,
            hopcount: UNBOUNDED_HOPS,
            orig_hopcount: UNBOUNDED_HOPS,
            control: true,
        }
    }

    /// Presence notice flooded on a clean leave.
    pub(crate) fn presence_leave() -> Self {
        Self {
            sender: String::new(),
            contents: LEAVE_MARKER.to_string(),
            receivers: None,
            hopcount: UNBOUNDED_HOPS,
            orig_hopcount: UNBOUNDED_HOPS,
            control: true,
        }
    }

    /// True when no receiver list is attached.
    pub fn is_broadcast(&self) -> bool {
        self.receivers.is_none()
    }

    /// Hops this message traveled before arriving here, derived from the
    /// preserved origination TTL. Zero when the origination TTL was never
    /// set.
    pub fn hops_traveled(&self) -> u32 {
        if self.orig_hopcount > 0 {
            self.orig_hopcount.saturating_sub(self.hopcount)
        } else {
            0
        }
    }
}
