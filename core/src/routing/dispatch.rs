// Receive path — one decision per inbound message
//
// Invoked by the transport event pump for every frame the mesh delivers.
// Order matters: own echoes first (flooding loops everything back), then the
// readiness gate, then control interception, then addressed filtering.

use crate::message::types::{ENTER_MARKER, LEAVE_MARKER, PROBE_MARKER, REPLY_MARKER};
use crate::message::OverlayMessage;
use crate::routing::discovery::DiscoveryEngine;
use crate::stats::TrafficStats;
use crate::DelegateSlot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What the receive path decided to do with one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DispatchOutcome {
    /// Our own flood came back; nobody hears it twice.
    OwnEcho,
    /// Not registered, or no delegate attached; dropped quietly.
    NotReady,
    /// Neighbor probe: answer with this response message.
    ProbeReply(OverlayMessage),
    /// Probe response matched the current round; sender recorded.
    NeighborRecorded,
    /// Probe response for an earlier round; ignored.
    StaleResponse,
    /// Presence notice surfaced as an info notification.
    Notice,
    /// Control content nobody recognizes; ignored.
    UnknownControl,
    /// Addressed message not naming this node; dropped.
    NotAddressed,
    /// Handed to the application sink.
    Delivered,
}

/// Per-session receive-path state. Everything here is cheap shared handles;
/// the decision itself is synchronous and lock-light so the pump never
/// stalls the transport.
pub(crate) struct Dispatcher {
    self_id: String,
    registered: Arc<AtomicBool>,
    delegate: DelegateSlot,
    discovery: Arc<DiscoveryEngine>,
    stats: Arc<TrafficStats>,
}

impl Dispatcher {
    pub(crate) fn new(
        self_id: String,
        registered: Arc<AtomicBool>,
        delegate: DelegateSlot,
        discovery: Arc<DiscoveryEngine>,
        stats: Arc<TrafficStats>,
    ) -> Self {
        Self {
            self_id,
            registered,
            delegate,
            discovery,
            stats,
        }
    }

    pub(crate) fn dispatch(&self, message: OverlayMessage) -> DispatchOutcome {
        if message.sender == self.self_id {
            return DispatchOutcome::OwnEcho;
        }
        if !self.registered.load(Ordering::Relaxed) || !self.delegate.is_attached() {
            return DispatchOutcome::NotReady;
        }
        if message.control {
            return self.dispatch_control(&message);
        }
        if let Some(receivers) = &message.receivers {
            if !receivers.iter().any(|id| id == &self.self_id) {
                return DispatchOutcome::NotAddressed;
            }
        }
        self.deliver(message)
    }

    /// Control traffic never reaches the application and is never counted.
    fn dispatch_control(&self, message: &OverlayMessage) -> DispatchOutcome {
        let contents = message.contents.as_str();

        if let Some(token) = contents.strip_prefix(PROBE_MARKER) {
            debug!(from = %message.sender, "answering neighbor probe");
            return DispatchOutcome::ProbeReply(OverlayMessage::probe_reply(token));
        }
        if let Some(token) = contents.strip_prefix(REPLY_MARKER) {
            return if self.discovery.record_response(token, &message.sender) {
                debug!(neighbor = %message.sender, "recorded probe response");
                DispatchOutcome::NeighborRecorded
            } else {
                DispatchOutcome::StaleResponse
            };
        }
        if contents.starts_with(ENTER_MARKER) {
            self.delegate
                .notify_info(&format!("{} joined the mesh", message.sender));
            return DispatchOutcome::Notice;
        }
        if contents.starts_with(LEAVE_MARKER) {
            self.delegate
                .notify_info(&format!("{} left the mesh", message.sender));
            return DispatchOutcome::Notice;
        }

        debug!(from = %message.sender, "ignoring unknown control content");
        DispatchOutcome::UnknownControl
    }

    fn deliver(&self, message: OverlayMessage) -> DispatchOutcome {
        // Counters first: a panicking subscriber must not lose the tally.
        if message.orig_hopcount > 0 {
            self.stats.record_hops(u64::from(message.hops_traveled()));
        }
        self.stats.record_received(message.contents.len());

        if self.delegate.notify_message(&message, "Message received").is_err() {
            self.delegate
                .notify_info("a message subscriber panicked; delivery continues");
        }
        DispatchOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UNBOUNDED_HOPS;
    use crate::{OverlayDelegate, StateChange};
    use parking_lot::Mutex;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(OverlayMessage, String)>>,
        infos: Mutex<Vec<String>>,
    }

    impl OverlayDelegate for Recorder {
        fn on_state_changed(&self, _change: StateChange) {}
        fn on_message(&self, message: OverlayMessage, note: String) {
            self.messages.lock().push((message, note));
        }
        fn on_info(&self, note: String) {
            self.infos.lock().push(note);
        }
    }

    /// Panics on every delivered message, records infos.
    #[derive(Default)]
    struct Panicky {
        infos: Mutex<Vec<String>>,
    }

    impl OverlayDelegate for Panicky {
        fn on_state_changed(&self, _change: StateChange) {}
        fn on_message(&self, _message: OverlayMessage, _note: String) {
            panic!("sink exploded");
        }
        fn on_info(&self, note: String) {
            self.infos.lock().push(note);
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        recorder: Arc<Recorder>,
        discovery: Arc<DiscoveryEngine>,
        stats: Arc<TrafficStats>,
        registered: Arc<AtomicBool>,
    }

    fn harness(self_id: &str) -> Harness {
        let delegate = DelegateSlot::default();
        let recorder = Arc::new(Recorder::default());
        delegate.set(recorder.clone());

        let discovery = Arc::new(DiscoveryEngine::new());
        let stats = Arc::new(TrafficStats::new());
        let registered = Arc::new(AtomicBool::new(true));
        let dispatcher = Dispatcher::new(
            self_id.to_string(),
            registered.clone(),
            delegate,
            discovery.clone(),
            stats.clone(),
        );
        Harness {
            dispatcher,
            recorder,
            discovery,
            stats,
            registered,
        }
    }

    fn from_peer(mut message: OverlayMessage, sender: &str) -> OverlayMessage {
        message.sender = sender.to_string();
        message
    }

    #[test]
    fn test_own_flood_never_redelivered() {
        let h = harness("a");
        let message = from_peer(OverlayMessage::broadcast("hello"), "a");

        assert_eq!(h.dispatcher.dispatch(message), DispatchOutcome::OwnEcho);
        assert!(h.recorder.messages.lock().is_empty());
        assert_eq!(h.stats.snapshot().messages_rx, 0);
    }

    #[test]
    fn test_unregistered_drops_everything() {
        let h = harness("a");
        h.registered.store(false, Ordering::Relaxed);

        let user = from_peer(OverlayMessage::broadcast("hello"), "b");
        assert_eq!(h.dispatcher.dispatch(user), DispatchOutcome::NotReady);

        // Even probes are dropped before the control branch.
        let probe = from_peer(OverlayMessage::probe("tok"), "b");
        assert_eq!(h.dispatcher.dispatch(probe), DispatchOutcome::NotReady);
    }

    #[test]
    fn test_no_delegate_drops_everything() {
        let delegate = DelegateSlot::default();
        let dispatcher = Dispatcher::new(
            "a".to_string(),
            Arc::new(AtomicBool::new(true)),
            delegate,
            Arc::new(DiscoveryEngine::new()),
            Arc::new(TrafficStats::new()),
        );

        let message = from_peer(OverlayMessage::broadcast("hello"), "b");
        assert_eq!(dispatcher.dispatch(message), DispatchOutcome::NotReady);
    }

    #[test]
    fn test_probe_answered_with_same_token() {
        let h = harness("a");
        let probe = from_peer(OverlayMessage::probe("round-9"), "b");

        match h.dispatcher.dispatch(probe) {
            DispatchOutcome::ProbeReply(reply) => {
                assert_eq!(reply.contents, "RESPOround-9");
                assert!(reply.control);
                assert_eq!(reply.hopcount, 1);
                assert_eq!(reply.orig_hopcount, 1);
            }
            other => panic!("expected probe reply, got {other:?}"),
        }
        // Probes are invisible to the application and uncounted.
        assert!(h.recorder.messages.lock().is_empty());
        assert_eq!(h.stats.snapshot().messages_rx, 0);
    }

    #[test]
    fn test_response_recorded_only_for_current_round() {
        let h = harness("a");
        let old = h.discovery.advance_round();
        let current = h.discovery.advance_round();

        let stale = from_peer(OverlayMessage::probe_reply(&old), "b");
        assert_eq!(h.dispatcher.dispatch(stale), DispatchOutcome::StaleResponse);

        let fresh = from_peer(OverlayMessage::probe_reply(&current), "b");
        assert_eq!(h.dispatcher.dispatch(fresh), DispatchOutcome::NeighborRecorded);

        h.discovery.advance_round();
        assert_eq!(h.discovery.neighbors(), vec!["b".to_string()]);
    }

    #[test]
    fn test_receiver_filtering() {
        let h = harness("c");
        let message = from_peer(
            OverlayMessage::addressed("for a and b", vec!["a".into(), "b".into()]),
            "a",
        );
        assert_eq!(h.dispatcher.dispatch(message), DispatchOutcome::NotAddressed);
        assert!(h.recorder.messages.lock().is_empty());
        assert_eq!(h.stats.snapshot().messages_rx, 0);

        let h = harness("b");
        let message = from_peer(
            OverlayMessage::addressed("for a and b", vec!["a".into(), "b".into()]),
            "a",
        );
        assert_eq!(h.dispatcher.dispatch(message), DispatchOutcome::Delivered);
        let delivered = h.recorder.messages.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0.contents, "for a and b");
        assert_eq!(delivered[0].1, "Message received");
    }

    #[test]
    fn test_broadcast_always_delivers() {
        let h = harness("z");
        let message = from_peer(OverlayMessage::broadcast("to all"), "a");
        assert_eq!(h.dispatcher.dispatch(message), DispatchOutcome::Delivered);
        assert_eq!(h.recorder.messages.lock().len(), 1);
    }

    #[test]
    fn test_hop_accounting_on_delivery() {
        let h = harness("b");
        let mut message = from_peer(OverlayMessage::broadcast_within("traveled", 5), "a");
        message.hopcount = 3;

        assert_eq!(h.dispatcher.dispatch(message), DispatchOutcome::Delivered);
        let snap = h.stats.snapshot();
        assert_eq!(snap.hop_count_sum, 2);
        assert_eq!(snap.messages_rx, 1);
        assert_eq!(snap.bytes_rx, "traveled".len() as u64);
    }

    #[test]
    fn test_unbounded_flood_still_counts_distance() {
        let h = harness("b");
        let mut message = from_peer(OverlayMessage::broadcast("far"), "a");
        message.hopcount = UNBOUNDED_HOPS - 3;

        h.dispatcher.dispatch(message);
        assert_eq!(h.stats.snapshot().hop_count_sum, 3);
    }

    #[test]
    fn test_presence_notices_surface_as_info() {
        let h = harness("a");

        let enter = from_peer(OverlayMessage::presence_enter(), "b");
        assert_eq!(h.dispatcher.dispatch(enter), DispatchOutcome::Notice);
        let leave = from_peer(OverlayMessage::presence_leave(), "b");
        assert_eq!(h.dispatcher.dispatch(leave), DispatchOutcome::Notice);

        let infos = h.recorder.infos.lock();
        assert_eq!(infos.as_slice(), ["b joined the mesh", "b left the mesh"]);
        assert!(h.recorder.messages.lock().is_empty());
        assert_eq!(h.stats.snapshot().messages_rx, 0);
    }

    #[test]
    fn test_unknown_control_ignored() {
        let h = harness("a");
        let mut odd = from_peer(OverlayMessage::presence_enter(), "b");
        odd.contents = "XYZZY".to_string();

        assert_eq!(h.dispatcher.dispatch(odd), DispatchOutcome::UnknownControl);
        assert!(h.recorder.infos.lock().is_empty());
    }

    #[test]
    fn test_panicking_subscriber_reported_not_fatal() {
        let delegate = DelegateSlot::default();
        let panicky = Arc::new(Panicky::default());
        delegate.set(panicky.clone());
        let stats = Arc::new(TrafficStats::new());
        let dispatcher = Dispatcher::new(
            "b".to_string(),
            Arc::new(AtomicBool::new(true)),
            delegate,
            Arc::new(DiscoveryEngine::new()),
            stats.clone(),
        );

        let first = from_peer(OverlayMessage::broadcast("one"), "a");
        assert_eq!(dispatcher.dispatch(first), DispatchOutcome::Delivered);
        let second = from_peer(OverlayMessage::broadcast("two"), "a");
        assert_eq!(dispatcher.dispatch(second), DispatchOutcome::Delivered);

        // Both deliveries counted, both failures downgraded to info.
        assert_eq!(stats.snapshot().messages_rx, 2);
        let infos = panicky.infos.lock();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].contains("subscriber panicked"));
    }

    proptest! {
        /// Self-suppression holds for every message shape, not just the
        /// obvious broadcast case.
        #[test]
        fn prop_own_messages_always_suppressed(
            contents in ".{0,64}",
            receivers in proptest::option::of(proptest::collection::vec("[a-z]{1,8}", 0..4)),
            hopcount in proptest::num::u32::ANY,
            orig_hopcount in proptest::num::u32::ANY,
            control in proptest::bool::ANY,
        ) {
            let h = harness("self-node");
            let message = OverlayMessage {
                sender: "self-node".to_string(),
                contents,
                receivers,
                hopcount,
                orig_hopcount,
                control,
            };

            prop_assert_eq!(h.dispatcher.dispatch(message), DispatchOutcome::OwnEcho);
            prop_assert!(h.recorder.messages.lock().is_empty());
            prop_assert_eq!(h.stats.snapshot().messages_rx, 0);
        }
    }
}
