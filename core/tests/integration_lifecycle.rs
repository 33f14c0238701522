//! Integration test: session lifecycle and fault handling
//!
//! Verifies join/leave semantics and how the overlay reacts to the mesh
//! changing its mind:
//! 1. A clean join/leave produces the canonical state change sequence
//! 2. A transport fault moves the session to Error with the cause attached
//! 3. A mesh-side offline parks sends without failing them
//! 4. Presence notices reach the remaining nodes as info callbacks
//! 5. Rejoining resets the traffic counters
//! 6. A panicking message subscriber never takes the session down
//!
//! Run with: cargo test --test integration_lifecycle

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use overmesh_core::{
    LinkState, LocalMesh, OverlayDelegate, OverlayMessage, PeerOverlay, StateChange,
};

// ============================================================================
// HARNESS
// ============================================================================

#[derive(Default)]
struct Collector {
    messages: Mutex<Vec<OverlayMessage>>,
    infos: Mutex<Vec<String>>,
    changes: Mutex<Vec<StateChange>>,
}

impl OverlayDelegate for Collector {
    fn on_state_changed(&self, change: StateChange) {
        self.changes.lock().push(change);
    }

    fn on_message(&self, message: OverlayMessage, _note: String) {
        self.messages.lock().push(message);
    }

    fn on_info(&self, note: String) {
        self.infos.lock().push(note);
    }
}

impl Collector {
    fn has_info(&self, needle: &str) -> bool {
        self.infos.lock().iter().any(|note| note.contains(needle))
    }
}

/// Subscriber that blows up on every delivery.
struct Grenade {
    infos: Mutex<Vec<String>>,
}

impl OverlayDelegate for Grenade {
    fn on_state_changed(&self, _change: StateChange) {}

    fn on_message(&self, _message: OverlayMessage, _note: String) {
        panic!("subscriber goes down");
    }

    fn on_info(&self, note: String) {
        self.infos.lock().push(note);
    }
}

fn profile(node: &str, network: &str) -> String {
    format!(
        r#"{{ "profiles": {{
            "default": {{
                "node_id": "{node}",
                "network_name": "{network}",
                "neighbor_query_interval_secs": 30
            }}
        }} }}"#
    )
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn bring_up(mesh: &Arc<LocalMesh>, node: &str, network: &str) -> (PeerOverlay, Arc<Collector>) {
    let overlay = PeerOverlay::new(mesh.clone());
    let collector = Arc::new(Collector::default());
    overlay.set_delegate(collector.clone());
    overlay
        .join(&profile(node, network), "default")
        .await
        .expect("join should succeed");
    {
        let overlay = overlay.clone();
        wait_until(&format!("{node} to come online"), move || {
            overlay.state() == LinkState::Online
        })
        .await;
    }
    (overlay, collector)
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_clean_lifecycle_state_sequence() {
    let mesh = Arc::new(LocalMesh::new("depot"));
    let (alpha, alpha_box) = bring_up(&mesh, "alpha", "depot").await;

    alpha.leave().await;
    assert_eq!(alpha.state(), LinkState::Offline);
    assert_eq!(alpha.node_id(), None, "a closed session drops the node id");

    // Step 1: three transitions, in order, with the canonical notes.
    let changes = alpha_box.changes.lock().clone();
    let notes: Vec<&str> = changes.iter().map(|c| c.note.as_str()).collect();
    assert_eq!(notes, ["Joining mesh", "Logged in", "Logout"]);

    // Step 2: each change reports the exact state it replaced.
    assert_eq!(changes[0].old, LinkState::Undefined);
    assert_eq!(changes[0].new, LinkState::Joining);
    assert_eq!(changes[2].new, LinkState::Offline);
    for pair in changes.windows(2) {
        assert_eq!(pair[1].old, pair[0].new, "transitions must chain without gaps");
    }

    // Step 3: leaving twice is a quiet no-op.
    alpha.leave().await;
    assert_eq!(alpha_box.changes.lock().len(), 3);

    println!("✅ Lifecycle test passed: Undefined → Joining → Online → Offline");
}

#[tokio::test]
async fn test_fault_signal_faults_the_session() {
    let mesh = Arc::new(LocalMesh::new("depot"));
    let (alpha, alpha_box) = bring_up(&mesh, "alpha", "depot").await;

    // Step 1: the fabric reports a hard fault on the link.
    mesh.inject_fault("alpha", "radio failure");
    {
        let alpha = alpha.clone();
        wait_until("the fault to surface", move || alpha.state() == LinkState::Error).await;
    }

    let faulted = alpha_box
        .changes
        .lock()
        .iter()
        .find(|c| c.new == LinkState::Error)
        .cloned()
        .expect("an Error transition must be reported");
    assert_eq!(faulted.old, LinkState::Online);
    assert_eq!(faulted.note, "Mesh link faulted");
    let cause = faulted.cause.expect("fault transitions carry a cause");
    assert!(cause.contains("radio failure"), "unexpected cause: {cause}");

    // Step 2: sends are parked, not failed, while faulted.
    let sent = alpha.broadcast("anyone there?").await.expect("silent policy");
    assert!(!sent);

    // Step 3: leave still cleans up.
    alpha.leave().await;
    assert_eq!(alpha.state(), LinkState::Offline);

    println!("✅ Fault test passed: Error state carries the transport cause");
}

#[tokio::test]
async fn test_mesh_offline_parks_sends() {
    let mesh = Arc::new(LocalMesh::new("depot"));
    let (alpha, _alpha_box) = bring_up(&mesh, "alpha", "depot").await;

    mesh.knock_offline("alpha");
    {
        let alpha = alpha.clone();
        wait_until("the offline signal to surface", move || {
            alpha.state() == LinkState::Offline
        })
        .await;
    }

    // The session still exists; the default policy just skips the send.
    let sent = alpha.broadcast("into the void").await.expect("silent policy");
    assert!(!sent);
    assert_eq!(alpha.message_count_tx(), 0);

    println!("✅ Offline test passed: sends park quietly while the mesh is down");
}

#[tokio::test]
async fn test_presence_notices_between_peers() {
    let mesh = Arc::new(LocalMesh::new("depot"));
    let (_alice, alice_box) = bring_up(&mesh, "alice", "depot").await;

    // Step 1: a node arriving floods an enter notice.
    let (bob, _bob_box) = bring_up(&mesh, "bob", "depot").await;
    wait_until("alice to hear bob arrive", || alice_box.has_info("bob joined the mesh")).await;

    // Step 2: a clean leave floods a departure notice.
    bob.leave().await;
    wait_until("alice to hear bob depart", || alice_box.has_info("bob left the mesh")).await;

    // Notices are control traffic; they never count as messages.
    assert!(alice_box.messages.lock().is_empty());

    println!("✅ Presence test passed: enter and leave notices surfaced as info");
}

#[tokio::test]
async fn test_rejoin_resets_traffic_counters() {
    let mesh = Arc::new(LocalMesh::new("depot"));
    let (alice, _alice_box) = bring_up(&mesh, "alice", "depot").await;
    let (bob, bob_box) = bring_up(&mesh, "bob", "depot").await;

    alice.broadcast("before the restart").await.expect("send should succeed");
    wait_until("bob to receive the broadcast", || {
        bob_box.messages.lock().len() == 1
    })
    .await;
    assert_eq!(alice.message_count_tx(), 1);
    assert_eq!(bob.message_count_rx(), 1);

    // A fresh join is a fresh tally.
    alice.leave().await;
    alice
        .join(&profile("alice", "depot"), "default")
        .await
        .expect("rejoin should succeed");
    assert_eq!(alice.message_count_tx(), 0);
    assert_eq!(alice.message_size_tx(), 0);

    // The peer keeps its own history.
    assert_eq!(bob.message_count_rx(), 1);

    println!("✅ Counter reset test passed: rejoin starts a fresh tally");
}

#[tokio::test]
async fn test_panicking_subscriber_is_contained() {
    let mesh = Arc::new(LocalMesh::new("depot"));

    let alice = PeerOverlay::new(mesh.clone());
    let grenade = Arc::new(Grenade { infos: Mutex::new(Vec::new()) });
    alice.set_delegate(grenade.clone());
    alice
        .join(&profile("alice", "depot"), "default")
        .await
        .expect("join should succeed");
    {
        let alice = alice.clone();
        wait_until("alice to come online", move || alice.state() == LinkState::Online).await;
    }

    let (bob, _bob_box) = bring_up(&mesh, "bob", "depot").await;

    // Two deliveries, two panics, zero casualties.
    bob.send_to("first", "alice").await.expect("send should succeed");
    bob.send_to("second", "alice").await.expect("send should succeed");
    {
        let alice = alice.clone();
        wait_until("both deliveries to be counted", move || {
            alice.message_count_rx() == 2
        })
        .await;
    }

    assert_eq!(alice.state(), LinkState::Online);
    assert!(grenade
        .infos
        .lock()
        .iter()
        .any(|note| note.contains("subscriber panicked")));

    println!("✅ Containment test passed: subscriber panics never drop the session");
}
