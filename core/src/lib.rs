// Overmesh Core — Peer Overlay
//
// "Any node can flood a frame to every other node;
//  the overlay decides who was actually spoken to."
//
// Addressing, presence, discovery, and accounting above a mesh that only
// knows how to flood.

pub mod config;
pub mod message;
pub mod routing;
pub mod state;
pub mod stats;
pub mod transport;

use futures::future::join_all;
use parking_lot::RwLock;
use routing::{DiscoveryEngine, DispatchOutcome, Dispatcher};
use state::StateMachine;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use config::{parse_document, ConfigError, OverlayConfig, SendPolicy};
pub use message::{decode_message, encode_message, CodecError, OverlayMessage, UNBOUNDED_HOPS};
pub use state::{LinkState, StateChange};
pub use stats::{TrafficSnapshot, TrafficStats};
pub use transport::{
    LocalMesh, MeshLink, MeshParams, MeshSession, MeshTransport, TransportError, TransportSignal,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum OverlayError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Message rejected: {0}")]
    Codec(#[from] CodecError),
    #[error("No active mesh session")]
    NotJoined,
    #[error("Already joined a mesh")]
    AlreadyJoined,
    #[error("Mesh link not online")]
    NotOnline,
}

// ============================================================================
// OVERLAY DELEGATE
// ============================================================================

/// Callback interface for application events.
///
/// One observer at a time. Every callback runs on an overlay task; a panic
/// inside any of them is caught at the slot and never tears the session down.
pub trait OverlayDelegate: Send + Sync {
    /// The connection state changed. `change.old` is exact: notifications
    /// arrive in the same total order the transitions happened in.
    fn on_state_changed(&self, change: StateChange);
    /// A user message addressed to this node arrived.
    fn on_message(&self, message: OverlayMessage, note: String);
    /// An advisory the application may surface or ignore (presence notices,
    /// skipped parameters, contained subscriber failures).
    fn on_info(&self, note: String);
}

/// Shared slot holding the attached observer.
///
/// Callers clone the `Arc` out of the lock before invoking, so an observer
/// can detach or replace itself from inside a callback without deadlocking.
#[derive(Clone, Default)]
pub(crate) struct DelegateSlot {
    inner: Arc<RwLock<Option<Arc<dyn OverlayDelegate>>>>,
}

impl DelegateSlot {
    pub(crate) fn set(&self, delegate: Arc<dyn OverlayDelegate>) {
        *self.inner.write() = Some(delegate);
    }

    pub(crate) fn clear(&self) {
        *self.inner.write() = None;
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.inner.read().is_some()
    }

    fn observer(&self) -> Option<Arc<dyn OverlayDelegate>> {
        self.inner.read().clone()
    }

    pub(crate) fn notify_state_changed(&self, change: &StateChange) {
        if let Some(observer) = self.observer() {
            let change = change.clone();
            if catch_unwind(AssertUnwindSafe(move || observer.on_state_changed(change))).is_err() {
                warn!("state observer panicked; continuing");
            }
        }
    }

    /// `Err` means the observer panicked; the caller decides what to report.
    pub(crate) fn notify_message(&self, message: &OverlayMessage, note: &str) -> Result<(), ()> {
        let Some(observer) = self.observer() else {
            return Ok(());
        };
        let message = message.clone();
        let note = note.to_string();
        catch_unwind(AssertUnwindSafe(move || observer.on_message(message, note))).map_err(|_| {
            warn!("message observer panicked");
        })
    }

    pub(crate) fn notify_info(&self, note: &str) {
        if let Some(observer) = self.observer() {
            let note = note.to_string();
            if catch_unwind(AssertUnwindSafe(move || observer.on_info(note))).is_err() {
                warn!("info observer panicked; continuing");
            }
        }
    }
}

// ============================================================================
// PEER OVERLAY
// ============================================================================

/// Peer-to-peer messaging above a flooding mesh transport.
///
/// Cheap to clone; every clone shares the same session, state, and counters.
#[derive(Clone)]
pub struct PeerOverlay {
    /// How frames reach the mesh.
    transport: Arc<dyn MeshTransport>,
    /// The attached observer, if any.
    delegate: DelegateSlot,
    /// Connection lifecycle.
    state: Arc<StateMachine>,
    /// Per-session traffic counters.
    stats: Arc<TrafficStats>,
    /// Neighbor discovery generations.
    discovery: Arc<DiscoveryEngine>,
    /// Send behavior while not online; set by the active profile.
    send_policy: Arc<RwLock<SendPolicy>>,
    /// Live membership, when joined.
    session: Arc<RwLock<Option<Session>>>,
    /// Serializes join/leave so the lifecycle never races itself.
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

/// Everything owned by one joined membership.
struct Session {
    node_id: String,
    link: Arc<dyn MeshLink>,
    /// Flipped off at leave so late frames stop at the readiness gate.
    registered: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerOverlay {
    /// Create an overlay above the given mesh transport. Nothing touches the
    /// mesh until `join`.
    pub fn new(transport: Arc<dyn MeshTransport>) -> Self {
        // Initialize tracing (idempotent)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        Self {
            transport,
            delegate: DelegateSlot::default(),
            state: Arc::new(StateMachine::new()),
            stats: Arc::new(TrafficStats::new()),
            discovery: Arc::new(DiscoveryEngine::new()),
            send_policy: Arc::new(RwLock::new(SendPolicy::Silent)),
            session: Arc::new(RwLock::new(None)),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Select the `selector` profile out of `document`, register on the mesh,
    /// and start the session tasks.
    ///
    /// Returns once registration is initiated; `Online` arrives through the
    /// delegate when the mesh confirms reachability. Configuration and
    /// registration failures transition the state to `Error` and are also
    /// returned.
    pub async fn join(&self, document: &str, selector: &str) -> Result<(), OverlayError> {
        let _serialized = self.lifecycle.lock().await;
        if self.session.read().is_some() {
            return Err(OverlayError::AlreadyJoined);
        }

        let config = match config::parse_document(document, selector) {
            Ok(config) => config,
            Err(e) => {
                self.state.transition(
                    LinkState::Error,
                    Some(e.to_string()),
                    "Invalid configuration",
                    &self.delegate,
                );
                return Err(e.into());
            }
        };

        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        *self.send_policy.write() = config.send_policy;

        // Counters and neighbor generations span exactly one membership.
        self.stats.reset();
        self.discovery.reset();

        self.state
            .transition(LinkState::Joining, None, "Joining mesh", &self.delegate);
        if let Some(addr) = &config.listen_address {
            self.delegate
                .notify_info(&format!("listen address {addr} ignored by the mesh transport"));
        }

        let params = MeshParams::from_config(&config);
        let opened = match self.transport.open(&node_id, &params).await {
            Ok(opened) => opened,
            Err(e) => {
                self.state.transition(
                    LinkState::Error,
                    Some(e.to_string()),
                    "Mesh registration failed",
                    &self.delegate,
                );
                return Err(e.into());
            }
        };
        let MeshSession { link, signals } = opened;

        let registered = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            node_id.clone(),
            registered.clone(),
            self.delegate.clone(),
            self.discovery.clone(),
            self.stats.clone(),
        );

        let pump = tokio::spawn(run_event_pump(
            signals,
            shutdown_rx.clone(),
            dispatcher,
            self.state.clone(),
            self.delegate.clone(),
            link.clone(),
            node_id.clone(),
        ));
        let prober = tokio::spawn(run_discovery_rounds(
            config.query_interval(),
            shutdown_rx,
            self.state.clone(),
            self.discovery.clone(),
            self.delegate.clone(),
            link.clone(),
            node_id.clone(),
        ));

        info!(node = %node_id, network = %config.network_name, "joined mesh");
        *self.session.write() = Some(Session {
            node_id,
            link,
            registered,
            shutdown: shutdown_tx,
            tasks: vec![pump, prober],
        });
        Ok(())
    }

    /// Leave the mesh: announce departure (best-effort), stop the session
    /// tasks, close the link, and transition `Offline`, in that order.
    /// Leaving while not joined does nothing.
    pub async fn leave(&self) {
        let _serialized = self.lifecycle.lock().await;
        let Some(session) = self.session.write().take() else {
            return;
        };

        if self.state.current() == LinkState::Online {
            if let Err(e) = announce(
                &session.link,
                OverlayMessage::presence_leave(),
                &session.node_id,
                "departure notice",
            )
            .await
            {
                debug!(error = %e, "departure notice failed");
            }
        }

        session.registered.store(false, Ordering::SeqCst);
        let _ = session.shutdown.send(true);
        let _ = session.link.close().await;
        join_all(session.tasks).await;

        self.state
            .transition(LinkState::Offline, None, "Logout", &self.delegate);
        info!(node = %session.node_id, "left mesh");
    }

    // ------------------------------------------------------------------------
    // SENDING
    // ------------------------------------------------------------------------

    /// Flood to every reachable node, unlimited hops.
    pub async fn broadcast(&self, contents: &str) -> Result<bool, OverlayError> {
        self.send_now(OverlayMessage::broadcast(contents)).await
    }

    /// Flood, but let the mesh stop relaying after `hop_limit` hops.
    pub async fn broadcast_within(
        &self,
        contents: &str,
        hop_limit: u32,
    ) -> Result<bool, OverlayError> {
        self.send_now(OverlayMessage::broadcast_within(contents, hop_limit))
            .await
    }

    /// Flood addressed to a single node; every other node filters it out.
    pub async fn send_to(&self, contents: &str, receiver: &str) -> Result<bool, OverlayError> {
        self.send_now(OverlayMessage::addressed(
            contents,
            vec![receiver.to_string()],
        ))
        .await
    }

    /// Flood addressed to a set of nodes.
    pub async fn send_to_many(
        &self,
        contents: &str,
        receivers: &[String],
    ) -> Result<bool, OverlayError> {
        self.send_now(OverlayMessage::addressed(contents, receivers.to_vec()))
            .await
    }

    /// The one handoff path behind every addressing mode. `Ok(true)` means
    /// the mesh took the frame; `Ok(false)` means the message was skipped
    /// under the silent policy.
    async fn send_now(&self, mut message: OverlayMessage) -> Result<bool, OverlayError> {
        let policy = *self.send_policy.read();

        // Clone the handles out; lock guards never cross an await.
        let (node_id, link) = {
            let guard = self.session.read();
            match guard.as_ref() {
                Some(session) => (session.node_id.clone(), session.link.clone()),
                None => {
                    return match policy {
                        SendPolicy::Silent => {
                            debug!("send skipped, no active session");
                            Ok(false)
                        }
                        SendPolicy::Strict => Err(OverlayError::NotJoined),
                    }
                }
            }
        };

        if self.state.current() != LinkState::Online {
            return match policy {
                SendPolicy::Silent => {
                    debug!("send skipped, link not online");
                    Ok(false)
                }
                SendPolicy::Strict => Err(OverlayError::NotOnline),
            };
        }

        if message.sender.is_empty() {
            message.sender = node_id;
        }
        let frame = encode_message(&message)?;

        match link.send(frame).await {
            Ok(()) => {
                if !message.control {
                    self.stats.record_sent(message.contents.len());
                }
                Ok(true)
            }
            Err(e) => {
                self.state.transition(
                    LinkState::Error,
                    Some(e.to_string()),
                    "Error sending message",
                    &self.delegate,
                );
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------------
    // OBSERVATION
    // ------------------------------------------------------------------------

    /// Node id of the active session, if one exists.
    pub fn node_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.node_id.clone())
    }

    pub fn state(&self) -> LinkState {
        self.state.current()
    }

    /// Neighbor snapshot from the last completed discovery round,
    /// insertion-ordered and deduplicated.
    pub fn neighbors(&self) -> Vec<String> {
        self.discovery.neighbors()
    }

    /// Point-in-time copy of the session traffic counters.
    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    pub fn message_count_rx(&self) -> u64 {
        self.stats.snapshot().messages_rx
    }

    pub fn message_count_tx(&self) -> u64 {
        self.stats.snapshot().messages_tx
    }

    pub fn message_size_rx(&self) -> u64 {
        self.stats.snapshot().bytes_rx
    }

    pub fn message_size_tx(&self) -> u64 {
        self.stats.snapshot().bytes_tx
    }

    /// Total hops traveled by all received user messages.
    pub fn hop_count_sum(&self) -> u64 {
        self.stats.snapshot().hop_count_sum
    }

    /// Overlay protocol revision baked into the mesh scope.
    pub fn version(&self) -> &'static str {
        transport::PROTOCOL_VERSION
    }

    // ------------------------------------------------------------------------
    // DELEGATE
    // ------------------------------------------------------------------------

    pub fn set_delegate(&self, delegate: Arc<dyn OverlayDelegate>) {
        self.delegate.set(delegate);
    }

    pub fn clear_delegate(&self) {
        self.delegate.clear();
    }
}

// ============================================================================
// SESSION TASKS
// ============================================================================

/// Drains transport signals for one session. Exits on the shutdown signal or
/// when the transport drops its end of the channel.
async fn run_event_pump(
    mut signals: mpsc::Receiver<TransportSignal>,
    mut shutdown: watch::Receiver<bool>,
    dispatcher: Dispatcher,
    state: Arc<StateMachine>,
    delegate: DelegateSlot,
    link: Arc<dyn MeshLink>,
    node_id: String,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            signal = signals.recv() => {
                let Some(signal) = signal else {
                    debug!(node = %node_id, "transport signal channel closed");
                    break;
                };
                match signal {
                    TransportSignal::Online => {
                        let note = if state.current() == LinkState::Joining {
                            "Logged in"
                        } else {
                            "Online"
                        };
                        state.transition(LinkState::Online, None, note, &delegate);
                        announce_or_fault(
                            &link,
                            OverlayMessage::presence_enter(),
                            &node_id,
                            "presence announcement",
                            &state,
                            &delegate,
                        )
                        .await;
                    }
                    TransportSignal::Offline => {
                        state.transition(LinkState::Offline, None, "Offline", &delegate);
                    }
                    TransportSignal::Faulted(cause) => {
                        warn!(node = %node_id, %cause, "mesh link faulted");
                        state.transition(LinkState::Error, Some(cause), "Mesh link faulted", &delegate);
                    }
                    TransportSignal::MessageArrived(frame) => {
                        let message = match decode_message(&frame) {
                            Ok(message) => message,
                            Err(e) => {
                                debug!(node = %node_id, error = %e, "dropping undecodable frame");
                                continue;
                            }
                        };
                        if let DispatchOutcome::ProbeReply(reply) = dispatcher.dispatch(message) {
                            announce_or_fault(&link, reply, &node_id, "probe reply", &state, &delegate)
                                .await;
                        }
                    }
                }
            }
        }
    }
    info!(node = %node_id, "event pump stopped");
}

/// Advances a discovery round and floods a fresh probe every interval.
/// Rounds advance even while offline; only the probe itself is skipped.
async fn run_discovery_rounds(
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<StateMachine>,
    discovery: Arc<DiscoveryEngine>,
    delegate: DelegateSlot,
    link: Arc<dyn MeshLink>,
    node_id: String,
) {
    info!(node = %node_id, interval_secs = interval.as_secs(), "discovery rounds started");
    loop {
        // A round that lost the race against shutdown is discarded, never
        // published or probed.
        if *shutdown.borrow() {
            break;
        }
        let token = discovery.advance_round();
        if state.current() == LinkState::Online {
            announce_or_fault(
                &link,
                OverlayMessage::probe(&token),
                &node_id,
                "neighbor probe",
                &state,
                &delegate,
            )
            .await;
        } else {
            debug!(node = %node_id, "skipping neighbor probe, link not online");
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(node = %node_id, "discovery rounds stopped");
}

/// Stamp, encode, and hand one control message to the mesh. The caller
/// decides what a transport refusal means; control frames sit far under the
/// codec caps, so an encode failure is only logged.
async fn announce(
    link: &Arc<dyn MeshLink>,
    mut message: OverlayMessage,
    node_id: &str,
    what: &str,
) -> Result<(), TransportError> {
    message.sender = node_id.to_string();
    match encode_message(&message) {
        Ok(frame) => link.send(frame).await,
        Err(e) => {
            debug!(error = %e, "{what} failed to encode");
            Ok(())
        }
    }
}

/// Control send during an active session. A transport refusal faults the
/// session with the same note a failed user send carries; a session that
/// cannot reach the mesh does not keep reporting `Online`.
async fn announce_or_fault(
    link: &Arc<dyn MeshLink>,
    message: OverlayMessage,
    node_id: &str,
    what: &str,
    state: &StateMachine,
    delegate: &DelegateSlot,
) {
    if let Err(e) = announce(link, message, node_id, what).await {
        warn!(node = %node_id, error = %e, "{what} failed");
        state.transition(
            LinkState::Error,
            Some(e.to_string()),
            "Error sending message",
            delegate,
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
