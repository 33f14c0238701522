//! Mesh transport boundary — the collaborator the overlay runs on
//!
//! The overlay binds no sockets. It consumes an already-connected mesh
//! fabric through these traits: open a link into a scoped mesh, flood opaque
//! frames, react to membership signals. `local` ships an in-process fabric
//! used by the demo binary and the integration tests.

pub mod local;

use crate::config::OverlayConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use local::LocalMesh;

/// Protocol revision baked into the mesh scope so incompatible overlay
/// generations never share a fabric.
pub const PROTOCOL_VERSION: &str = "1";

/// The versioned identifier a link is opened against.
pub fn mesh_scope(network_name: &str) -> String {
    format!("overmesh/{PROTOCOL_VERSION}/{network_name}")
}

/// Binding parameters handed to the transport at open. The overlay treats
/// the security fields as opaque pass-through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshParams {
    pub scope: String,
    pub secure: bool,
    pub secret: Option<String>,
    /// Advisory only; transports decide their own binding.
    pub listen_address: Option<String>,
}

impl MeshParams {
    pub fn from_config(config: &OverlayConfig) -> Self {
        Self {
            scope: mesh_scope(&config.network_name),
            secure: config.use_secure_transport,
            secret: config.credential_secret.clone(),
            listen_address: config.listen_address.clone(),
        }
    }
}

/// Signals a transport raises at the overlay's event pump.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    /// The local peer is reachable on the mesh.
    Online,
    /// The local peer dropped off the mesh.
    Offline,
    /// One opaque frame arrived.
    MessageArrived(Vec<u8>),
    /// The fabric failed underneath us.
    Faulted(String),
}

impl fmt::Display for TransportSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSignal::Online => write!(f, "Online"),
            TransportSignal::Offline => write!(f, "Offline"),
            TransportSignal::MessageArrived(frame) => {
                write!(f, "MessageArrived {{ frame_len: {} }}", frame.len())
            }
            TransportSignal::Faulted(cause) => write!(f, "Faulted {{ cause: {cause} }}"),
        }
    }
}

/// Errors crossing the transport boundary.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Open failed: {0}")]
    OpenFailed(String),

    #[error("Mesh scope mismatch: fabric carries {fabric}, caller asked for {requested}")]
    ScopeMismatch { fabric: String, requested: String },

    #[error("Node id already on the mesh: {0}")]
    DuplicateNode(String),

    #[error("Link closed")]
    LinkClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// An open link plus the signal stream feeding the overlay's event pump.
pub struct MeshSession {
    pub link: Arc<dyn MeshLink>,
    pub signals: mpsc::Receiver<TransportSignal>,
}

// The link is an opaque trait object, so the derive is unavailable.
impl fmt::Debug for MeshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshSession").finish_non_exhaustive()
    }
}

/// A mesh fabric the overlay can join.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MeshTransport: Send + Sync {
    /// Register `node_id` on the fabric and hand back a live link.
    async fn open(
        &self,
        node_id: &str,
        params: &MeshParams,
    ) -> Result<MeshSession, TransportError>;
}

/// One node's handle on an open fabric.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MeshLink: Send + Sync {
    /// Flood one opaque frame toward every reachable peer.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Drop off the fabric. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}
