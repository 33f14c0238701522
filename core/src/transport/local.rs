// In-process mesh fabric — flooding, TTL decrement, injectable faults
//
// Stands in for a real mesh while exercising the whole overlay: frames flood
// breadth-first over an adjacency graph (full mesh until edges are shaped),
// each relay burns one hop, every node sees one copy, and the sender hears
// its own flood echoed back. The fabric reads the TTL out of each frame and
// re-stamps the decremented value per recipient.

use super::{
    mesh_scope, MeshLink, MeshParams, MeshSession, MeshTransport, TransportError, TransportSignal,
};
use crate::message::{decode_message, encode_message};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Signals queued per node before the fabric starts shedding frames.
const SIGNAL_QUEUE_DEPTH: usize = 64;

struct Node {
    signals: mpsc::Sender<TransportSignal>,
}

#[derive(Default)]
struct Fabric {
    nodes: HashMap<String, Node>,
    /// Undirected adjacency. Consulted only once shaped.
    edges: HashMap<String, HashSet<String>>,
    /// Full mesh until the first explicit edge is added.
    shaped: bool,
}

impl Fabric {
    fn adjacent(&self, id: &str) -> Vec<String> {
        if self.shaped {
            self.edges
                .get(id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            self.nodes.keys().filter(|n| *n != id).cloned().collect()
        }
    }

    /// Who hears a flood from `origin` with the given TTL, and with how many
    /// hops left at delivery. First entry is the loopback echo; after that,
    /// breadth-first with one decrement per edge, shortest path winning.
    fn plan_flood(
        &self,
        origin: &str,
        ttl: u32,
    ) -> Vec<(String, mpsc::Sender<TransportSignal>, u32)> {
        let mut deliveries = Vec::new();
        if let Some(node) = self.nodes.get(origin) {
            deliveries.push((origin.to_string(), node.signals.clone(), ttl));
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(origin.to_string());
        let mut frontier: VecDeque<(String, u32)> = VecDeque::new();
        if ttl > 0 {
            for neighbor in self.adjacent(origin) {
                if visited.insert(neighbor.clone()) {
                    frontier.push_back((neighbor, ttl - 1));
                }
            }
        }

        while let Some((id, remaining)) = frontier.pop_front() {
            // Gone nodes neither hear nor relay.
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            deliveries.push((id.clone(), node.signals.clone(), remaining));
            if remaining > 0 {
                for neighbor in self.adjacent(&id) {
                    if visited.insert(neighbor.clone()) {
                        frontier.push_back((neighbor, remaining - 1));
                    }
                }
            }
        }
        deliveries
    }
}

/// An in-process mesh shared by every link opened against it.
pub struct LocalMesh {
    scope: String,
    fabric: Arc<Mutex<Fabric>>,
}

impl LocalMesh {
    pub fn new(network_name: &str) -> Self {
        Self {
            scope: mesh_scope(network_name),
            fabric: Arc::new(Mutex::new(Fabric::default())),
        }
    }

    /// Add an undirected edge. The first call switches the fabric from the
    /// full-mesh default to the shaped topology.
    pub fn connect(&self, a: &str, b: &str) {
        let mut fabric = self.fabric.lock();
        fabric.shaped = true;
        fabric
            .edges
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        fabric
            .edges
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    /// Raise an offline signal at one node, as a flaky fabric would.
    pub fn knock_offline(&self, node_id: &str) {
        if let Some(node) = self.fabric.lock().nodes.get(node_id) {
            let _ = node.signals.try_send(TransportSignal::Offline);
        }
    }

    /// Raise a fabric fault at one node.
    pub fn inject_fault(&self, node_id: &str, cause: &str) {
        if let Some(node) = self.fabric.lock().nodes.get(node_id) {
            let _ = node
                .signals
                .try_send(TransportSignal::Faulted(cause.to_string()));
        }
    }

    /// Nodes currently registered on the fabric.
    pub fn node_count(&self) -> usize {
        self.fabric.lock().nodes.len()
    }
}

#[async_trait::async_trait]
impl MeshTransport for LocalMesh {
    async fn open(
        &self,
        node_id: &str,
        params: &MeshParams,
    ) -> Result<MeshSession, TransportError> {
        if params.scope != self.scope {
            return Err(TransportError::ScopeMismatch {
                fabric: self.scope.clone(),
                requested: params.scope.clone(),
            });
        }

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        {
            let mut fabric = self.fabric.lock();
            if fabric.nodes.contains_key(node_id) {
                return Err(TransportError::DuplicateNode(node_id.to_string()));
            }
            fabric.nodes.insert(
                node_id.to_string(),
                Node {
                    signals: signal_tx.clone(),
                },
            );
        }
        debug!(node = node_id, scope = %self.scope, "node registered on local fabric");

        // A local fabric is online the moment the link exists.
        let _ = signal_tx.try_send(TransportSignal::Online);

        Ok(MeshSession {
            link: Arc::new(LocalLink {
                node_id: node_id.to_string(),
                fabric: self.fabric.clone(),
            }),
            signals: signal_rx,
        })
    }
}

struct LocalLink {
    node_id: String,
    fabric: Arc<Mutex<Fabric>>,
}

#[async_trait::async_trait]
impl MeshLink for LocalLink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let message =
            decode_message(&frame).map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let deliveries = {
            let fabric = self.fabric.lock();
            if !fabric.nodes.contains_key(&self.node_id) {
                return Err(TransportError::LinkClosed);
            }
            fabric.plan_flood(&self.node_id, message.hopcount)
        };

        for (recipient, signals, hops_left) in deliveries {
            let mut copy = message.clone();
            copy.hopcount = hops_left;
            match encode_message(&copy) {
                Ok(bytes) => {
                    if signals
                        .try_send(TransportSignal::MessageArrived(bytes))
                        .is_err()
                    {
                        debug!(%recipient, "fabric queue full, shedding frame");
                    }
                }
                Err(e) => debug!(%recipient, error = %e, "dropping unencodable copy"),
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.fabric.lock().nodes.remove(&self.node_id);
        debug!(node = %self.node_id, "node left local fabric");
        Ok(())
    }
}
