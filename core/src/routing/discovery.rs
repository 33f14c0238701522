// Neighbor discovery — two-generation snapshot with per-round tokens
//
// The transport only says "a message arrived"; topology is invisible. Each
// round floods a TTL-1 probe carrying a fresh token. Direct neighbors echo
// the token back, responders land in the working set, and the next round
// publishes that set as the visible snapshot.

use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Round bookkeeping for the discovery protocol.
///
/// The periodic task (driven by the overlay facade) is the only caller of
/// [`advance_round`]; the receive path records responses. The published
/// generation swaps as a whole vector, so readers see either the previous
/// complete round or the new one, never a half-filled set.
///
/// [`advance_round`]: DiscoveryEngine::advance_round
#[derive(Debug, Default)]
pub(crate) struct DiscoveryEngine {
    /// Responders to the current round, insertion-ordered, deduplicated.
    working: Mutex<Vec<String>>,
    /// The last completed generation.
    published: RwLock<Vec<String>>,
    /// Correlation token of the round in flight. `None` until the first
    /// round starts.
    token: RwLock<Option<String>>,
}

impl DiscoveryEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Close the current round and open the next one: publish the working
    /// set, clear it, regenerate the token. Returns the new token for the
    /// outgoing probe.
    ///
    /// A response racing the publish/regenerate window can still land in the
    /// fresh working set under the old token. That approximation is
    /// deliberate; discovery promises liveness, not topology proof.
    pub(crate) fn advance_round(&self) -> String {
        let completed = std::mem::take(&mut *self.working.lock());
        debug!(neighbors = completed.len(), "publishing discovery round");
        *self.published.write() = completed;

        let token = uuid::Uuid::new_v4().to_string();
        *self.token.write() = Some(token.clone());
        token
    }

    /// Record a probe response. Only responses echoing the current round's
    /// token count; stale rounds are ignored. Returns whether the sender was
    /// accepted (already-recorded senders are accepted but not duplicated).
    pub(crate) fn record_response(&self, token: &str, sender: &str) -> bool {
        let current_matches = self
            .token
            .read()
            .as_deref()
            .is_some_and(|current| current == token);
        if !current_matches {
            return false;
        }

        let mut working = self.working.lock();
        if !working.iter().any(|id| id == sender) {
            working.push(sender.to_string());
        }
        true
    }

    /// The published snapshot: the most recently completed generation.
    pub(crate) fn neighbors(&self) -> Vec<String> {
        self.published.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn current_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Forget both generations and the token. Runs on a fresh join so a new
    /// session cannot publish the previous session's topology.
    pub(crate) fn reset(&self) {
        self.working.lock().clear();
        self.published.write().clear();
        *self.token.write() = None;
    }
}
