//! # Gateway State
//!
//! Holds the two pieces of shared mutable state the design calls out
//! explicitly: the routing-key registry (§4.1) and the per-tunnel
//! pending-response table (§4.2). Both are guarded by a plain
//! `tokio::sync::Mutex` rather than a sharded map like `dashmap`, because
//! bind/unbind need atomicity across the replace-then-close sequence that
//! a sharded map can't give for free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// A handle to one connected tunnel, as stored in the registry. Cloning is
/// cheap; every clone refers to the same underlying tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<Message>,
    pub cancel: CancellationToken,
}

impl TunnelHandle {
    /// Forcibly terminates this tunnel's read loop. Cooperative: the read
    /// loop notices the cancellation on its next `select!` poll and runs
    /// its cleanup path, which unbinds keys and resolves pending exchanges.
    pub fn force_close(&self) {
        self.cancel.cancel();
    }
}

/// The routing-key → tunnel registry. At most one tunnel is bound to a key
/// at any instant (§3 invariant 1).
#[derive(Default)]
pub struct Registry {
    bindings: Mutex<HashMap<String, TunnelHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `tunnel` for `key`, forcibly closing any tunnel previously
    /// bound to that key. The prior tunnel's read loop will observe the
    /// cancellation and run its own cleanup; this call does not wait for it.
    pub async fn bind(&self, key: String, tunnel: TunnelHandle) {
        let mut bindings = self.bindings.lock().await;
        if let Some(previous) = bindings.insert(key, tunnel) {
            previous.force_close();
        }
    }

    pub async fn lookup(&self, key: &str) -> Option<TunnelHandle> {
        self.bindings.lock().await.get(key).cloned()
    }

    /// Removes the binding for `key` only if it still points at `tunnel_id`.
    /// Guards against a race where a newer tunnel has already replaced this
    /// one by the time the old tunnel's cleanup runs (§9 redesign: identity
    /// is checked by minted id, never the raw peer-address string).
    pub async fn unbind(&self, key: &str, tunnel_id: Uuid) {
        let mut bindings = self.bindings.lock().await;
        if let Some(current) = bindings.get(key) {
            if current.id == tunnel_id {
                bindings.remove(key);
            }
        }
    }

    /// Returns every currently bound routing key, for the status endpoint.
    pub async fn keys(&self) -> Vec<String> {
        self.bindings.lock().await.keys().cloned().collect()
    }
}

/// The outcome delivered to a waiting retransmit handler.
#[derive(Debug)]
pub enum ExchangeOutcome {
    /// The agent's response, already in canonical HTTP/1.1 wire form.
    Response(Vec<u8>),
    /// The owning tunnel disconnected before a response arrived.
    TunnelClosed,
}

type Rendezvous = oneshot::Sender<ExchangeOutcome>;

/// Per-tunnel mapping of exchange id → rendezvous, per §4.2.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<Uuid, HashMap<Uuid, Rendezvous>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a fresh rendezvous for `(tunnel_id, exchange_id)` and
    /// returns the receiving half. Callers MUST call this before writing
    /// the outbound frame — a fast agent response arriving before the
    /// entry exists would otherwise be dropped as unroutable.
    pub async fn create(&self, tunnel_id: Uuid, exchange_id: Uuid) -> oneshot::Receiver<ExchangeOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        inner.entry(tunnel_id).or_default().insert(exchange_id, tx);
        rx
    }

    /// Delivers a response frame to its waiting rendezvous, if still
    /// present. A missing entry means the exchange already timed out or
    /// was cancelled; the response is logged and dropped.
    pub async fn deliver(&self, tunnel_id: Uuid, exchange_id: Uuid, body: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        let delivered = inner
            .get_mut(&tunnel_id)
            .and_then(|submap| submap.remove(&exchange_id))
            .map(|tx| tx.send(ExchangeOutcome::Response(body)).is_ok())
            .unwrap_or(false);
        if !delivered {
            warn!(%tunnel_id, %exchange_id, "late or unroutable response, dropping");
        }
    }

    /// Removes the rendezvous for `(tunnel_id, exchange_id)` without
    /// resolving it, used when the waiting side gives up (timeout).
    pub async fn cancel(&self, tunnel_id: Uuid, exchange_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(submap) = inner.get_mut(&tunnel_id) {
            submap.remove(&exchange_id);
        }
    }

    /// Resolves every pending exchange on `tunnel_id` with an error and
    /// clears the submap. Called exactly once, from the read loop's
    /// cleanup path on disconnect.
    pub async fn broadcast_error_for_tunnel(&self, tunnel_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(submap) = inner.remove(&tunnel_id) {
            for (_, tx) in submap {
                let _ = tx.send(ExchangeOutcome::TunnelClosed);
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub pending: Arc<PendingTable>,
    pub retransmit_timeout: Duration,
}

impl AppState {
    pub fn new(retransmit_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            pending: Arc::new(PendingTable::new()),
            retransmit_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TunnelHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        TunnelHandle {
            id: Uuid::new_v4(),
            tx,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn bind_then_lookup_finds_tunnel() {
        let registry = Registry::new();
        let h = handle();
        let id = h.id;
        registry.bind("/a".to_string(), h).await;
        let found = registry.lookup("/a").await.unwrap();
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn rebind_forces_close_on_previous() {
        let registry = Registry::new();
        let first = handle();
        let first_cancel = first.cancel.clone();
        registry.bind("/a".to_string(), first).await;
        assert!(!first_cancel.is_cancelled());

        let second = handle();
        let second_id = second.id;
        registry.bind("/a".to_string(), second).await;

        assert!(first_cancel.is_cancelled());
        assert_eq!(registry.lookup("/a").await.unwrap().id, second_id);
    }

    #[tokio::test]
    async fn unbind_is_identity_safe() {
        let registry = Registry::new();
        let first = handle();
        let first_id = first.id;
        registry.bind("/a".to_string(), first).await;

        let second = handle();
        let second_id = second.id;
        registry.bind("/a".to_string(), second).await;

        // Stale cleanup from the first tunnel must not evict the second.
        registry.unbind("/a", first_id).await;
        assert_eq!(registry.lookup("/a").await.unwrap().id, second_id);

        registry.unbind("/a", second_id).await;
        assert!(registry.lookup("/a").await.is_none());
    }

    #[tokio::test]
    async fn pending_table_create_then_deliver_round_trips() {
        let table = PendingTable::new();
        let tid = Uuid::new_v4();
        let eid = Uuid::new_v4();
        let rx = table.create(tid, eid).await;
        table.deliver(tid, eid, b"hello".to_vec()).await;
        match rx.await.unwrap() {
            ExchangeOutcome::Response(body) => assert_eq!(body, b"hello"),
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn pending_table_broadcast_error_resolves_all() {
        let table = PendingTable::new();
        let tid = Uuid::new_v4();
        let rx_a = table.create(tid, Uuid::new_v4()).await;
        let rx_b = table.create(tid, Uuid::new_v4()).await;
        table.broadcast_error_for_tunnel(tid).await;
        assert!(matches!(rx_a.await.unwrap(), ExchangeOutcome::TunnelClosed));
        assert!(matches!(rx_b.await.unwrap(), ExchangeOutcome::TunnelClosed));
    }

    #[tokio::test]
    async fn late_delivery_after_cancel_is_dropped_not_panicking() {
        let table = PendingTable::new();
        let tid = Uuid::new_v4();
        let eid = Uuid::new_v4();
        let _rx = table.create(tid, eid).await;
        table.cancel(tid, eid).await;
        table.deliver(tid, eid, b"late".to_vec()).await;
    }
}
