//! Peer table: name -> (address, port, last-seen), upserted on inbound
//! HEARTBEAT and swept on a timer. The sole name->address resolver for the
//! four programmatic operations.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::codec::{encode, Message};
use crate::transport::Transport;

/// Inactivity window after which a peer is considered gone.
pub const PEER_TTL: Duration = Duration::from_secs(10);
/// How often heartbeats are broadcast.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);
/// How often the sweeper checks for expired peers.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A reachable peer as seen by the local node.
#[derive(Debug, Clone)]
pub struct Peer {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    last_seen: Instant,
}

impl Peer {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Name-keyed table of live peers, refreshed by inbound HEARTBEAT and
/// pruned by a periodic sweep. A second HEARTBEAT for a known name updates
/// the entry in place rather than creating a duplicate.
#[derive(Default)]
pub struct PeerTable {
    inner: Mutex<HashMap<String, Peer>>,
}

impl PeerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(HashMap::new()) })
    }

    /// Upsert a peer's address from an inbound HEARTBEAT.
    pub async fn upsert(&self, name: &str, addr: IpAddr, port: u16) {
        let mut table = self.inner.lock().await;
        table.insert(name.to_string(), Peer { name: name.to_string(), addr, port, last_seen: Instant::now() });
    }

    /// Resolve a peer's socket address, but only if it is currently live
    /// (last-seen within `PEER_TTL`). This is the sole lookup path used by
    /// `send_text` and `send_file`.
    pub async fn resolve(&self, name: &str) -> Option<SocketAddr> {
        let table = self.inner.lock().await;
        let peer = table.get(name)?;
        if peer.age(Instant::now()) > PEER_TTL {
            return None;
        }
        Some(SocketAddr::new(peer.addr, peer.port))
    }

    /// Live peers (age < PEER_TTL), as `(name, addr, port, age)`.
    pub async fn list_live(&self) -> Vec<(String, IpAddr, u16, Duration)> {
        let table = self.inner.lock().await;
        let now = Instant::now();
        table
            .values()
            .filter(|p| p.age(now) <= PEER_TTL)
            .map(|p| (p.name.clone(), p.addr, p.port, p.age(now)))
            .collect()
    }

    /// Remove peers whose age exceeds `PEER_TTL`. Returns the removed names
    /// (for logging by the caller).
    pub async fn sweep(&self) -> Vec<String> {
        let mut table = self.inner.lock().await;
        let now = Instant::now();
        let stale: Vec<String> = table
            .iter()
            .filter(|(_, p)| p.age(now) > PEER_TTL)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            table.remove(name);
        }
        stale
    }
}

/// Send one HEARTBEAT immediately (used by `Node::announce` and at startup,
/// so peers don't have to wait a full period to discover this node).
pub async fn send_heartbeat(
    transport: &dyn Transport,
    name: &str,
    listen_port: u16,
    broadcast_port: u16,
) -> std::io::Result<()> {
    let frame = encode(&Message::Heartbeat { name: name.to_string(), port: listen_port });
    let dest: SocketAddr = ([255, 255, 255, 255], broadcast_port).into();
    transport.send_to(frame.as_bytes(), dest).await?;
    Ok(())
}

/// T-hb: broadcast a HEARTBEAT every `HEARTBEAT_PERIOD`.
pub fn spawn_heartbeat_loop(
    transport: Arc<dyn Transport>,
    name: String,
    listen_port: u16,
    broadcast_port: u16,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_PERIOD);
        loop {
            interval.tick().await;
            if let Err(e) = send_heartbeat(transport.as_ref(), &name, listen_port, broadcast_port).await {
                tracing::warn!(error = %e, "heartbeat send failed");
            }
        }
    })
}

/// T-sweep: remove peers whose last HEARTBEAT is older than `PEER_TTL`.
pub fn spawn_sweep_loop(peers: Arc<PeerTable>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = peers.sweep().await;
            for name in removed {
                tracing::info!(peer = %name, "peer expired");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_resolve() {
        let table = PeerTable::new();
        table.upsert("alice", "10.0.0.5".parse().unwrap(), 5000).await;
        let addr = table.resolve("alice").await.unwrap();
        assert_eq!(addr, "10.0.0.5:5000".parse().unwrap());
    }

    #[tokio::test]
    async fn unknown_peer_resolves_to_none() {
        let table = PeerTable::new();
        assert!(table.resolve("nobody").await.is_none());
    }

    #[tokio::test]
    async fn second_heartbeat_updates_in_place() {
        let table = PeerTable::new();
        table.upsert("alice", "10.0.0.5".parse().unwrap(), 5000).await;
        table.upsert("alice", "10.0.0.6".parse().unwrap(), 5001).await;
        let live = table.list_live().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].1, "10.0.0.6".parse::<IpAddr>().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_stale_peers() {
        let table = PeerTable::new();
        table.upsert("alice", "10.0.0.5".parse().unwrap(), 5000).await;
        tokio::time::advance(PEER_TTL + Duration::from_secs(1)).await;
        let removed = table.sweep().await;
        assert_eq!(removed, vec!["alice".to_string()]);
        assert!(table.resolve("alice").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn live_peer_not_swept() {
        let table = PeerTable::new();
        table.upsert("alice", "10.0.0.5".parse().unwrap(), 5000).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(table.resolve("alice").await.is_some());
    }
}
