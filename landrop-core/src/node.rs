//! `Node`: the single entry point a host uses to join a LAN peer group.
//! Binds the transport, spawns the background tasks (T-recv, T-hb,
//! T-sweep), and exposes the four programmatic operations. `Clone`, so a
//! REPL task and a signal handler can share one handle.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use crate::ack::AckRegistry;
use crate::dedup::DedupCache;
use crate::error::{Error, Result};
use crate::peers::{self, PeerTable};
use crate::router::{self, RouterState};
use crate::transfer::{self, NackRegistry, TransferTable};
use crate::transport::{Transport, UdpTransport};

/// Everything `Node::bind` needs: the caller's announced name, the UDP port
/// to bind (and broadcast to), and where received files land.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub port: u16,
    pub dest_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { name: "node".to_string(), port: 5000, dest_dir: PathBuf::from(".") }
    }
}

/// Monotonic-millisecond identifier generator. A bare `SystemTime` reading
/// can repeat within the same millisecond under load; this bumps forward on
/// collision so every `uid` issued by this process is unique for the
/// lifetime of all concurrent in-flight operations, matching the "monotonic
/// millisecond clock is sufficient given the single-process constraint"
/// invariant.
struct UidGenerator {
    last: AtomicU64,
}

impl UidGenerator {
    fn new() -> Self {
        Self { last: AtomicU64::new(0) }
    }

    fn next(&self) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev + 1);
            match self.last.compare_exchange_weak(prev, candidate, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return candidate.to_string(),
                Err(actual) => prev = actual,
            }
        }
    }
}

struct Inner {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerTable>,
    acks: Arc<AckRegistry>,
    nacks: Arc<NackRegistry>,
    transfers: Arc<TransferTable>,
    uids: UidGenerator,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// A bound, running participant in the LAN peer group. Cloning shares the
/// same transport, tables, and background tasks.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    /// Bind the transport and start `T-recv`, `T-hb`, and `T-sweep`.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = UdpTransport::bind_std(config.port)?;
        let peers = PeerTable::new();
        let acks = AckRegistry::new();
        let nacks = NackRegistry::new();
        let transfers = TransferTable::new();
        let dedup = Arc::new(DedupCache::new());

        let state = RouterState { peers: peers.clone(), acks: acks.clone(), nacks: nacks.clone(), transfers: transfers.clone(), dedup };

        let mut tasks = Vec::new();
        tasks.push(router::spawn_receive_loop(transport.clone(), state, config.dest_dir.clone()));
        tasks.push(peers::spawn_heartbeat_loop(transport.clone(), config.name.clone(), transport.local_port(), config.port));
        tasks.push(peers::spawn_sweep_loop(peers.clone()));
        tasks.push(spawn_transfer_sweep_loop(transfers.clone()));

        let node = Self {
            inner: Arc::new(Inner {
                config,
                transport,
                peers,
                acks,
                nacks,
                transfers,
                uids: UidGenerator::new(),
                tasks: std::sync::Mutex::new(tasks),
            }),
        };
        node.announce().await?;
        Ok(node)
    }

    /// Send one immediate HEARTBEAT outside the regular period, so peers
    /// don't have to wait a full `HEARTBEAT_PERIOD` to discover this node.
    pub async fn announce(&self) -> Result<()> {
        peers::send_heartbeat(
            self.inner.transport.as_ref(),
            &self.inner.config.name,
            self.inner.transport.local_port(),
            self.inner.config.port,
        )
        .await?;
        Ok(())
    }

    /// Live peers as `(name, address, port, age)`, `age < PEER_TTL`.
    pub async fn list_peers(&self) -> Vec<(String, std::net::IpAddr, u16, Duration)> {
        self.inner.peers.list_live().await
    }

    /// Send a short text message to a named peer. `Error::PeerNotFound` if
    /// the name isn't currently live; `Error::Timeout` if no ACK arrives
    /// after `MAX_ATTEMPTS` retransmissions.
    pub async fn send_text(&self, name: &str, text: &str) -> Result<()> {
        let dest = self.resolve(name).await?;
        let uid = self.inner.uids.next();
        let frame = crate::codec::encode(&crate::codec::Message::Talk { uid: uid.clone(), text: text.to_string() });
        let sent = crate::ack::send_with_retransmit(&self.inner.acks, &uid, dest, || async {
            self.inner.transport.send_to(frame.as_bytes(), dest).await.map(|_| ())
        })
        .await;
        if sent {
            Ok(())
        } else {
            Err(Error::Timeout(uid))
        }
    }

    /// Send a file to a named peer. `Error::PeerNotFound`, `Error::FileNotFound`,
    /// `Error::Timeout`, or `Error::IntegrityFailure` (receiver rejected the
    /// hash; the target file is absent on the remote side).
    pub async fn send_file(&self, name: &str, path: &std::path::Path) -> Result<()> {
        let dest = self.resolve(name).await?;
        let data = tokio::fs::read(path).await.map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        let basename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "file".to_string());
        let uid = self.inner.uids.next();
        transfer::send_file(self.inner.transport.as_ref(), &self.inner.acks, &self.inner.nacks, dest, &uid, &basename, &data).await
    }

    async fn resolve(&self, name: &str) -> Result<SocketAddr> {
        self.inner.peers.resolve(name).await.ok_or_else(|| Error::PeerNotFound(name.to_string()))
    }

    /// Stop all background tasks. Dropping every `Node` handle does not
    /// implicitly do this (tasks are detached via `tokio::spawn`); callers
    /// that need a clean shutdown (e.g. before process exit on a signal)
    /// should call this explicitly.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

const TRANSFER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn spawn_transfer_sweep_loop(transfers: Arc<TransferTable>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TRANSFER_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            for (source, uid) in transfers.sweep_idle().await {
                tracing::info!(%source, %uid, "abandoned inbound transfer reclaimed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_generator_is_monotonic_even_under_clock_collision() {
        let gen = UidGenerator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(gen.next()));
        }
    }
}
