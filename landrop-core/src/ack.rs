//! Pending-ack registry: the source of truth for "is this message still in
//! flight". Stop-and-wait per identifier, synchronous-waiter model (§4.4 /
//! design notes): the sender that owns a `uid` drives its own retransmit
//! loop and wakes immediately on ACK via a per-entry `Notify`, rather than
//! polling. A background sweep may only garbage-collect entries abandoned
//! by a caller that stopped waiting (e.g. a cancelled transfer); it never
//! retransmits on a caller's behalf.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

/// How long a single send waits for its ACK before retrying.
pub const ACK_WAIT: Duration = Duration::from_secs(5);
/// How many times a message is (re)sent before the operation is declared failed.
pub const MAX_ATTEMPTS: u32 = 5;

/// A message in flight, keyed by its wire identifier (`uid`, `uid_seq`, or
/// `uid_end`).
pub struct PendingEntry {
    pub dest: SocketAddr,
    pub first_send: Instant,
    attempts: AtomicU32,
    acked: AtomicBool,
    notify: Notify,
}

impl PendingEntry {
    /// Block until `ACK` is observed for this entry or `timeout` elapses.
    /// Returns `true` on ack, `false` on timeout. Safe against the ack
    /// arriving between the `acked` check and the wait: the `Notify` permit
    /// is stored if `notify_waiters` fires first, and we re-check `acked`
    /// immediately after waking.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.acked.load(Ordering::SeqCst) {
            return true;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        tokio::select! {
            _ = &mut notified => self.acked.load(Ordering::SeqCst),
            _ = tokio::time::sleep(timeout) => self.acked.load(Ordering::SeqCst),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Name-keyed (well, id-keyed) table of in-flight messages, one per
/// outstanding `uid`/`uid_seq`/`uid_end`.
#[derive(Default)]
pub struct AckRegistry {
    inner: Mutex<HashMap<String, Arc<PendingEntry>>>,
}

impl AckRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(HashMap::new()) })
    }

    /// Register a newly emitted (non-HEARTBEAT, non-ACK) message. `attempts`
    /// starts at 1: registering implies the first send already happened.
    pub async fn register(&self, id: &str, dest: SocketAddr) -> Arc<PendingEntry> {
        let entry = Arc::new(PendingEntry {
            dest,
            first_send: Instant::now(),
            attempts: AtomicU32::new(1),
            acked: AtomicBool::new(false),
            notify: Notify::new(),
        });
        self.inner.lock().await.insert(id.to_string(), entry.clone());
        entry
    }

    /// Record a retransmission of `id` (caller is about to resend the bytes).
    pub async fn record_attempt(&self, id: &str) {
        if let Some(entry) = self.inner.lock().await.get(id) {
            entry.attempts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// An `ACK <id>` arrived. Idempotent: acking twice is a no-op on the
    /// second call. Returns `true` if `id` was a known pending entry.
    pub async fn on_ack(&self, id: &str) -> bool {
        let table = self.inner.lock().await;
        match table.get(id) {
            Some(entry) => {
                entry.acked.store(true, Ordering::SeqCst);
                entry.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id`. Called by the owning caller once it has
    /// observed success (acked) or given up (attempts exhausted).
    pub async fn forget(&self, id: &str) {
        self.inner.lock().await.remove(id);
    }

    /// Background GC: remove entries that are unacked and old enough that no
    /// legitimate synchronous waiter could still be using them (abandoned by
    /// a cancelled caller). Never resends. Returns the ids removed.
    pub async fn gc_orphaned(&self, max_age: Duration) -> Vec<String> {
        let mut table = self.inner.lock().await;
        let now = Instant::now();
        let stale: Vec<String> = table
            .iter()
            .filter(|(_, e)| !e.acked.load(Ordering::SeqCst) && now.duration_since(e.first_send) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            table.remove(id);
        }
        stale
    }
}

/// Retransmission policy: resend up to `MAX_ATTEMPTS` times, waiting
/// `ACK_WAIT` after each send. `send_once` performs one on-the-wire send
/// (the caller provides this since it knows the bytes and destination).
/// Returns `true` on ack, `false` if all attempts are exhausted.
pub async fn send_with_retransmit<F, Fut>(
    registry: &AckRegistry,
    id: &str,
    dest: SocketAddr,
    mut send_once: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = send_once().await {
        tracing::warn!(error = %e, %id, "transient send error, will retry");
    }
    let entry = registry.register(id, dest).await;
    for attempt in 1..=MAX_ATTEMPTS {
        if entry.wait(ACK_WAIT).await {
            registry.forget(id).await;
            return true;
        }
        if attempt == MAX_ATTEMPTS {
            break;
        }
        registry.record_attempt(id).await;
        if let Err(e) = send_once().await {
            tracing::warn!(error = %e, %id, "transient send error, will retry");
        }
    }
    registry.forget(id).await;
    false
}
