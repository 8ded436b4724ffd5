//! File transfer manager: sender and receiver state machines for a single
//! `uid`. Chunking, hashing, and NACK-driven selective retransmit all live
//! here; the pending-ack registry (`crate::ack`) only ever sees opaque
//! identifiers, never file bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::fs;
use tokio::sync::{Mutex, Notify};

use crate::ack::{send_with_retransmit, AckRegistry, ACK_WAIT, MAX_ATTEMPTS};
use crate::codec::{chunk_dedup_id, encode, end_id, Message, NackReason};
use crate::error::{Error, Result};
use crate::integrity::hash_hex;
use crate::transport::Transport;

/// Raw bytes of file data carried per CHUNK (before base64 expansion).
pub const CHUNK_SIZE: usize = 800;
/// Delay between successive chunk sends, to avoid overrunning the kernel's
/// send buffer on a fast local link.
const CHUNK_PACING: Duration = Duration::from_millis(1);
/// How long inbound transfer state survives with no activity before the
/// periodic sweep reclaims it (a sender that vanished mid-transfer).
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub fn total_chunks(size: u64) -> u32 {
    if size == 0 {
        0
    } else {
        ((size + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64) as u32
    }
}

/// Reject any filename that is not a single plain path component: no `/`,
/// no `..`, no absolute paths. Returns the sanitized basename.
fn sanitize_basename(name: &str) -> Option<String> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    }
}

/// Resolve `basename` against `dir`, appending `_1`, `_2`, … before the
/// extension until the result does not collide with an existing file.
async fn resolve_target_path(dir: &Path, basename: &str) -> PathBuf {
    let candidate = dir.join(basename);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let stem = Path::new(basename).file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = Path::new(basename).extension().map(|e| e.to_string_lossy().into_owned());
    let mut n: u32 = 1;
    loop {
        let candidate_name = match &ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = dir.join(&candidate_name);
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

struct InboundTransfer {
    target_path: PathBuf,
    total_chunks: u32,
    received: HashMap<u32, Vec<u8>>,
    started_at: Instant,
}

/// Inbound transfer state, keyed by `(source, uid)` rather than bare `uid`:
/// two peers racing to use the same millisecond-derived identifier must not
/// be able to inject CHUNK/END into each other's transfer.
#[derive(Default)]
pub struct TransferTable {
    inner: Mutex<HashMap<(SocketAddr, String), InboundTransfer>>,
}

impl TransferTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `FILE uid filename size` from `source`. A filename that escapes its
    /// directory is rejected outright: logged, no ACK, no state created, so
    /// the sender simply times out rather than silently losing the file.
    pub async fn on_file(
        &self,
        transport: &dyn Transport,
        source: SocketAddr,
        uid: &str,
        filename: &str,
        size: u64,
        dest_dir: &Path,
    ) -> std::io::Result<()> {
        let Some(basename) = sanitize_basename(filename) else {
            tracing::warn!(%filename, %source, "rejected FILE with unsafe filename, dropping");
            return Ok(());
        };

        let key = (source, uid.to_string());
        let mut table = self.inner.lock().await;
        if !table.contains_key(&key) {
            let target_path = resolve_target_path(dest_dir, &basename).await;
            tracing::info!(%uid, %source, path = ?target_path, size, "starting inbound transfer");
            table.insert(
                key,
                InboundTransfer {
                    target_path,
                    total_chunks: total_chunks(size),
                    received: HashMap::new(),
                    started_at: Instant::now(),
                },
            );
        }
        drop(table);
        send_ack(transport, source, uid).await
    }

    /// `CHUNK uid_seq seq payload` from `source`. Unknown transfer: dropped.
    /// Already-received `seq`: dropped silently (the sender is retransmitting
    /// after its ACK was lost; the router's dedup on `uid_seq` normally
    /// absorbs exact retransmits before this is even called, this guards
    /// against reordered duplicates as well).
    pub async fn on_chunk(
        &self,
        transport: &dyn Transport,
        source: SocketAddr,
        uid: &str,
        seq: u32,
        payload_b64: &str,
    ) -> std::io::Result<()> {
        let decoded = match BASE64.decode(payload_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, %uid, seq, "malformed CHUNK payload, dropping");
                return Ok(());
            }
        };

        let key = (source, uid.to_string());
        let mut table = self.inner.lock().await;
        let Some(transfer) = table.get_mut(&key) else {
            tracing::debug!(%uid, %source, "CHUNK for unknown transfer, dropping");
            return Ok(());
        };
        if transfer.received.contains_key(&seq) {
            return Ok(());
        }
        transfer.received.insert(seq, decoded);
        drop(table);
        send_ack(transport, source, &chunk_dedup_id(uid, seq)).await
    }

    /// `END uid_end hash` from `source`. Missing chunks: NACK with the list,
    /// transfer state survives. All present: write, hash-check, ACK or
    /// (on mismatch) delete + NACK; state is destroyed either way.
    pub async fn on_end(
        &self,
        transport: &dyn Transport,
        source: SocketAddr,
        uid: &str,
        expected_hash: &str,
    ) -> std::io::Result<()> {
        let key = (source, uid.to_string());
        let (target_path, ordered_bytes) = {
            let table = self.inner.lock().await;
            let Some(transfer) = table.get(&key) else {
                tracing::debug!(%uid, %source, "END for unknown transfer, dropping");
                return Ok(());
            };
            let missing: Vec<u32> =
                (0..transfer.total_chunks).filter(|seq| !transfer.received.contains_key(seq)).collect();
            if !missing.is_empty() {
                drop(table);
                tracing::debug!(%uid, %source, missing = missing.len(), "END with chunks still missing");
                return send_nack(transport, source, uid, NackReason::MissingSeqs(missing)).await;
            }
            let mut ordered: Vec<(u32, &Vec<u8>)> = transfer.received.iter().map(|(s, b)| (*s, b)).collect();
            ordered.sort_by_key(|(seq, _)| *seq);
            let bytes: Vec<u8> = ordered.into_iter().flat_map(|(_, b)| b.clone()).collect();
            (transfer.target_path.clone(), bytes)
        };

        if let Err(e) = fs::write(&target_path, &ordered_bytes).await {
            tracing::warn!(error = %e, path = ?target_path, "failed to write received file");
            self.inner.lock().await.remove(&key);
            return Err(e);
        }

        let local_hash = hash_hex(&ordered_bytes);
        self.inner.lock().await.remove(&key);
        if local_hash == expected_hash {
            tracing::info!(%uid, %source, path = ?target_path, "transfer complete");
            send_ack(transport, source, &end_id(uid)).await
        } else {
            tracing::warn!(%uid, %source, "hash mismatch, discarding file");
            if let Err(e) = fs::remove_file(&target_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, path = ?target_path, "failed to remove corrupted file");
                }
            }
            send_nack(transport, source, uid, NackReason::HashMismatch).await
        }
    }

    /// Reclaim transfers abandoned mid-stream (sender vanished). Returns the
    /// `(source, uid)` pairs removed, for logging by the caller.
    pub async fn sweep_idle(&self) -> Vec<(SocketAddr, String)> {
        let mut table = self.inner.lock().await;
        let now = Instant::now();
        let stale: Vec<(SocketAddr, String)> = table
            .iter()
            .filter(|(_, t)| now.duration_since(t.started_at) > TRANSFER_IDLE_TIMEOUT)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            table.remove(key);
        }
        stale
    }
}

async fn send_ack(transport: &dyn Transport, dest: SocketAddr, id: &str) -> std::io::Result<()> {
    let frame = encode(&Message::Ack { id: id.to_string() });
    transport.send_to(frame.as_bytes(), dest).await.map(|_| ())
}

async fn send_nack(transport: &dyn Transport, dest: SocketAddr, uid: &str, reason: NackReason) -> std::io::Result<()> {
    let frame = encode(&Message::Nack { uid: uid.to_string(), reason });
    transport.send_to(frame.as_bytes(), dest).await.map(|_| ())
}

/// A NACK arriving mid-transfer interrupts the sender's wait on `END`'s ACK.
/// Kept separate from `AckRegistry` since it carries a payload (the reason)
/// rather than a bare acknowledgement, and only ever has one waiter: the
/// `send_file` call that owns this `uid`.
struct NackWaiter {
    notify: Notify,
    reason: Mutex<Option<NackReason>>,
}

/// Shared across every concurrent outbound transfer (one `Node`-wide
/// instance, mirroring `AckRegistry`), so the router can route an inbound
/// NACK to whichever `send_file` call currently owns that `uid`.
#[derive(Default)]
pub struct NackRegistry {
    inner: Mutex<HashMap<String, Arc<NackWaiter>>>,
}

impl NackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn register(&self, uid: &str) -> Arc<NackWaiter> {
        let waiter = Arc::new(NackWaiter { notify: Notify::new(), reason: Mutex::new(None) });
        self.inner.lock().await.insert(uid.to_string(), waiter.clone());
        waiter
    }

    /// Called by the router on inbound NACK. Returns `true` if a sender was
    /// actually waiting on this `uid`.
    pub async fn dispatch(&self, uid: &str, reason: NackReason) -> bool {
        let table = self.inner.lock().await;
        match table.get(uid) {
            Some(waiter) => {
                *waiter.reason.lock().await = Some(reason);
                waiter.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    async fn forget(&self, uid: &str) {
        self.inner.lock().await.remove(uid);
    }
}

enum EndOutcome {
    Acked,
    Nacked(NackReason),
    TimedOut,
}

async fn send_end_and_await(
    transport: &dyn Transport,
    acks: &AckRegistry,
    nacks: &NackRegistry,
    dest: SocketAddr,
    uid: &str,
    hash: &str,
) -> EndOutcome {
    let frame = encode(&Message::End { uid: uid.to_string(), hash: hash.to_string() });
    let id = end_id(uid);
    let waiter = nacks.register(uid).await;
    let entry = acks.register(&id, dest).await;

    let mut attempt = 1u32;
    loop {
        if attempt > 1 {
            acks.record_attempt(&id).await;
        }
        if let Err(e) = transport.send_to(frame.as_bytes(), dest).await {
            tracing::warn!(error = %e, %uid, "transient send error sending END");
        }

        let notified = waiter.notify.notified();
        tokio::pin!(notified);
        tokio::select! {
            acked = entry.wait(ACK_WAIT) => {
                if acked {
                    acks.forget(&id).await;
                    nacks.forget(uid).await;
                    return EndOutcome::Acked;
                }
            }
            _ = &mut notified => {
                acks.forget(&id).await;
                let reason = waiter.reason.lock().await.take().unwrap_or(NackReason::HashMismatch);
                nacks.forget(uid).await;
                return EndOutcome::Nacked(reason);
            }
        }

        if attempt == MAX_ATTEMPTS {
            acks.forget(&id).await;
            nacks.forget(uid).await;
            return EndOutcome::TimedOut;
        }
        attempt += 1;
    }
}

async fn send_chunks(
    transport: &dyn Transport,
    acks: &AckRegistry,
    dest: SocketAddr,
    uid: &str,
    data: &[u8],
    seqs: &[u32],
) -> Result<()> {
    for &seq in seqs {
        let start = seq as usize * CHUNK_SIZE;
        let end = std::cmp::min(start + CHUNK_SIZE, data.len());
        let raw = &data[start..end];
        let payload_b64 = BASE64.encode(raw);
        let frame = encode(&Message::Chunk { uid: uid.to_string(), seq, payload_b64 });
        let id = chunk_dedup_id(uid, seq);
        let ok = send_with_retransmit(acks, &id, dest, || async {
            transport.send_to(frame.as_bytes(), dest).await.map(|_| ())
        })
        .await;
        if !ok {
            return Err(Error::Timeout(uid.to_string()));
        }
        tokio::time::sleep(CHUNK_PACING).await;
    }
    Ok(())
}

/// Sender-side state machine for one outbound `uid`: `SEND_FILE` →
/// (`SEND_CHUNKS` unless empty) → `SEND_END`, with NACK-driven selective
/// retransmit and terminal abort on hash mismatch.
pub async fn send_file(
    transport: &dyn Transport,
    acks: &AckRegistry,
    nacks: &NackRegistry,
    dest: SocketAddr,
    uid: &str,
    basename: &str,
    data: &[u8],
) -> Result<()> {
    let file_frame = encode(&Message::File { uid: uid.to_string(), filename: basename.to_string(), size: data.len() as u64 });
    let file_sent = send_with_retransmit(acks, uid, dest, || async {
        transport.send_to(file_frame.as_bytes(), dest).await.map(|_| ())
    })
    .await;
    if !file_sent {
        return Err(Error::Timeout(uid.to_string()));
    }

    let total = total_chunks(data.len() as u64);
    if total > 0 {
        let all_seqs: Vec<u32> = (0..total).collect();
        send_chunks(transport, acks, dest, uid, data, &all_seqs).await?;
    }

    loop {
        let hash = hash_hex(data);
        match send_end_and_await(transport, acks, nacks, dest, uid, &hash).await {
            EndOutcome::Acked => return Ok(()),
            EndOutcome::TimedOut => return Err(Error::Timeout(uid.to_string())),
            EndOutcome::Nacked(NackReason::HashMismatch) => return Err(Error::IntegrityFailure(uid.to_string())),
            EndOutcome::Nacked(NackReason::MissingSeqs(seqs)) => {
                send_chunks(transport, acks, dest, uid, data, &seqs).await?;
            }
        }
    }
}
