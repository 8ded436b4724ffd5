//! Message router: classifies inbound datagrams by verb and dispatches to
//! the peer table, ack registry, or file transfer manager. Owns the dedup
//! cache that suppresses re-delivery of retransmitted application messages.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::ack::AckRegistry;
use crate::codec::{chunk_dedup_id, decode, Message};
use crate::dedup::DedupCache;
use crate::peers::PeerTable;
use crate::transfer::{NackRegistry, TransferTable};
use crate::transport::Transport;

/// Everything the router needs to dispatch one datagram. Cheap to clone
/// (every field is an `Arc`), so `T-recv` can hand a fresh copy to each
/// iteration without holding a borrow across `.await`.
#[derive(Clone)]
pub struct RouterState {
    pub peers: Arc<PeerTable>,
    pub acks: Arc<AckRegistry>,
    pub nacks: Arc<NackRegistry>,
    pub transfers: Arc<TransferTable>,
    pub dedup: Arc<DedupCache>,
}

/// Decode and dispatch one inbound datagram from `source`. Malformed
/// datagrams are logged and dropped; they never propagate an error to the
/// caller (the receive loop must keep running regardless of garbage on the
/// wire).
pub async fn dispatch(state: &RouterState, transport: &dyn Transport, source: SocketAddr, raw: &str, dest_dir: &Path) {
    let message = match decode(raw) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, %source, "malformed datagram, dropping");
            return;
        }
    };

    // END is deliberately exempt from the generic dedup pass: its wire
    // identifier (`uid_end`) is identical across every legitimate resend of
    // the same `uid` (the hash never changes between rounds), so treating
    // it like TALK/FILE would permanently suppress the second END of a
    // NACK-then-retry round. Idempotence instead falls out of the receiver
    // state machine itself: a duplicate END while chunks are still missing
    // just recomputes the same NACK, and a duplicate END after a definitive
    // outcome hits "unknown transfer" and is silently dropped (§4.7).
    let dedup_id = match &message {
        Message::Heartbeat { .. } | Message::End { .. } => None,
        Message::Talk { uid, .. } | Message::File { uid, .. } | Message::Ack { id: uid } | Message::Nack { uid, .. } => {
            Some(uid.clone())
        }
        Message::Chunk { uid, seq, .. } => Some(chunk_dedup_id(uid, *seq)),
    };

    if let Some(id) = &dedup_id {
        if state.dedup.seen(id).await {
            tracing::debug!(%id, %source, "duplicate message, dropping");
            return;
        }
    }

    if let Err(e) = dispatch_decoded(state, transport, source, message, dest_dir).await {
        tracing::warn!(error = %e, %source, "i/o error while handling inbound message");
    }
}

async fn dispatch_decoded(
    state: &RouterState,
    transport: &dyn Transport,
    source: SocketAddr,
    message: Message,
    dest_dir: &Path,
) -> std::io::Result<()> {
    match message {
        Message::Heartbeat { name, port } => {
            state.peers.upsert(&name, source.ip(), port).await;
            Ok(())
        }
        Message::Talk { uid, text } => {
            println!("[{source}] {text}");
            tracing::info!(%source, %uid, "received text message");
            let frame = crate::codec::encode(&Message::Ack { id: uid.clone() });
            transport.send_to(frame.as_bytes(), source).await.map(|_| ())
        }
        Message::Ack { id } => {
            state.acks.on_ack(&id).await;
            Ok(())
        }
        Message::Nack { uid, reason } => {
            state.nacks.dispatch(&uid, reason).await;
            Ok(())
        }
        Message::File { uid, filename, size } => {
            state.transfers.on_file(transport, source, &uid, &filename, size, dest_dir).await
        }
        Message::Chunk { uid, seq, payload_b64 } => {
            state.transfers.on_chunk(transport, source, &uid, seq, &payload_b64).await
        }
        Message::End { uid, hash } => state.transfers.on_end(transport, source, &uid, &hash).await,
    }
}

/// T-recv: the single receive loop for the bound socket. Decodes and routes
/// every inbound datagram; never exits on a bad datagram, only on a fatal
/// transport error (e.g. the socket itself is gone).
pub fn spawn_receive_loop(
    transport: Arc<dyn Transport>,
    state: RouterState,
    dest_dir: std::path::PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; crate::transport::MAX_DATAGRAM];
        loop {
            let (len, source) = match transport.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(error = %e, "receive loop terminated");
                    return;
                }
            };
            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                tracing::warn!(%source, "non-UTF-8 datagram, dropping");
                continue;
            };
            dispatch(&state, transport.as_ref(), source, text, &dest_dir).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Message};
    use base64::Engine as _;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<(SocketAddr, String)>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> std::io::Result<usize> {
            self.sent.lock().unwrap().push((dest, String::from_utf8_lossy(buf).into_owned()));
            Ok(buf.len())
        }
        async fn recv_from(&self, _buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            std::future::pending().await
        }
        fn local_port(&self) -> u16 {
            5000
        }
    }

    fn state() -> RouterState {
        RouterState {
            peers: PeerTable::new(),
            acks: AckRegistry::new(),
            nacks: NackRegistry::new(),
            transfers: TransferTable::new(),
            dedup: Arc::new(DedupCache::new()),
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[tokio::test]
    async fn heartbeat_upserts_peer_table() {
        let state = state();
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        let wire = encode(&Message::Heartbeat { name: "alice".into(), port: 5000 });
        dispatch(&state, &transport, addr(), &wire, Path::new(".")).await;
        assert!(state.peers.resolve("alice").await.is_some());
    }

    #[tokio::test]
    async fn talk_acks_and_prints() {
        let state = state();
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        let wire = encode(&Message::Talk { uid: "1".into(), text: "hi there".into() });
        dispatch(&state, &transport, addr(), &wire, Path::new(".")).await;
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].1, "ACK 1");
    }

    #[tokio::test]
    async fn duplicate_talk_is_suppressed() {
        let state = state();
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        let wire = encode(&Message::Talk { uid: "1".into(), text: "hi".into() });
        dispatch(&state, &transport, addr(), &wire, Path::new(".")).await;
        dispatch(&state, &transport, addr(), &wire, Path::new(".")).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ack_resolves_pending_entry() {
        let state = state();
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        let entry = state.acks.register("1", addr()).await;
        let wire = encode(&Message::Ack { id: "1".into() });
        dispatch(&state, &transport, addr(), &wire, Path::new(".")).await;
        assert!(entry.wait(std::time::Duration::from_secs(0)).await);
    }

    #[tokio::test]
    async fn file_then_end_writes_to_dest_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        let source = addr();
        let data = b"router test payload";

        let file_wire = encode(&Message::File { uid: "9".into(), filename: "r.bin".into(), size: data.len() as u64 });
        dispatch(&state, &transport, source, &file_wire, dir.path()).await;

        let chunk_wire = encode(&Message::Chunk {
            uid: "9".into(),
            seq: 0,
            payload_b64: base64::engine::general_purpose::STANDARD.encode(data.as_slice()),
        });
        dispatch(&state, &transport, source, &chunk_wire, dir.path()).await;

        let end_wire = encode(&Message::End { uid: "9".into(), hash: crate::integrity::hash_hex(data) });
        dispatch(&state, &transport, source, &end_wire, dir.path()).await;

        assert_eq!(std::fs::read(dir.path().join("r.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn retried_end_after_nack_is_not_suppressed_by_dedup() {
        // Regression test for the END/dedup interaction: a second END for
        // the same uid (after a NACK round) must still be processed, even
        // though its wire identifier (`uid_end`) is identical to the first.
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        let source = addr();
        let data = vec![3u8; 2000];

        let file_wire = encode(&Message::File { uid: "5".into(), filename: "big.bin".into(), size: data.len() as u64 });
        dispatch(&state, &transport, source, &file_wire, dir.path()).await;

        let end_wire = encode(&Message::End { uid: "5".into(), hash: crate::integrity::hash_hex(&data) });
        dispatch(&state, &transport, source, &end_wire, dir.path()).await; // missing chunks -> NACK

        for (seq, chunk) in data.chunks(crate::transfer::CHUNK_SIZE).enumerate() {
            let chunk_wire = encode(&Message::Chunk {
                uid: "5".into(),
                seq: seq as u32,
                payload_b64: base64::engine::general_purpose::STANDARD.encode(chunk),
            });
            dispatch(&state, &transport, source, &chunk_wire, dir.path()).await;
        }

        dispatch(&state, &transport, source, &end_wire, dir.path()).await; // retry, same wire bytes

        assert_eq!(std::fs::read(dir.path().join("big.bin")).unwrap(), data);
    }
}
