//! Transport: a dumb byte pipe. No retry logic of its own: the caller
//! (the pending-ack registry) owns retransmission. Abstracted behind a
//! trait so the reliability core can be driven by a fake transport in
//! tests, with `UdpTransport` as the real implementation over a single
//! broadcast-enabled UDP socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// The largest datagram the receive loop must be able to hold: a CHUNK
/// payload (800 raw bytes, base64-expanded) plus verb/id overhead, rounded
/// up to the largest legal UDP datagram.
pub const MAX_DATAGRAM: usize = 65_507;

/// The socket-send and socket-receive boundary the reliability core requires.
/// `send_to` must serialize concurrent callers itself (a shared send mutex
/// for a real socket); `recv_from` is expected to have a single caller (the
/// T-recv loop) and therefore takes `&self` rather than requiring external
/// synchronization.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> std::io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
    fn local_port(&self) -> u16;
}

/// Real transport: one UDP socket, reuse-address and broadcast enabled,
/// send/receive buffers enlarged. Sends are serialized by an internal mutex
/// so concurrent transfers never interleave bytes at the kernel boundary;
/// `tokio::net::UdpSocket::send_to` takes `&self` already, but the mutex
/// additionally gives callers a place to extend send-side bookkeeping
/// (e.g. pacing) without racing each other.
pub struct UdpTransport {
    socket: UdpSocket,
    send_lock: Mutex<()>,
    port: u16,
}

impl UdpTransport {
    /// Bind to `0.0.0.0:port` with `SO_REUSEADDR` and `SO_BROADCAST` set and
    /// enlarged socket buffers (best-effort; failures to enlarge are logged,
    /// not fatal).
    pub fn bind_std(port: u16) -> std::io::Result<Arc<Self>> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_reuse_address(true)?;
        socket2.set_broadcast(true)?;
        if let Err(e) = socket2.set_recv_buffer_size(2 * 1024 * 1024) {
            tracing::warn!(error = %e, "failed to enlarge receive buffer");
        }
        if let Err(e) = socket2.set_send_buffer_size(2 * 1024 * 1024) {
            tracing::warn!(error = %e, "failed to enlarge send buffer");
        }
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        socket2.bind(&addr.into())?;
        socket2.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let bound_port = socket.local_addr()?.port();
        Ok(Arc::new(Self { socket, send_lock: Mutex::new(()), port: bound_port }))
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> std::io::Result<usize> {
        let _guard = self.send_lock.lock().await;
        self.socket.send_to(buf, dest).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}
