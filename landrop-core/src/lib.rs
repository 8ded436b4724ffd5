//! Reliability core for a self-organizing LAN peer group: discovery over
//! periodic broadcast, acknowledged text messages, and chunked file
//! transfer with integrity verification, all over a single UDP port.
//!
//! [`Node`] is the entry point. Everything else in this crate is the
//! machinery `Node` wires together: a [`codec`] for the wire format, a
//! [`transport`] trait abstracting the socket, an [`ack`] registry and
//! [`dedup`] cache providing reliability over plain UDP, a [`peers`] table
//! tracking who is reachable, a [`transfer`] manager driving file transfer
//! state machines, and a [`router`] dispatching inbound datagrams to all of
//! the above.

pub mod ack;
pub mod codec;
pub mod dedup;
pub mod error;
pub mod integrity;
pub mod node;
pub mod peers;
pub mod router;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};
pub use node::{Node, NodeConfig};
