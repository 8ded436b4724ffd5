//! Caller-visible error kinds. Internal-only failures (malformed datagrams, decode
//! failures, unknown transfers) are logged at the point of detection and never
//! surface here; see `router::dispatch` and `transfer`.

/// Errors returned by the four programmatic operations (`announce`, `list_peers`,
/// `send_text`, `send_file`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("timed out waiting for ack of {0}")]
    Timeout(String),

    #[error("integrity check failed for transfer {0}")]
    IntegrityFailure(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
