//! Wire codec: text messages of the LAN protocol, verb-prefixed and
//! whitespace-separated. Validates only the verb and minimum positional
//! fields; semantic checks (base64 well-formedness, non-negative sizes)
//! are the consumer's job. A malformed datagram decodes to `DecodeError`
//! and is logged and dropped by the router: it never aborts the receive
//! loop.

use std::fmt;

/// Reason carried by a NACK: either a hash mismatch (terminal) or a list of
/// chunk sequence numbers the receiver is still missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackReason {
    HashMismatch,
    MissingSeqs(Vec<u32>),
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::HashMismatch => write!(f, "hash mismatch"),
            NackReason::MissingSeqs(seqs) => {
                let parts: Vec<String> = seqs.iter().map(|s| s.to_string()).collect();
                write!(f, "{}", parts.join(" "))
            }
        }
    }
}

/// A decoded protocol message. Internal code only ever matches on this;
/// nothing downstream of the codec re-parses strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat { name: String, port: u16 },
    Talk { uid: String, text: String },
    Ack { id: String },
    Nack { uid: String, reason: NackReason },
    File { uid: String, filename: String, size: u64 },
    Chunk { uid: String, seq: u32, payload_b64: String },
    End { uid: String, hash: String },
}

/// Error decoding a datagram into a `Message`. Internal-only: logged and
/// the datagram is dropped, never surfaced to a caller.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown verb: {0}")]
    UnknownVerb(String),
    #[error("missing field(s) for {verb}")]
    MissingField { verb: &'static str },
    #[error("malformed field for {verb}: {detail}")]
    MalformedField { verb: &'static str, detail: String },
}

/// Encode a message into the ASCII wire form (no trailing newline; one datagram).
pub fn encode(msg: &Message) -> String {
    match msg {
        Message::Heartbeat { name, port } => format!("HEARTBEAT {name} {port}"),
        Message::Talk { uid, text } => format!("TALK {uid} {text}"),
        Message::Ack { id } => format!("ACK {id}"),
        Message::Nack { uid, reason } => format!("NACK {uid} {reason}"),
        Message::File { uid, filename, size } => format!("FILE {uid} {filename} {size}"),
        Message::Chunk { uid, seq, payload_b64 } => {
            format!("CHUNK {uid}_{seq} {seq} {payload_b64}")
        }
        Message::End { uid, hash } => format!("END {uid}_end {hash}"),
    }
}

/// Decode a single UDP datagram (already UTF-8 validated to `&str`) into a `Message`.
pub fn decode(raw: &str) -> Result<Message, DecodeError> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    let mut it = raw.splitn(2, ' ');
    let verb = it.next().filter(|s| !s.is_empty()).ok_or(DecodeError::Empty)?;
    let rest = it.next().unwrap_or("").trim_start();

    match verb {
        "HEARTBEAT" => {
            let mut parts = rest.split_whitespace();
            let name = parts.next().ok_or(DecodeError::MissingField { verb: "HEARTBEAT" })?;
            let port = parts
                .next()
                .ok_or(DecodeError::MissingField { verb: "HEARTBEAT" })?
                .parse::<u16>()
                .map_err(|e| DecodeError::MalformedField { verb: "HEARTBEAT", detail: e.to_string() })?;
            Ok(Message::Heartbeat { name: name.to_string(), port })
        }
        "TALK" => {
            let mut parts = rest.splitn(2, ' ');
            let uid = parts.next().filter(|s| !s.is_empty()).ok_or(DecodeError::MissingField { verb: "TALK" })?;
            let text = parts.next().ok_or(DecodeError::MissingField { verb: "TALK" })?;
            Ok(Message::Talk { uid: uid.to_string(), text: text.to_string() })
        }
        "ACK" => {
            let id = rest.split_whitespace().next().ok_or(DecodeError::MissingField { verb: "ACK" })?;
            Ok(Message::Ack { id: id.to_string() })
        }
        "NACK" => {
            let mut parts = rest.splitn(2, ' ');
            let uid = parts.next().filter(|s| !s.is_empty()).ok_or(DecodeError::MissingField { verb: "NACK" })?;
            let reason_str = parts.next().unwrap_or("").trim();
            let reason = if reason_str == "hash mismatch" {
                NackReason::HashMismatch
            } else {
                let mut seqs = Vec::new();
                for tok in reason_str.split_whitespace() {
                    let n = tok.parse::<u32>().map_err(|e| DecodeError::MalformedField {
                        verb: "NACK",
                        detail: e.to_string(),
                    })?;
                    seqs.push(n);
                }
                NackReason::MissingSeqs(seqs)
            };
            Ok(Message::Nack { uid: uid.to_string(), reason })
        }
        "FILE" => {
            let mut parts = rest.split_whitespace();
            let uid = parts.next().ok_or(DecodeError::MissingField { verb: "FILE" })?;
            let filename = parts.next().ok_or(DecodeError::MissingField { verb: "FILE" })?;
            let size = parts
                .next()
                .ok_or(DecodeError::MissingField { verb: "FILE" })?
                .parse::<u64>()
                .map_err(|e| DecodeError::MalformedField { verb: "FILE", detail: e.to_string() })?;
            Ok(Message::File { uid: uid.to_string(), filename: filename.to_string(), size })
        }
        "CHUNK" => {
            let mut parts = rest.splitn(3, ' ');
            let composite = parts.next().ok_or(DecodeError::MissingField { verb: "CHUNK" })?;
            let (uid, _seq_from_composite) = composite.rsplit_once('_').ok_or(DecodeError::MalformedField {
                verb: "CHUNK",
                detail: "missing '_' in composite id".to_string(),
            })?;
            let seq_str = parts.next().ok_or(DecodeError::MissingField { verb: "CHUNK" })?;
            let seq = seq_str
                .parse::<u32>()
                .map_err(|e| DecodeError::MalformedField { verb: "CHUNK", detail: e.to_string() })?;
            let payload_b64 = parts.next().ok_or(DecodeError::MissingField { verb: "CHUNK" })?;
            Ok(Message::Chunk { uid: uid.to_string(), seq, payload_b64: payload_b64.to_string() })
        }
        "END" => {
            let mut parts = rest.split_whitespace();
            let composite = parts.next().ok_or(DecodeError::MissingField { verb: "END" })?;
            let uid = composite.strip_suffix("_end").ok_or(DecodeError::MalformedField {
                verb: "END",
                detail: "missing '_end' suffix".to_string(),
            })?;
            let hash = parts.next().ok_or(DecodeError::MissingField { verb: "END" })?;
            Ok(Message::End { uid: uid.to_string(), hash: hash.to_string() })
        }
        other => Err(DecodeError::UnknownVerb(other.to_string())),
    }
}

/// The composite identifier used by the router's dedup set for CHUNK frames.
pub fn chunk_dedup_id(uid: &str, seq: u32) -> String {
    format!("{uid}_{seq}")
}

/// The composite identifier used on the wire (and for ack matching) for an END frame.
pub fn end_id(uid: &str) -> String {
    format!("{uid}_end")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_heartbeat() {
        let msg = Message::Heartbeat { name: "alice".into(), port: 5000 };
        let wire = encode(&msg);
        assert_eq!(wire, "HEARTBEAT alice 5000");
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn roundtrip_talk_with_spaces() {
        let msg = Message::Talk { uid: "123".into(), text: "hello there world".into() };
        let wire = encode(&msg);
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn roundtrip_chunk() {
        let msg = Message::Chunk { uid: "42".into(), seq: 7, payload_b64: "aGVsbG8=".into() };
        let wire = encode(&msg);
        assert_eq!(wire, "CHUNK 42_7 7 aGVsbG8=");
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn roundtrip_end() {
        let msg = Message::End { uid: "9".into(), hash: "deadbeef".into() };
        let wire = encode(&msg);
        assert_eq!(wire, "END 9_end deadbeef");
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn nack_missing_seqs() {
        let msg = Message::Nack { uid: "1".into(), reason: NackReason::MissingSeqs(vec![2, 5, 9]) };
        let wire = encode(&msg);
        assert_eq!(wire, "NACK 1 2 5 9");
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn nack_hash_mismatch() {
        let msg = Message::Nack { uid: "1".into(), reason: NackReason::HashMismatch };
        let wire = encode(&msg);
        assert_eq!(wire, "NACK 1 hash mismatch");
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn malformed_datagram_is_dropped_not_panicking() {
        assert!(decode("").is_err());
        assert!(decode("GARBAGE verb here").is_err());
        assert!(decode("HEARTBEAT onlyname").is_err());
        assert!(decode("FILE uid name notanumber").is_err());
    }

    #[test]
    fn unknown_verb() {
        assert!(matches!(decode("FROBNICATE x"), Err(DecodeError::UnknownVerb(_))));
    }
}
