//! Burrow wire protocol: message envelope, the eight message kinds, versioning.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{FileId, PeerId};

/// Baseline protocol version. Any other version string is an enhanced peer;
/// the wire shape never changes between variants, only behavioral policy.
pub const BASELINE_VERSION: &str = "1.0";

/// Maximum chunk body size in bytes. Also the fixed split size for backup.
pub const MAX_CHUNK_SIZE: usize = 64_000;

/// Protocol version carried by every message. `"1.0"` is baseline; anything
/// else denotes an enhanced peer (point-to-point restore, delete acks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub String);

impl ProtocolVersion {
    pub fn baseline() -> Self {
        ProtocolVersion(BASELINE_VERSION.to_string())
    }

    pub fn is_enhanced(&self) -> bool {
        self.0 != BASELINE_VERSION
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// All wire message kinds. Encoding is bincode; framing is length-prefix
/// (see wire module). One payload variant per protocol exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Offer a chunk for storage at the given replication degree.
    PutChunk {
        file_id: FileId,
        chunk_no: u32,
        desired_replication: u32,
        body: Vec<u8>,
    },
    /// Confirm that the sender stores the chunk.
    Stored { file_id: FileId, chunk_no: u32 },
    /// Request a stored chunk back.
    GetChunk { file_id: FileId, chunk_no: u32 },
    /// Chunk payload reply. An empty body from an enhanced sender on the
    /// group is the header-only echo of a point-to-point delivery; from a
    /// baseline sender it is a real zero-length final chunk.
    Chunk {
        file_id: FileId,
        chunk_no: u32,
        body: Vec<u8>,
    },
    /// Order every holder to drop all chunks of the file.
    Delete { file_id: FileId },
    /// Announce that the sender evicted a chunk it previously stored.
    Removed { file_id: FileId, chunk_no: u32 },
    /// Enhanced startup announcement; triggers DELETE replays (see handlers).
    Control,
    /// Enhanced delete confirmation from a former holder.
    AckDelete { file_id: FileId },
}

/// Routing/logging tag for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    PutChunk,
    Stored,
    GetChunk,
    Chunk,
    Delete,
    Removed,
    Control,
    AckDelete,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::PutChunk => "PUTCHUNK",
            MessageKind::Stored => "STORED",
            MessageKind::GetChunk => "GETCHUNK",
            MessageKind::Chunk => "CHUNK",
            MessageKind::Delete => "DELETE",
            MessageKind::Removed => "REMOVED",
            MessageKind::Control => "CONTROL",
            MessageKind::AckDelete => "ACK_DELETE",
        };
        write!(f, "{name}")
    }
}

/// Wire envelope: every exchange carries the sender's version and id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub version: ProtocolVersion,
    pub sender: PeerId,
    pub payload: Payload,
}

impl Message {
    pub fn new(version: ProtocolVersion, sender: PeerId, payload: Payload) -> Self {
        Message {
            version,
            sender,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::PutChunk { .. } => MessageKind::PutChunk,
            Payload::Stored { .. } => MessageKind::Stored,
            Payload::GetChunk { .. } => MessageKind::GetChunk,
            Payload::Chunk { .. } => MessageKind::Chunk,
            Payload::Delete { .. } => MessageKind::Delete,
            Payload::Removed { .. } => MessageKind::Removed,
            Payload::Control => MessageKind::Control,
            Payload::AckDelete { .. } => MessageKind::AckDelete,
        }
    }

    /// File the message refers to, if any (CONTROL is file-less).
    pub fn file_id(&self) -> Option<FileId> {
        match &self.payload {
            Payload::PutChunk { file_id, .. }
            | Payload::Stored { file_id, .. }
            | Payload::GetChunk { file_id, .. }
            | Payload::Chunk { file_id, .. }
            | Payload::Delete { file_id }
            | Payload::Removed { file_id, .. }
            | Payload::AckDelete { file_id } => Some(*file_id),
            Payload::Control => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_is_not_enhanced() {
        assert!(!ProtocolVersion::baseline().is_enhanced());
        assert!(ProtocolVersion("1.1".into()).is_enhanced());
        assert!(ProtocolVersion("2.0".into()).is_enhanced());
    }

    #[test]
    fn kind_matches_payload() {
        let msg = Message::new(
            ProtocolVersion::baseline(),
            PeerId(1),
            Payload::Stored {
                file_id: FileId::from_bytes([0; 32]),
                chunk_no: 3,
            },
        );
        assert_eq!(msg.kind(), MessageKind::Stored);
        assert!(msg.file_id().is_some());

        let ctl = Message::new(ProtocolVersion::baseline(), PeerId(1), Payload::Control);
        assert_eq!(ctl.kind(), MessageKind::Control);
        assert!(ctl.file_id().is_none());
    }
}
