//! Peer identity/version configuration and the protocol policy derived from it.

use std::net::IpAddr;

use crate::identity::PeerId;
use crate::protocol::ProtocolVersion;

/// Immutable per-process configuration, passed to every component at
/// construction. Never ambient state.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub peer_id: PeerId,
    pub version: ProtocolVersion,
    pub policy: Policy,
    /// TCP port every enhanced peer listens on for point-to-point chunk
    /// delivery. Shared across the group; a responder dials
    /// `(requester_ip, direct_port)`.
    pub direct_port: u16,
}

impl PeerConfig {
    pub fn new(peer_id: PeerId, version: ProtocolVersion, direct_port: u16) -> Self {
        let policy = Policy::for_version(&version);
        PeerConfig {
            peer_id,
            version,
            policy,
            direct_port,
        }
    }

    pub fn is_enhanced(&self) -> bool {
        self.version.is_enhanced()
    }

    /// Destination for a point-to-point chunk delivery toward `requester_ip`.
    pub fn direct_addr(&self, requester_ip: IpAddr) -> std::net::SocketAddr {
        std::net::SocketAddr::new(requester_ip, self.direct_port)
    }
}

/// Behavioral policy: timing windows and the enhanced-variant switches.
/// One object threaded through dispatcher, handlers and initiators instead
/// of two parallel baseline/enhanced code paths.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Desync window for PUTCHUNK handler invocations (uniform 0..=ms).
    pub putchunk_desync_ms: u64,
    /// Desync window for GETCHUNK handler invocations.
    pub getchunk_desync_ms: u64,
    /// Jitter window for STORED replies. Kept below the PUTCHUNK window so a
    /// reply lands inside other responders' desync delays.
    pub stored_reply_ms: u64,
    /// Jitter before a REMOVED-triggered re-backup, giving the degree a
    /// chance to self-heal through other peers' copies.
    pub removed_rebackup_ms: u64,
    /// Enhanced: deliver chunk bodies point-to-point instead of multicast.
    pub direct_chunk_delivery: bool,
    /// Enhanced: track ACK_DELETE confirmations per deleted file.
    pub track_delete_acks: bool,
    /// Enhanced: skip storing a chunk whose degree is already confirmed by
    /// STORED replies overheard during the desync delay.
    pub stored_shortcircuit: bool,
}

impl Policy {
    pub fn for_version(version: &ProtocolVersion) -> Self {
        let enhanced = version.is_enhanced();
        Policy {
            putchunk_desync_ms: 400,
            getchunk_desync_ms: 400,
            stored_reply_ms: 100,
            removed_rebackup_ms: 400,
            direct_chunk_delivery: enhanced,
            track_delete_acks: enhanced,
            stored_shortcircuit: enhanced,
        }
    }

    /// Collapse every delay window to zero. Test-only knob: keeps the retry
    /// and desync structure while making rounds run at full speed.
    pub fn with_zero_delays(mut self) -> Self {
        self.putchunk_desync_ms = 0;
        self.getchunk_desync_ms = 0;
        self.stored_reply_ms = 0;
        self.removed_rebackup_ms = 0;
        self
    }
}
