//! Outbound message plumbing. The protocol engine is transport-agnostic:
//! it talks to a [`Transport`] object and never owns a socket. The daemon
//! plugs in a UDP-multicast transport; tests plug in [`LocalHub`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::PeerId;
use crate::protocol::{Message, MessageKind};
use crate::wire::FrameEncodeError;

/// The three multicast channels of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    /// Everything that is not chunk data.
    Control,
    /// PUTCHUNK traffic.
    Backup,
    /// CHUNK traffic.
    Restore,
}

impl Group {
    /// Channel a message kind travels on.
    pub fn for_kind(kind: MessageKind) -> Group {
        match kind {
            MessageKind::PutChunk => Group::Backup,
            MessageKind::Chunk => Group::Restore,
            _ => Group::Control,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame encoding failed: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("no route to {0}")]
    NoRoute(SocketAddr),
    #[error("transport channel closed")]
    Closed,
}

/// Path a message arrived on. The CHUNK handler needs this to tell a
/// point-to-point delivery apart from its header-only multicast echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Group,
    Direct,
}

/// A message as received off the wire, with its origin address. The origin
/// is what enhanced peers use to open a point-to-point reply connection.
#[derive(Debug)]
pub struct Inbound {
    pub message: Message,
    pub from: SocketAddr,
    pub via: Via,
}

/// Message egress. Implementations must be cheap to call from async tasks;
/// slow sends belong behind a channel inside the implementation.
pub trait Transport: Send + Sync {
    fn send_group(&self, group: Group, message: &Message) -> Result<(), TransportError>;
    fn send_direct(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError>;
}

/// Shared handle the engine sends through. Routes each message to its
/// group by kind.
#[derive(Clone)]
pub struct OutboundLink {
    transport: Arc<dyn Transport>,
}

impl OutboundLink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        OutboundLink { transport }
    }

    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        self.transport
            .send_group(Group::for_kind(message.kind()), message)
    }

    pub fn send_direct(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        self.transport.send_direct(message, to)
    }
}

/// Uniform random delay in `[0, max_ms]`, used to desynchronize replies
/// across peers that all heard the same request.
pub fn desync_delay(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// In-process transport: wires any number of peers together through
/// channels so multi-peer scenarios run in one test binary. Group sends
/// reach every registered peer, the sender included, exactly like
/// multicast does.
#[derive(Default)]
pub struct LocalHub {
    peers: Mutex<HashMap<PeerId, Endpoint>>,
}

struct Endpoint {
    addr: SocketAddr,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalHub::default())
    }

    /// Attach a peer and hand back its inbox plus the loopback address the
    /// hub will report as that peer's origin.
    pub fn attach(&self, peer: PeerId) -> (mpsc::UnboundedReceiver<Inbound>, SocketAddr) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = SocketAddr::from(([127, 0, 0, 1], 40_000 + peer.0 as u16));
        self.peers.lock().insert(peer, Endpoint { addr, inbox: tx });
        (rx, addr)
    }

    pub fn detach(&self, peer: PeerId) {
        self.peers.lock().remove(&peer);
    }

    fn origin_of(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.lock().get(&peer).map(|e| e.addr)
    }
}

impl Transport for LocalHub {
    fn send_group(&self, _group: Group, message: &Message) -> Result<(), TransportError> {
        let from = self
            .origin_of(message.sender)
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
        let peers = self.peers.lock();
        for endpoint in peers.values() {
            // A detached receiver is a stopped peer, not an error.
            let _ = endpoint.inbox.send(Inbound {
                message: message.clone(),
                from,
                via: Via::Group,
            });
        }
        Ok(())
    }

    fn send_direct(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        let from = self
            .origin_of(message.sender)
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
        let peers = self.peers.lock();
        let endpoint = peers
            .values()
            .find(|e| e.addr == to)
            .ok_or(TransportError::NoRoute(to))?;
        endpoint
            .inbox
            .send(Inbound {
                message: message.clone(),
                from,
                via: Via::Direct,
            })
            .map_err(|_| TransportError::Closed)
    }
}
