//! Protocol engine for a peer-to-peer distributed backup service.
//!
//! Peers cooperate over group channels and point-to-point links to
//! replicate file chunks, restore them on demand, delete them on request
//! and reclaim local space while preserving an agreed replication degree.
//! This crate is transport- and disk-agnostic: it speaks through the
//! [`transport::Transport`] and [`store::ChunkStore`] seams and leaves
//! sockets and filesystems to the embedding daemon.

pub mod config;
pub mod dispatcher;
mod handlers;
pub mod identity;
pub mod initiator;
pub mod ledger;
pub mod peer;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::{PeerConfig, Policy};
pub use identity::{file_digest, FileId, PeerId};
pub use initiator::RequestError;
pub use ledger::{ChunkKey, Ledger, LedgerSnapshot, StateReport};
pub use peer::Peer;
pub use protocol::{Message, MessageKind, Payload, ProtocolVersion, MAX_CHUNK_SIZE};
pub use store::{ChunkStore, MemoryStore, StoreError};
pub use transport::{Inbound, LocalHub, OutboundLink, Transport, TransportError, Via};
