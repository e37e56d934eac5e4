//! Inbound message routing. One [`Dispatcher`] per peer consumes the
//! transport's receive stream and fans every message out to its handler on
//! a fresh task, so handling never blocks the receive path.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PeerConfig;
use crate::handlers;
use crate::ledger::{ChunkKey, Ledger};
use crate::protocol::{Message, MessageKind, Payload};
use crate::store::ChunkStore;
use crate::transport::{desync_delay, Inbound, OutboundLink, TransportError};

/// Everything a handler or initiator needs, shared behind one `Arc`.
pub struct PeerContext {
    pub config: PeerConfig,
    pub ledger: Ledger,
    pub store: Arc<dyn ChunkStore>,
    pub outbound: OutboundLink,
}

impl PeerContext {
    pub fn new(
        config: PeerConfig,
        store: Arc<dyn ChunkStore>,
        outbound: OutboundLink,
    ) -> Arc<Self> {
        Self::with_ledger(config, Ledger::new(), store, outbound)
    }

    /// Build a context around a ledger restored from a snapshot.
    pub fn with_ledger(
        config: PeerConfig,
        ledger: Ledger,
        store: Arc<dyn ChunkStore>,
        outbound: OutboundLink,
    ) -> Arc<Self> {
        Arc::new(PeerContext {
            config,
            ledger,
            store,
            outbound,
        })
    }

    pub fn self_id(&self) -> crate::identity::PeerId {
        self.config.peer_id
    }

    /// Wrap a payload in this peer's envelope.
    pub fn message(&self, payload: Payload) -> Message {
        Message::new(self.config.version.clone(), self.config.peer_id, payload)
    }

    /// Group-send a payload under this peer's envelope.
    pub fn send(&self, payload: Payload) -> Result<(), TransportError> {
        self.outbound.send(&self.message(payload))
    }
}

/// Routes inbound messages to protocol handlers.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<PeerContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        Dispatcher { ctx }
    }

    /// Drain an inbox until the transport side closes it.
    pub fn run(self, mut inbox: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(inbound) = inbox.recv().await {
                self.dispatch(inbound);
            }
        })
    }

    /// Route one inbound message. Spawns the handler and returns at once.
    pub fn dispatch(&self, inbound: Inbound) {
        let Inbound { message, from, via } = inbound;
        let kind = message.kind();

        if message.sender == self.ctx.self_id() && !Self::echoed_kind(kind) {
            tracing::trace!(%kind, "dropping own message");
            return;
        }
        tracing::trace!(%kind, sender = %message.sender, "dispatching");

        let ctx = Arc::clone(&self.ctx);
        match message.payload {
            Payload::PutChunk {
                file_id,
                chunk_no,
                desired_replication,
                body,
            } => {
                let key = ChunkKey::new(file_id, chunk_no);
                // Arm early so STORED replies overheard during the desync
                // window can short-circuit the save.
                if ctx.config.policy.stored_shortcircuit {
                    ctx.ledger.arm_pending_confirmation(key, desired_replication);
                }
                let delay = desync_delay(ctx.config.policy.putchunk_desync_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    handlers::handle_putchunk(ctx, key, desired_replication, body).await;
                });
            }
            Payload::GetChunk { file_id, chunk_no } => {
                let key = ChunkKey::new(file_id, chunk_no);
                // Armed before the delay so an overheard CHUNK reply can
                // cancel this peer's own intended reply.
                ctx.ledger.arm_being_restored(key);
                let delay = desync_delay(ctx.config.policy.getchunk_desync_ms);
                let request_version = message.version.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    handlers::handle_getchunk(ctx, key, request_version, from).await;
                });
            }
            Payload::Stored { file_id, chunk_no } => {
                let key = ChunkKey::new(file_id, chunk_no);
                let sender = message.sender;
                tokio::spawn(async move {
                    handlers::handle_stored(ctx, key, sender);
                });
            }
            Payload::Chunk {
                file_id,
                chunk_no,
                body,
            } => {
                let key = ChunkKey::new(file_id, chunk_no);
                let sender_version = message.version.clone();
                tokio::spawn(async move {
                    handlers::handle_chunk(ctx, key, sender_version, body, via).await;
                });
            }
            Payload::Delete { file_id } => {
                tokio::spawn(async move {
                    handlers::handle_delete(ctx, file_id).await;
                });
            }
            Payload::Removed { file_id, chunk_no } => {
                let key = ChunkKey::new(file_id, chunk_no);
                let sender = message.sender;
                tokio::spawn(async move {
                    handlers::handle_removed(ctx, key, sender).await;
                });
            }
            Payload::Control => {
                let sender = message.sender;
                tokio::spawn(async move {
                    handlers::handle_control(ctx, sender);
                });
            }
            Payload::AckDelete { file_id } => {
                let sender = message.sender;
                tokio::spawn(async move {
                    handlers::handle_ack_delete(ctx, file_id, sender);
                });
            }
        }
    }

    /// Kinds a peer must process even when it sent them itself: they carry
    /// self-consistency updates or are legitimately echoed back.
    fn echoed_kind(kind: MessageKind) -> bool {
        matches!(
            kind,
            MessageKind::Removed
                | MessageKind::Stored
                | MessageKind::AckDelete
                | MessageKind::Control
        )
    }
}
