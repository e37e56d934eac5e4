//! Peer facade: ties config, ledger, store, dispatcher and initiators into
//! one handle for the daemon and for tests. Control-surface calls return
//! immediately after spawning the initiator; completion is observable via
//! [`Peer::describe_state`] or the returned join handle.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PeerConfig;
use crate::dispatcher::{Dispatcher, PeerContext};
use crate::initiator::{self, RequestError};
use crate::ledger::{Ledger, LedgerSnapshot, StateReport};
use crate::protocol::Payload;
use crate::store::ChunkStore;
use crate::transport::{Inbound, OutboundLink, Transport, TransportError};

pub struct Peer {
    ctx: Arc<PeerContext>,
}

impl Peer {
    pub fn new(config: PeerConfig, store: Arc<dyn ChunkStore>, transport: Arc<dyn Transport>) -> Self {
        Peer {
            ctx: PeerContext::new(config, store, OutboundLink::new(transport)),
        }
    }

    /// Bring a peer back up from a persisted ledger snapshot.
    pub fn from_snapshot(
        config: PeerConfig,
        snapshot: LedgerSnapshot,
        store: Arc<dyn ChunkStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Peer {
            ctx: PeerContext::with_ledger(
                config,
                Ledger::from_snapshot(snapshot),
                store,
                OutboundLink::new(transport),
            ),
        }
    }

    pub fn context(&self) -> Arc<PeerContext> {
        Arc::clone(&self.ctx)
    }

    /// Start consuming the transport's inbound stream. Runs until the
    /// sending side closes the channel.
    pub fn start(&self, inbox: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        Dispatcher::new(self.context()).run(inbox)
    }

    /// Enhanced peers announce themselves at startup so deleting peers can
    /// replay any DELETE this peer missed while offline.
    pub fn announce(&self) -> Result<(), TransportError> {
        if self.ctx.config.is_enhanced() {
            self.ctx.send(Payload::Control)?;
        }
        Ok(())
    }

    pub fn backup(&self, file_path: String, desired_replication: u32) -> JoinHandle<Result<(), RequestError>> {
        let ctx = self.context();
        tokio::spawn(async move { initiator::backup_file(ctx, &file_path, desired_replication).await })
    }

    pub fn restore(&self, file_path: String) -> JoinHandle<Result<(), RequestError>> {
        let ctx = self.context();
        tokio::spawn(async move { initiator::restore_file(ctx, &file_path).await })
    }

    pub fn delete(&self, file_path: String) -> JoinHandle<Result<(), RequestError>> {
        let ctx = self.context();
        tokio::spawn(async move { initiator::delete_file(ctx, &file_path).await })
    }

    pub fn reclaim(&self, target_bytes: u64) -> JoinHandle<Result<(), RequestError>> {
        let ctx = self.context();
        tokio::spawn(async move { initiator::reclaim_space(ctx, target_bytes).await })
    }

    pub fn describe_state(&self) -> StateReport {
        self.ctx.ledger.report()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ctx.ledger.snapshot()
    }
}
