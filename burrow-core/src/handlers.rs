//! Protocol handlers, one per message kind. Each runs on its own task,
//! mutates the ledger and chunk store, and emits reply messages. No failure
//! here is fatal to the peer; everything is scoped to one chunk or file.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::dispatcher::PeerContext;
use crate::identity::{FileId, PeerId};
use crate::initiator;
use crate::ledger::ChunkKey;
use crate::protocol::{Payload, ProtocolVersion};
use crate::store::ChunkStore;
use crate::transport::{desync_delay, Via};

/// PUTCHUNK, responder role: store the offered chunk and confirm.
pub(crate) async fn handle_putchunk(
    ctx: Arc<PeerContext>,
    key: ChunkKey,
    desired_replication: u32,
    body: Vec<u8>,
) {
    // A peer never stores chunks of a file it originated.
    if ctx.ledger.originates_file(&key.file_id) {
        tracing::trace!(%key, "ignoring PUTCHUNK for own file");
        return;
    }
    // STORED replies overheard during the desync window may already cover
    // the desired degree; storing another copy would be redundant.
    if ctx.config.policy.stored_shortcircuit && ctx.ledger.pending_confirmation_achieved(&key) {
        tracing::debug!(%key, "replication already satisfied, skipping store");
        return;
    }

    if !ctx.ledger.has_stored_chunk(&key) {
        if let Err(err) = ctx.store.save(&key.file_id, key.chunk_no, &body) {
            // Terminal for this invocation; the initiator's next round is
            // the recovery path.
            tracing::warn!(%key, %err, "chunk save failed, no reply sent");
            return;
        }
    }
    ctx.ledger
        .add_stored_chunk(key, desired_replication, ctx.self_id());

    tokio::time::sleep(desync_delay(ctx.config.policy.stored_reply_ms)).await;
    if let Err(err) = ctx.send(Payload::Stored {
        file_id: key.file_id,
        chunk_no: key.chunk_no,
    }) {
        tracing::warn!(%key, %err, "failed to send STORED");
    }
}

/// STORED: one more peer confirms holding the chunk.
pub(crate) fn handle_stored(ctx: Arc<PeerContext>, key: ChunkKey, sender: PeerId) {
    ctx.ledger.record_stored_ack(key, sender);
}

/// GETCHUNK, responder role: reply with the chunk body unless another
/// peer's reply was overheard during the desync delay.
pub(crate) async fn handle_getchunk(
    ctx: Arc<PeerContext>,
    key: ChunkKey,
    request_version: ProtocolVersion,
    from: SocketAddr,
) {
    if ctx.ledger.chunk_reply_overheard(&key) {
        tracing::trace!(%key, "another peer already replied, standing down");
        ctx.ledger.clear_being_restored(&key);
        return;
    }
    if !ctx.ledger.has_stored_chunk(&key) {
        ctx.ledger.clear_being_restored(&key);
        return;
    }
    let body = match ctx.store.load(&key.file_id, key.chunk_no) {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(%key, %err, "chunk load failed, no reply sent");
            ctx.ledger.clear_being_restored(&key);
            return;
        }
    };
    ctx.ledger.clear_being_restored(&key);

    let reply = ctx.message(Payload::Chunk {
        file_id: key.file_id,
        chunk_no: key.chunk_no,
        body,
    });
    if ctx.config.policy.direct_chunk_delivery && request_version.is_enhanced() {
        // Bulk data goes point-to-point; a header-only echo on the group
        // tells other would-be responders to stand down.
        let to = ctx.config.direct_addr(from.ip());
        if let Err(err) = ctx.outbound.send_direct(&reply, to) {
            tracing::warn!(%key, %to, %err, "direct chunk delivery failed");
            return;
        }
        if let Err(err) = ctx.send(Payload::Chunk {
            file_id: key.file_id,
            chunk_no: key.chunk_no,
            body: Vec::new(),
        }) {
            tracing::warn!(%key, %err, "failed to send chunk echo");
        }
    } else if let Err(err) = ctx.outbound.send(&reply) {
        tracing::warn!(%key, %err, "failed to send CHUNK");
    }
}

/// CHUNK, requester role: collect restore replies and reassemble the file
/// once every chunk index is covered.
pub(crate) async fn handle_chunk(
    ctx: Arc<PeerContext>,
    key: ChunkKey,
    sender_version: ProtocolVersion,
    body: Vec<u8>,
    via: Via,
) {
    // Suppress any reply this peer itself was about to send for the key.
    ctx.ledger.mark_chunk_reply_seen(key);

    if !ctx.ledger.is_restoring(&key.file_id) {
        return;
    }
    // An empty body on the group from an enhanced sender is the header-only
    // echo of a delivery that already arrived (or will arrive) directly;
    // acting on it would count the chunk twice. A baseline sender never
    // echoes: its empty body is a real zero-length final chunk.
    if sender_version.is_enhanced() && via == Via::Group && body.is_empty() {
        tracing::trace!(%key, "ignoring header-only chunk echo");
        return;
    }

    if let Some(done) = ctx.ledger.add_restored_chunk(key.file_id, key.chunk_no, body) {
        match ctx.store.store_restored(&done.file_path, &done.bytes) {
            Ok(()) => {
                tracing::info!(file = %done.file_path, bytes = done.bytes.len(), "restore complete");
            }
            Err(err) => {
                tracing::warn!(file = %done.file_path, %err, "failed to persist restored file");
            }
        }
    }
}

/// DELETE: drop every chunk of the file, index and disk, unconditionally.
pub(crate) async fn handle_delete(ctx: Arc<PeerContext>, file_id: FileId) {
    let chunk_nos = ctx.ledger.take_stored_file(&file_id);
    if chunk_nos.is_empty() {
        // Nothing held: repeated DELETE is a no-op.
        return;
    }
    for chunk_no in chunk_nos {
        if let Err(err) = ctx.store.delete(&file_id, chunk_no) {
            tracing::warn!(%file_id, chunk_no, %err, "chunk delete failed");
        }
    }
    tracing::debug!(%file_id, "deleted all local chunks");
    if ctx.config.is_enhanced() {
        if let Err(err) = ctx.send(Payload::AckDelete { file_id }) {
            tracing::warn!(%file_id, %err, "failed to send ACK_DELETE");
        }
    }
}

/// REMOVED: a peer evicted a chunk; repair the replication degree if this
/// peer can.
pub(crate) async fn handle_removed(ctx: Arc<PeerContext>, key: ChunkKey, sender: PeerId) {
    // Case 1: this peer still stores the chunk.
    if let Some((observed, desired)) = ctx.ledger.remove_stored_reporter(&key, sender) {
        if observed >= desired {
            return;
        }
        let body = match ctx.store.load(&key.file_id, key.chunk_no) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(%key, %err, "cannot reload chunk for re-backup");
                return;
            }
        };
        // Jitter first: other holders may repair the degree meanwhile.
        tokio::time::sleep(desync_delay(ctx.config.policy.removed_rebackup_ms)).await;
        if let Some((observed, desired)) = ctx.ledger.stored_degree(&key) {
            if observed >= desired {
                tracing::debug!(%key, "degree self-healed, skipping re-backup");
                return;
            }
            if let Err(err) = initiator::backup_chunk(ctx.clone(), key, desired, body).await {
                tracing::warn!(%key, %err, "re-backup after REMOVED failed");
            }
        }
        return;
    }

    // Case 2: this peer evicted the chunk itself and retained its body.
    // One-shot: the entry is consumed before the jitter so concurrent
    // REMOVED observations cannot redistribute twice.
    if let Some(info) = ctx.ledger.take_reclaimed_chunk(&key) {
        let Some(body) = info.body else {
            return;
        };
        tokio::time::sleep(desync_delay(ctx.config.policy.removed_rebackup_ms)).await;
        if let Err(err) =
            initiator::backup_chunk(ctx.clone(), key, info.desired_replication, body).await
        {
            tracing::warn!(%key, %err, "redistribution of reclaimed chunk failed");
        }
    }
}

/// CONTROL: a peer (re)joined; replay DELETE for files it still holds.
pub(crate) fn handle_control(ctx: Arc<PeerContext>, sender: PeerId) {
    if !ctx.config.policy.track_delete_acks {
        return;
    }
    for file_id in ctx.ledger.deleted_files_held_by(sender) {
        tracing::debug!(%file_id, peer = %sender, "replaying DELETE to returning holder");
        if let Err(err) = ctx.send(Payload::Delete { file_id }) {
            tracing::warn!(%file_id, %err, "failed to replay DELETE");
        }
    }
}

/// ACK_DELETE: a former holder confirms compliance.
pub(crate) fn handle_ack_delete(ctx: Arc<PeerContext>, file_id: FileId, sender: PeerId) {
    ctx.ledger.acknowledge_delete(&file_id, sender);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::protocol::{Message, MessageKind, ProtocolVersion};
    use crate::store::MemoryStore;
    use crate::transport::{Inbound, LocalHub, OutboundLink};
    use tokio::sync::mpsc;

    fn fid(b: u8) -> FileId {
        FileId::from_bytes([b; 32])
    }

    struct Harness {
        ctx: Arc<PeerContext>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
        addr: SocketAddr,
        store: Arc<MemoryStore>,
    }

    fn harness_with(hub: &Arc<LocalHub>, id: u32, version: ProtocolVersion) -> Harness {
        let (inbox, addr) = hub.attach(PeerId(id));
        let mut config = PeerConfig::new(PeerId(id), version, addr.port());
        config.policy = config.policy.with_zero_delays();
        let store = Arc::new(MemoryStore::new(1 << 20));
        let ctx = PeerContext::new(config, store.clone(), OutboundLink::new(hub.clone()));
        Harness {
            ctx,
            inbox,
            addr,
            store,
        }
    }

    fn harness(hub: &Arc<LocalHub>, id: u32) -> Harness {
        harness_with(hub, id, ProtocolVersion::baseline())
    }

    async fn recv_kind(inbox: &mut mpsc::UnboundedReceiver<Inbound>, kind: MessageKind) -> Message {
        loop {
            let inbound = inbox.recv().await.expect("inbox open");
            if inbound.message.kind() == kind {
                return inbound.message;
            }
        }
    }

    #[tokio::test]
    async fn putchunk_stores_and_confirms() {
        let hub = LocalHub::new();
        let mut h = harness(&hub, 1);
        let key = ChunkKey::new(fid(1), 0);

        handle_putchunk(h.ctx.clone(), key, 2, vec![1, 2, 3]).await;

        assert!(h.ctx.ledger.has_stored_chunk(&key));
        assert_eq!(h.store.load(&key.file_id, 0).unwrap(), vec![1, 2, 3]);
        let reply = recv_kind(&mut h.inbox, MessageKind::Stored).await;
        assert_eq!(reply.sender, PeerId(1));
    }

    #[tokio::test]
    async fn duplicate_putchunk_stores_once_confirms_twice() {
        let hub = LocalHub::new();
        let mut h = harness(&hub, 1);
        let key = ChunkKey::new(fid(2), 0);

        handle_putchunk(h.ctx.clone(), key, 1, vec![9; 10]).await;
        handle_putchunk(h.ctx.clone(), key, 1, vec![9; 10]).await;

        assert_eq!(h.store.chunk_count(), 1);
        recv_kind(&mut h.inbox, MessageKind::Stored).await;
        recv_kind(&mut h.inbox, MessageKind::Stored).await;
    }

    #[tokio::test]
    async fn putchunk_for_own_file_ignored() {
        let hub = LocalHub::new();
        let mut h = harness(&hub, 1);
        let key = ChunkKey::new(fid(3), 0);
        h.ctx.ledger.register_backup(fid(3));

        handle_putchunk(h.ctx.clone(), key, 1, vec![1]).await;

        assert!(!h.ctx.ledger.has_stored_chunk(&key));
        assert!(h.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn putchunk_no_space_no_reply() {
        let hub = LocalHub::new();
        let (mut inbox, addr) = hub.attach(PeerId(1));
        let mut config = PeerConfig::new(PeerId(1), ProtocolVersion::baseline(), addr.port());
        config.policy = config.policy.with_zero_delays();
        let ctx = PeerContext::new(
            config,
            Arc::new(MemoryStore::new(2)),
            OutboundLink::new(hub.clone()),
        );
        let key = ChunkKey::new(fid(4), 0);

        handle_putchunk(ctx.clone(), key, 1, vec![0; 100]).await;

        assert!(!ctx.ledger.has_stored_chunk(&key));
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn putchunk_shortcircuits_when_degree_confirmed() {
        let hub = LocalHub::new();
        let mut h = harness_with(&hub, 1, ProtocolVersion("1.1".into()));
        let key = ChunkKey::new(fid(5), 0);

        h.ctx.ledger.arm_pending_confirmation(key, 2);
        h.ctx.ledger.record_stored_ack(key, PeerId(2));
        h.ctx.ledger.record_stored_ack(key, PeerId(3));

        handle_putchunk(h.ctx.clone(), key, 2, vec![1]).await;

        assert!(!h.ctx.ledger.has_stored_chunk(&key));
        assert!(h.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn getchunk_replies_with_stored_body() {
        let hub = LocalHub::new();
        let mut h = harness(&hub, 1);
        let key = ChunkKey::new(fid(6), 2);
        h.store.save(&key.file_id, key.chunk_no, &[7; 16]).unwrap();
        h.ctx.ledger.add_stored_chunk(key, 1, PeerId(1));
        h.ctx.ledger.arm_being_restored(key);

        handle_getchunk(h.ctx.clone(), key, ProtocolVersion::baseline(), h.addr).await;

        let reply = recv_kind(&mut h.inbox, MessageKind::Chunk).await;
        match reply.payload {
            Payload::Chunk { body, chunk_no, .. } => {
                assert_eq!(chunk_no, 2);
                assert_eq!(body, vec![7; 16]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(h.ctx.ledger.being_restored_state(&key), None);
    }

    #[tokio::test]
    async fn getchunk_stands_down_after_overheard_reply() {
        let hub = LocalHub::new();
        let mut h = harness(&hub, 1);
        let key = ChunkKey::new(fid(7), 0);
        h.store.save(&key.file_id, 0, &[1]).unwrap();
        h.ctx.ledger.add_stored_chunk(key, 1, PeerId(1));
        h.ctx.ledger.arm_being_restored(key);
        h.ctx.ledger.mark_chunk_reply_seen(key);

        handle_getchunk(h.ctx.clone(), key, ProtocolVersion::baseline(), h.addr).await;

        assert!(h.inbox.try_recv().is_err());
        assert_eq!(h.ctx.ledger.being_restored_state(&key), None);
    }

    #[tokio::test]
    async fn getchunk_direct_delivery_with_echo() {
        let hub = LocalHub::new();
        let enhanced = ProtocolVersion("1.1".into());
        let mut requester = harness_with(&hub, 2, enhanced.clone());
        // Responder dials (requester_ip, direct_port); in tests the hub's
        // per-peer port doubles as the shared direct port.
        let (mut responder_inbox, _responder_addr) = hub.attach(PeerId(1));
        let mut config = PeerConfig::new(PeerId(1), enhanced.clone(), requester.addr.port());
        config.policy = config.policy.with_zero_delays();
        let store = Arc::new(MemoryStore::new(1 << 20));
        let ctx = PeerContext::new(config, store.clone(), OutboundLink::new(hub.clone()));

        let key = ChunkKey::new(fid(8), 0);
        store.save(&key.file_id, 0, &[5; 8]).unwrap();
        ctx.ledger.add_stored_chunk(key, 1, PeerId(1));

        handle_getchunk(ctx.clone(), key, enhanced, requester.addr).await;

        // Requester sees the direct full-body delivery and the group echo.
        let mut direct_body = None;
        let mut echo_seen = false;
        for _ in 0..2 {
            let inbound = requester.inbox.recv().await.unwrap();
            if let Payload::Chunk { body, .. } = inbound.message.payload {
                match inbound.via {
                    Via::Direct => direct_body = Some(body),
                    Via::Group => {
                        assert!(body.is_empty());
                        echo_seen = true;
                    }
                }
            }
        }
        assert_eq!(direct_body.unwrap(), vec![5; 8]);
        assert!(echo_seen);
        // The responder also hears its own echo on the group.
        let echo = recv_kind(&mut responder_inbox, MessageKind::Chunk).await;
        match echo.payload {
            Payload::Chunk { body, .. } => assert!(body.is_empty()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_completes_restore_in_index_order() {
        let hub = LocalHub::new();
        let h = harness(&hub, 1);
        let f = fid(9);
        h.ctx.ledger.register_restore(f, "docs/a.bin".into(), 2);

        let v = ProtocolVersion::baseline();
        handle_chunk(h.ctx.clone(), ChunkKey::new(f, 1), v.clone(), vec![2, 2], Via::Group).await;
        handle_chunk(h.ctx.clone(), ChunkKey::new(f, 0), v, vec![1], Via::Group).await;

        assert_eq!(h.store.restored_file("docs/a.bin").unwrap(), vec![1, 2, 2]);
        assert!(!h.ctx.ledger.is_restoring(&f));
    }

    #[tokio::test]
    async fn foreign_chunk_still_suppresses_reply_intent() {
        let hub = LocalHub::new();
        let h = harness(&hub, 1);
        let key = ChunkKey::new(fid(10), 0);

        handle_chunk(h.ctx.clone(), key, ProtocolVersion::baseline(), vec![1], Via::Group).await;

        assert!(h.ctx.ledger.chunk_reply_overheard(&key));
        assert!(!h.ctx.ledger.is_restoring(&key.file_id));
    }

    #[tokio::test]
    async fn enhanced_requester_ignores_header_only_echo() {
        let hub = LocalHub::new();
        let h = harness_with(&hub, 1, ProtocolVersion("1.1".into()));
        let f = fid(11);
        h.ctx.ledger.register_restore(f, "b.bin".into(), 1);

        // Echo on the group from an enhanced holder: ignored. Empty direct
        // delivery: accepted (a zero-length final chunk is real data).
        let enhanced = ProtocolVersion("1.1".into());
        handle_chunk(h.ctx.clone(), ChunkKey::new(f, 0), enhanced.clone(), Vec::new(), Via::Group)
            .await;
        assert!(h.ctx.ledger.is_restoring(&f));

        handle_chunk(h.ctx.clone(), ChunkKey::new(f, 0), enhanced, Vec::new(), Via::Direct).await;
        assert!(!h.ctx.ledger.is_restoring(&f));
        assert_eq!(h.store.restored_file("b.bin").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn empty_group_chunk_from_baseline_holder_is_real_data() {
        let hub = LocalHub::new();
        let h = harness_with(&hub, 1, ProtocolVersion("1.1".into()));
        let f = fid(14);
        h.ctx.ledger.register_restore(f, "c.bin".into(), 1);

        // A baseline holder never delivers point-to-point, so its empty
        // group CHUNK is the zero-length final chunk, not an echo.
        let baseline = ProtocolVersion::baseline();
        handle_chunk(h.ctx.clone(), ChunkKey::new(f, 0), baseline, Vec::new(), Via::Group).await;

        assert!(!h.ctx.ledger.is_restoring(&f));
        assert_eq!(h.store.restored_file("c.bin").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn delete_drops_all_chunks_and_acks_when_enhanced() {
        let hub = LocalHub::new();
        let mut h = harness_with(&hub, 1, ProtocolVersion("1.1".into()));
        let f = fid(12);
        for no in 0..3 {
            h.store.save(&f, no, &[no as u8]).unwrap();
            h.ctx.ledger.add_stored_chunk(ChunkKey::new(f, no), 1, PeerId(1));
        }

        handle_delete(h.ctx.clone(), f).await;

        assert_eq!(h.store.chunk_count(), 0);
        assert!(h.ctx.ledger.stored_chunk_nos(&f).is_none());
        let ack = recv_kind(&mut h.inbox, MessageKind::AckDelete).await;
        assert_eq!(ack.sender, PeerId(1));

        // Repeated DELETE is a silent no-op.
        handle_delete(h.ctx.clone(), f).await;
        assert!(h.inbox.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_below_degree_triggers_rebackup() {
        let hub = LocalHub::new();
        let mut h = harness(&hub, 1);
        let key = ChunkKey::new(fid(13), 0);
        h.store.save(&key.file_id, 0, &[3; 4]).unwrap();
        h.ctx.ledger.add_stored_chunk(key, 2, PeerId(1));
        h.ctx.ledger.record_stored_ack(key, PeerId(2));

        let ctx = h.ctx.clone();
        tokio::spawn(async move {
            handle_removed(ctx, key, PeerId(2)).await;
        });

        let put = recv_kind(&mut h.inbox, MessageKind::PutChunk).await;
        match put.payload {
            Payload::PutChunk {
                desired_replication,
                body,
                ..
            } => {
                assert_eq!(desired_replication, 2);
                assert_eq!(body, vec![3; 4]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn removed_at_degree_is_quiet() {
        let hub = LocalHub::new();
        let mut h = harness(&hub, 1);
        let key = ChunkKey::new(fid(14), 0);
        h.store.save(&key.file_id, 0, &[1]).unwrap();
        h.ctx.ledger.add_stored_chunk(key, 1, PeerId(1));
        h.ctx.ledger.record_stored_ack(key, PeerId(2));

        handle_removed(h.ctx.clone(), key, PeerId(2)).await;

        assert!(h.inbox.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_redistributes_reclaimed_chunk_once() {
        let hub = LocalHub::new();
        let mut h = harness(&hub, 1);
        let key = ChunkKey::new(fid(15), 0);
        h.ctx.ledger.add_reclaimed_chunk(
            key,
            crate::ledger::ChunkInfo::with_body(2, vec![8; 6]),
        );

        let ctx = h.ctx.clone();
        tokio::spawn(async move {
            handle_removed(ctx, key, PeerId(1)).await;
        });
        recv_kind(&mut h.inbox, MessageKind::PutChunk).await;

        // The entry was consumed; a second observation is a no-op.
        assert!(h.ctx.ledger.take_reclaimed_chunk(&key).is_none());
    }

    #[tokio::test]
    async fn control_replays_delete_to_returning_holder() {
        let hub = LocalHub::new();
        let mut h = harness_with(&hub, 1, ProtocolVersion("1.1".into()));
        let f = fid(16);
        let holders = [PeerId(2)].into_iter().collect();
        h.ctx.ledger.mark_file_deleted(f, holders);

        handle_control(h.ctx.clone(), PeerId(2));
        let replay = recv_kind(&mut h.inbox, MessageKind::Delete).await;
        assert_eq!(replay.file_id(), Some(f));

        handle_ack_delete(h.ctx.clone(), f, PeerId(2));
        handle_control(h.ctx.clone(), PeerId(2));
        assert!(h.inbox.try_recv().is_err());
    }
}
