//! Initiator protocols: the four driver operations started from the
//! control surface. Each runs rounds against the ledger's reply-driven
//! tables; handler tasks update those tables concurrently.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::PeerContext;
use crate::identity::file_digest;
use crate::ledger::{ChunkInfo, ChunkKey, FileRecord};
use crate::protocol::{Payload, MAX_CHUNK_SIZE};
use crate::store::{ChunkStore, StoreError};
use crate::transport::TransportError;

/// Rounds a backup retries before giving up on unconfirmed chunks.
pub const MAX_PUTCHUNK_TRIES: u32 = 5;
/// First-round wait for STORED replies; doubles each round.
pub const INITIAL_ROUND_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("file not tracked by this peer: {0}")]
    UnknownFile(String),
    #[error("replication target not reached for {unsatisfied} chunk(s)")]
    ReplicationNotAchieved { unsatisfied: usize },
    #[error("space quota not reached: {used} bytes used, target {target}")]
    QuotaNotReached { used: u64, target: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Split file bytes into chunks of at most [`MAX_CHUNK_SIZE`]. A file whose
/// length is an exact multiple of the chunk size gets an explicit
/// zero-length final chunk, so restore can detect true end-of-file.
pub fn split_into_chunks(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut chunks: Vec<Vec<u8>> = bytes.chunks(MAX_CHUNK_SIZE).map(|c| c.to_vec()).collect();
    if bytes.len() % MAX_CHUNK_SIZE == 0 {
        chunks.push(Vec::new());
    }
    chunks
}

/// Back up a file across the peer population. Runs PUTCHUNK rounds with
/// exponential backoff until every chunk reaches the desired replication
/// degree or the retry ceiling is hit.
pub async fn backup_file(
    ctx: Arc<PeerContext>,
    file_path: &str,
    desired_replication: u32,
) -> Result<(), RequestError> {
    let path = Path::new(file_path);
    let bytes = tokio::fs::read(path).await?;
    let file_id = file_digest(path)?;
    let chunks = split_into_chunks(&bytes);
    let chunk_count = chunks.len() as u32;
    tracing::info!(file = file_path, %file_id, chunk_count, desired_replication, "starting backup");

    // Tracking must exist before the first PUTCHUNK leaves, or an early
    // STORED reply would find nothing to count against.
    ctx.ledger.register_backup(file_id);
    for chunk_no in 0..chunk_count {
        ctx.ledger
            .listen_for_stored(ChunkKey::new(file_id, chunk_no), desired_replication);
    }

    let mut unsatisfied: Vec<u32> = (0..chunk_count).collect();
    for round in 0..MAX_PUTCHUNK_TRIES {
        unsatisfied.retain(|&chunk_no| {
            ctx.ledger.backed_up_degree(&ChunkKey::new(file_id, chunk_no)) < desired_replication
        });
        if unsatisfied.is_empty() {
            break;
        }
        tracing::debug!(round, outstanding = unsatisfied.len(), %file_id, "backup round");
        for &chunk_no in &unsatisfied {
            ctx.send(Payload::PutChunk {
                file_id,
                chunk_no,
                desired_replication,
                body: chunks[chunk_no as usize].clone(),
            })?;
        }
        tokio::time::sleep(Duration::from_millis(INITIAL_ROUND_MS << round)).await;
    }

    unsatisfied.retain(|&chunk_no| {
        ctx.ledger.backed_up_degree(&ChunkKey::new(file_id, chunk_no)) < desired_replication
    });
    if !unsatisfied.is_empty() {
        tracing::warn!(%file_id, unsatisfied = unsatisfied.len(), "backup gave up");
        return Err(RequestError::ReplicationNotAchieved {
            unsatisfied: unsatisfied.len(),
        });
    }

    ctx.ledger.add_originated(FileRecord {
        file_path: file_path.to_string(),
        file_id,
        chunk_count,
    });
    tracing::info!(%file_id, "backup complete");
    Ok(())
}

/// Re-backup a single chunk whose replication degree broke. Same round
/// structure as a full backup, for one chunk.
pub(crate) async fn backup_chunk(
    ctx: Arc<PeerContext>,
    key: ChunkKey,
    desired_replication: u32,
    body: Vec<u8>,
) -> Result<(), RequestError> {
    ctx.ledger.listen_for_stored(key, desired_replication);
    for round in 0..MAX_PUTCHUNK_TRIES {
        if ctx.ledger.backed_up_degree(&key) >= desired_replication {
            return Ok(());
        }
        ctx.send(Payload::PutChunk {
            file_id: key.file_id,
            chunk_no: key.chunk_no,
            desired_replication,
            body: body.clone(),
        })?;
        tokio::time::sleep(Duration::from_millis(INITIAL_ROUND_MS << round)).await;
    }
    if ctx.ledger.backed_up_degree(&key) >= desired_replication {
        Ok(())
    } else {
        Err(RequestError::ReplicationNotAchieved { unsatisfied: 1 })
    }
}

/// Request every chunk of a previously backed-up file. Returns once the
/// GETCHUNKs are on the wire; completion is detected by the CHUNK handler
/// and observable through the state report.
pub async fn restore_file(ctx: Arc<PeerContext>, file_path: &str) -> Result<(), RequestError> {
    let record = ctx
        .ledger
        .originated_by_path(file_path)
        .ok_or_else(|| RequestError::UnknownFile(file_path.to_string()))?;
    tracing::info!(file = file_path, file_id = %record.file_id, chunks = record.chunk_count, "starting restore");

    // The collection must exist before any reply can arrive.
    ctx.ledger.register_restore(
        record.file_id,
        record.file_path.clone(),
        record.chunk_count,
    );
    for chunk_no in 0..record.chunk_count {
        ctx.send(Payload::GetChunk {
            file_id: record.file_id,
            chunk_no,
        })?;
    }
    Ok(())
}

/// Order every holder to drop the file's chunks. Fire-and-forget in the
/// baseline; the enhanced variant additionally tracks which holders have
/// yet to acknowledge, so DELETE can be replayed when they reappear.
pub async fn delete_file(ctx: Arc<PeerContext>, file_path: &str) -> Result<(), RequestError> {
    let record = ctx
        .ledger
        .originated_by_path(file_path)
        .ok_or_else(|| RequestError::UnknownFile(file_path.to_string()))?;
    let holders = ctx.ledger.holders_of(&record.file_id);

    // Untrack only once the DELETE is actually on the wire, so a failed
    // send leaves the file retryable.
    ctx.send(Payload::Delete {
        file_id: record.file_id,
    })?;
    ctx.ledger.remove_originated(file_path);
    if ctx.config.policy.track_delete_acks {
        ctx.ledger.mark_file_deleted(record.file_id, holders);
    }
    tracing::info!(file = file_path, file_id = %record.file_id, "delete requested");
    Ok(())
}

/// Evict locally stored chunks until used space is at or below the target.
/// Every eviction is announced with REMOVED; chunks whose degree breaks
/// with our copy gone keep their body in the reclaimed table for a
/// possible one-shot redistribution.
pub async fn reclaim_space(ctx: Arc<PeerContext>, target_bytes: u64) -> Result<(), RequestError> {
    for (file_id, chunk_no) in ctx.store.eviction_order() {
        if ctx.store.used_space() <= target_bytes {
            break;
        }
        let key = ChunkKey::new(file_id, chunk_no);
        let body = match ctx.store.load(&file_id, chunk_no) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(%key, %err, "skipping unreadable chunk during reclaim");
                continue;
            }
        };
        ctx.store.delete(&file_id, chunk_no)?;
        if let Some(info) = ctx.ledger.evict_stored_chunk(&key, ctx.self_id()) {
            if !info.achieved_desired() {
                ctx.ledger.add_reclaimed_chunk(
                    key,
                    ChunkInfo::with_body(info.desired_replication, body),
                );
            }
        }
        ctx.send(Payload::Removed { file_id, chunk_no })?;
        tracing::debug!(%key, "evicted chunk");
    }

    let used = ctx.store.used_space();
    if used <= target_bytes {
        Ok(())
    } else {
        Err(RequestError::QuotaNotReached {
            used,
            target: target_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::identity::{FileId, PeerId};
    use crate::protocol::ProtocolVersion;
    use crate::store::{ChunkStore, MemoryStore};
    use crate::transport::{LocalHub, OutboundLink};

    fn fid(b: u8) -> FileId {
        FileId::from_bytes([b; 32])
    }

    #[test]
    fn chunking_adds_zero_length_tail_on_exact_multiple() {
        let chunks = split_into_chunks(&vec![0u8; MAX_CHUNK_SIZE * 2]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_CHUNK_SIZE);
        assert_eq!(chunks[1].len(), MAX_CHUNK_SIZE);
        assert!(chunks[2].is_empty());
    }

    #[test]
    fn chunking_short_tail() {
        let chunks = split_into_chunks(&vec![0u8; MAX_CHUNK_SIZE + 5]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 5);
    }

    #[test]
    fn chunking_empty_file_is_one_empty_chunk() {
        let chunks = split_into_chunks(&[]);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    fn context(hub: &std::sync::Arc<LocalHub>, id: u32) -> Arc<PeerContext> {
        let mut config = PeerConfig::new(PeerId(id), ProtocolVersion::baseline(), 0);
        config.policy = config.policy.with_zero_delays();
        PeerContext::new(
            config,
            Arc::new(MemoryStore::new(1 << 20)),
            OutboundLink::new(hub.clone()),
        )
    }

    #[tokio::test]
    async fn restore_of_unknown_file_fails_fast() {
        let hub = LocalHub::new();
        let ctx = context(&hub, 1);
        let err = restore_file(ctx, "nowhere.bin").await.unwrap_err();
        assert!(matches!(err, RequestError::UnknownFile(_)));
    }

    #[tokio::test]
    async fn delete_of_unknown_file_fails_fast() {
        let hub = LocalHub::new();
        let ctx = context(&hub, 1);
        let err = delete_file(ctx, "nowhere.bin").await.unwrap_err();
        assert!(matches!(err, RequestError::UnknownFile(_)));
    }

    #[tokio::test]
    async fn delete_keeps_record_when_send_fails() {
        struct DownTransport;
        impl crate::transport::Transport for DownTransport {
            fn send_group(
                &self,
                _group: crate::transport::Group,
                _message: &crate::protocol::Message,
            ) -> Result<(), TransportError> {
                Err(TransportError::Closed)
            }
            fn send_direct(
                &self,
                _message: &crate::protocol::Message,
                _to: std::net::SocketAddr,
            ) -> Result<(), TransportError> {
                Err(TransportError::Closed)
            }
        }

        let mut config = PeerConfig::new(PeerId(1), ProtocolVersion::baseline(), 0);
        config.policy = config.policy.with_zero_delays();
        let ctx = PeerContext::new(
            config,
            Arc::new(MemoryStore::new(1 << 20)),
            OutboundLink::new(Arc::new(DownTransport)),
        );
        ctx.ledger.add_originated(FileRecord {
            file_path: "a.bin".into(),
            file_id: fid(4),
            chunk_count: 1,
        });

        let err = delete_file(ctx.clone(), "a.bin").await.unwrap_err();
        assert!(matches!(err, RequestError::Transport(_)));
        // The failed DELETE never left, so the file stays deletable.
        assert!(ctx.ledger.originated_by_path("a.bin").is_some());
    }

    #[tokio::test]
    async fn reclaim_reports_unreachable_quota() {
        let hub = LocalHub::new();
        let ctx = context(&hub, 1);
        // Nothing stored: an already-met quota succeeds trivially.
        assert!(reclaim_space(ctx.clone(), 0).await.is_ok());
    }

    #[tokio::test]
    async fn reclaim_evicts_down_to_target_and_announces() {
        let hub = LocalHub::new();
        let (mut inbox, _) = hub.attach(PeerId(1));
        let ctx = context(&hub, 1);
        for no in 0..4u32 {
            ctx.store.save(&fid(1), no, &[0; 100]).unwrap();
            ctx.ledger
                .add_stored_chunk(ChunkKey::new(fid(1), no), 1, PeerId(1));
        }

        reclaim_space(ctx.clone(), 250).await.unwrap();

        assert!(ctx.store.used_space() <= 250);
        let mut removed = 0;
        while let Ok(inbound) = inbox.try_recv() {
            if inbound.message.kind() == crate::protocol::MessageKind::Removed {
                removed += 1;
            }
        }
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn reclaim_retains_body_when_degree_breaks() {
        let hub = LocalHub::new();
        let ctx = context(&hub, 1);
        let key = ChunkKey::new(fid(2), 0);
        ctx.store.save(&key.file_id, 0, &[7; 10]).unwrap();
        // Only our own copy exists: desired 2, observed 1.
        ctx.ledger.add_stored_chunk(key, 2, PeerId(1));

        reclaim_space(ctx.clone(), 0).await.unwrap();

        let info = ctx.ledger.take_reclaimed_chunk(&key).unwrap();
        assert_eq!(info.body.unwrap(), vec![7; 10]);
        assert_eq!(info.desired_replication, 2);
    }

    #[tokio::test]
    async fn reclaim_drops_body_when_degree_holds() {
        let hub = LocalHub::new();
        let ctx = context(&hub, 1);
        let key = ChunkKey::new(fid(3), 0);
        ctx.store.save(&key.file_id, 0, &[7; 10]).unwrap();
        ctx.ledger.add_stored_chunk(key, 1, PeerId(1));
        // Another holder keeps the degree satisfied without us.
        ctx.ledger.record_stored_ack(key, PeerId(2));

        reclaim_space(ctx.clone(), 0).await.unwrap();

        assert!(ctx.ledger.take_reclaimed_chunk(&key).is_none());
    }
}
