//! Local control surface: line-oriented JSON over a loopback TCP socket.
//! One request per line, one response per line. Operations return as soon
//! as the initiator is submitted; progress is observable via `state`.

use std::sync::Arc;

use burrow_core::{ChunkStore, Peer, RequestError, StateReport};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Backup { file_path: String, replication: u32 },
    Restore { file_path: String },
    Delete { file_path: String },
    Reclaim { target_bytes: u64 },
    State,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Accepted {
        detail: String,
    },
    State {
        report: StateReport,
        used_space: u64,
        available_space: u64,
    },
    Error {
        detail: String,
    },
}

/// Accept control connections until the process exits.
pub async fn serve(listener: TcpListener, peer: Arc<Peer>) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(%err, "control accept failed");
                continue;
            }
        };
        tracing::debug!(%from, "control connection");
        tokio::spawn(serve_connection(stream, Arc::clone(&peer)));
    }
}

async fn serve_connection(stream: TcpStream, peer: Arc<Peer>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(%err, "control read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(request, &peer),
            Err(err) => Response::Error {
                detail: format!("bad request: {err}"),
            },
        };
        let mut out = match serde_json::to_vec(&response) {
            Ok(out) => out,
            Err(err) => {
                tracing::warn!(%err, "control response serialization failed");
                return;
            }
        };
        out.push(b'\n');
        if write_half.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn handle_request(request: Request, peer: &Arc<Peer>) -> Response {
    match request {
        Request::Backup {
            file_path,
            replication,
        } => {
            let detail = format!("backup of {file_path} submitted (degree {replication})");
            watch_outcome("backup", peer.backup(file_path, replication));
            Response::Accepted { detail }
        }
        Request::Restore { file_path } => {
            let detail = format!("restore of {file_path} submitted");
            watch_outcome("restore", peer.restore(file_path));
            Response::Accepted { detail }
        }
        Request::Delete { file_path } => {
            let detail = format!("delete of {file_path} submitted");
            watch_outcome("delete", peer.delete(file_path));
            Response::Accepted { detail }
        }
        Request::Reclaim { target_bytes } => {
            watch_outcome("reclaim", peer.reclaim(target_bytes));
            Response::Accepted {
                detail: format!("reclaim to {target_bytes} bytes submitted"),
            }
        }
        Request::State => {
            let ctx = peer.context();
            Response::State {
                report: peer.describe_state(),
                used_space: ctx.store.used_space(),
                available_space: ctx.store.available_space(),
            }
        }
    }
}

/// Operations complete (or fail) long after the control reply went out;
/// their outcome is only reported through the log and the state dump.
fn watch_outcome(op: &'static str, handle: JoinHandle<Result<(), RequestError>>) {
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(())) => tracing::info!(op, "operation finished"),
            Ok(Err(err)) => tracing::warn!(op, %err, "operation failed"),
            Err(err) => tracing::warn!(op, %err, "operation task panicked"),
        }
    });
}
