//! Network transport: three UDP multicast groups plus a TCP side channel
//! for point-to-point chunk delivery. Implements the core's [`Transport`]
//! seam; received traffic is funneled into one inbox for the dispatcher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use burrow_core::transport::{Group, Inbound, Transport, TransportError, Via};
use burrow_core::wire::{decode_frame, encode_frame, FrameDecodeError, MAX_FRAME_LEN};
use burrow_core::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::config::Config;

pub struct UdpTransport {
    control: GroupSocket,
    backup: GroupSocket,
    restore: GroupSocket,
    direct_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

struct GroupSocket {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
}

/// Bind the three group sockets and the direct listener, spawn the receive
/// loops, and return the transport handle plus the dispatcher inbox.
pub async fn spawn_transport(
    cfg: &Config,
) -> std::io::Result<(Arc<UdpTransport>, mpsc::UnboundedReceiver<Inbound>)> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

    let control = group_socket(cfg.control_group).await?;
    let backup = group_socket(cfg.backup_group).await?;
    let restore = group_socket(cfg.restore_group).await?;
    for sock in [&control.socket, &backup.socket, &restore.socket] {
        tokio::spawn(group_recv_loop(Arc::clone(sock), inbox_tx.clone()));
    }

    let listener = TcpListener::bind(("0.0.0.0", cfg.direct_port)).await?;
    tokio::spawn(direct_accept_loop(listener, inbox_tx));

    let (direct_tx, direct_rx) = mpsc::unbounded_channel();
    tokio::spawn(direct_send_loop(direct_rx));

    let transport = Arc::new(UdpTransport {
        control,
        backup,
        restore,
        direct_tx,
    });
    Ok((transport, inbox_rx))
}

impl Transport for UdpTransport {
    fn send_group(&self, group: Group, message: &Message) -> Result<(), TransportError> {
        let frame = encode_frame(message)?;
        let gs = match group {
            Group::Control => &self.control,
            Group::Backup => &self.backup,
            Group::Restore => &self.restore,
        };
        match gs.socket.try_send_to(&frame, gs.dest) {
            Ok(_) => Ok(()),
            // Best-effort medium: a full socket buffer is message loss, and
            // the protocol's retry rounds already absorb loss.
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::warn!(dest = %gs.dest, "group send dropped: socket buffer full");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn send_direct(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        let frame = encode_frame(message)?;
        self.direct_tx
            .send((frame, to))
            .map_err(|_| TransportError::Closed)
    }
}

async fn group_socket(group: SocketAddr) -> std::io::Result<GroupSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", group.port()))?;
    let multicast = match group.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "multicast groups must be IPv4",
            ))
        }
    };
    std_sock.join_multicast_v4(&multicast, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    Ok(GroupSocket {
        socket: Arc::new(UdpSocket::from_std(std_sock)?),
        dest: group,
    })
}

async fn group_recv_loop(socket: Arc<UdpSocket>, inbox: mpsc::UnboundedSender<Inbound>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(%err, "group receive failed");
                continue;
            }
        };
        match decode_frame(&buf[..n]) {
            Ok((message, _)) => {
                if inbox
                    .send(Inbound {
                        message,
                        from,
                        via: Via::Group,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(%from, %err, "dropping malformed datagram");
            }
        }
    }
}

async fn direct_accept_loop(listener: TcpListener, inbox: mpsc::UnboundedSender<Inbound>) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(%err, "direct accept failed");
                continue;
            }
        };
        tracing::debug!(%from, "direct connection accepted");
        tokio::spawn(direct_conn_loop(stream, from, inbox.clone()));
    }
}

/// Read length-prefixed frames off one point-to-point connection until the
/// peer hangs up or sends garbage.
async fn direct_conn_loop(
    mut stream: TcpStream,
    from: SocketAddr,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    let mut acc: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => acc.extend_from_slice(&buf[..n]),
            Err(err) => {
                tracing::debug!(%from, %err, "direct connection read failed");
                return;
            }
        }
        if acc.len() > 2 * MAX_FRAME_LEN as usize {
            tracing::warn!(%from, "direct connection overflows frame bound, closing");
            return;
        }
        loop {
            match decode_frame(&acc) {
                Ok((message, consumed)) => {
                    acc.drain(..consumed);
                    if inbox
                        .send(Inbound {
                            message,
                            from,
                            via: Via::Direct,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(err) => {
                    tracing::warn!(%from, %err, "closing corrupt direct connection");
                    return;
                }
            }
        }
    }
}

/// Own the outbound point-to-point connections. Connections are cached per
/// destination and re-dialed once after a write failure.
async fn direct_send_loop(mut outbox: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) {
    let mut conns: HashMap<SocketAddr, TcpStream> = HashMap::new();
    while let Some((frame, to)) = outbox.recv().await {
        if let Some(stream) = conns.get_mut(&to) {
            if stream.write_all(&frame).await.is_ok() {
                continue;
            }
            conns.remove(&to);
        }
        match TcpStream::connect(to).await {
            Ok(mut stream) => {
                if let Err(err) = stream.write_all(&frame).await {
                    tracing::warn!(%to, %err, "direct send failed");
                    continue;
                }
                conns.insert(to, stream);
            }
            Err(err) => {
                tracing::warn!(%to, %err, "direct connect failed, dropping frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::{FileId, Payload, PeerId, ProtocolVersion};

    fn chunk_message(body: Vec<u8>) -> Message {
        Message::new(
            ProtocolVersion("1.1".into()),
            PeerId(1),
            Payload::Chunk {
                file_id: FileId::from_bytes([4; 32]),
                chunk_no: 0,
                body,
            },
        )
    }

    #[tokio::test]
    async fn direct_frames_roundtrip_over_tcp() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(direct_accept_loop(listener, tx));

        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        tokio::spawn(direct_send_loop(direct_rx));

        // Two frames over one cached connection.
        for body in [vec![1u8; 10], vec![2u8; 7_000]] {
            direct_tx
                .send((encode_frame(&chunk_message(body)).unwrap(), addr))
                .unwrap();
        }

        let first = rx.recv().await.unwrap();
        assert_eq!(first.via, Via::Direct);
        let second = rx.recv().await.unwrap();
        match second.message.payload {
            Payload::Chunk { body, .. } => assert_eq!(body.len(), 7_000),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupt_direct_stream_is_dropped() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(direct_accept_loop(listener, tx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Length prefix far beyond the frame bound.
        stream.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        // The connection is closed without delivering anything.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
