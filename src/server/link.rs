//! Per-connection IO: the identity preamble, then a reader loop feeding the
//! proxy and a writer task draining its egress queue.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use codec::frame::{Decoder, encode};
use service::{auth::AllowFn, connection::PubKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc::{Sender, unbounded_channel};

use super::SocketEvent;

/// A peer that stalls the identity preamble is dropped rather than allowed to
/// pin an accept slot.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) async fn run_incoming(
    mut socket: TcpStream,
    token: u64,
    addr: SocketAddr,
    curve: Option<PubKey>,
    allow: Option<AllowFn>,
    ingress: Sender<SocketEvent>,
) {
    let pubkey = match curve {
        Some(local) => match preamble_accept(&mut socket, local).await {
            Ok(pubkey) => Some(pubkey),
            Err(e) => {
                log::warn!("identity preamble failed: addr={}, err={}", addr, e);
                return;
            }
        },
        None => None,
    };

    let (writer, egress) = unbounded_channel();
    if ingress
        .send(SocketEvent::Accepted {
            token,
            addr,
            pubkey,
            allow,
            writer,
        })
        .await
        .is_err()
    {
        return;
    }

    pump(socket, token, egress, ingress).await;
}

pub(super) async fn run_outgoing(
    mut socket: TcpStream,
    token: u64,
    addr: SocketAddr,
    curve: Option<PubKey>,
    expected: Option<PubKey>,
    ingress: Sender<SocketEvent>,
) {
    let pubkey = match curve {
        Some(local) => match preamble_connect(&mut socket, local, expected).await {
            Ok(pubkey) => Some(pubkey),
            Err(e) => {
                let _ = ingress
                    .send(SocketEvent::ConnectFailed {
                        token,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        },
        None => None,
    };

    let (writer, egress) = unbounded_channel();
    if ingress
        .send(SocketEvent::Connected {
            token,
            addr,
            pubkey,
            writer,
        })
        .await
        .is_err()
    {
        return;
    }

    pump(socket, token, egress, ingress).await;
}

/// Splits the stream and shuttles bytes in both directions until either side
/// goes away. The writer half lives in its own task and ends when the proxy
/// retires the connection and drops the egress sender.
async fn pump(
    socket: TcpStream,
    token: u64,
    mut egress: tokio::sync::mpsc::UnboundedReceiver<Vec<Bytes>>,
    ingress: Sender<SocketEvent>,
) {
    let (reader, mut writer) = socket.into_split();

    let write_task = tokio::spawn(async move {
        let mut wire = BytesMut::with_capacity(4096);
        while let Some(frames) = egress.recv().await {
            wire.clear();
            encode(&frames, &mut wire);
            if writer.write_all(&wire).await.is_err() {
                break;
            }
        }
    });

    read_loop(reader, token, &ingress).await;

    if ingress.send(SocketEvent::Closed { token }).await.is_err() {
        // Proxy already gone; nothing will drop the egress sender.
        write_task.abort();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, token: u64, ingress: &Sender<SocketEvent>) {
    let mut decoder = Decoder::default();
    let mut buffer = BytesMut::with_capacity(4096);

    'read: while let Ok(size) = reader.read_buf(&mut buffer).await {
        // Zero bytes means the peer closed the socket.
        if size == 0 {
            break;
        }

        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(frames)) => {
                    if ingress
                        .send(SocketEvent::Frames { token, frames })
                        .await
                        .is_err()
                    {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("framing violation: conn={}, err={}", token, e);
                    break 'read;
                }
            }
        }
    }
}

/// Listener side of the identity exchange standing in for the curve
/// handshake: read the peer's raw 32-byte pubkey, answer with our own.
async fn preamble_accept(socket: &mut TcpStream, local: PubKey) -> std::io::Result<PubKey> {
    let mut remote = [0u8; PubKey::LEN];
    tokio::time::timeout(PREAMBLE_TIMEOUT, socket.read_exact(&mut remote))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "preamble timed out"))??;

    socket.write_all(local.as_bytes()).await?;
    Ok(PubKey::from(remote))
}

/// Dialer side: present our pubkey, read the listener's, and verify it when
/// the caller pinned an expected identity.
async fn preamble_connect(
    socket: &mut TcpStream,
    local: PubKey,
    expected: Option<PubKey>,
) -> std::io::Result<PubKey> {
    socket.write_all(local.as_bytes()).await?;

    let mut remote = [0u8; PubKey::LEN];
    tokio::time::timeout(PREAMBLE_TIMEOUT, socket.read_exact(&mut remote))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "preamble timed out"))??;

    let remote = PubKey::from(remote);
    if let Some(expected) = expected {
        if remote != expected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("remote identity mismatch: expected={}, got={}", expected, remote),
            ));
        }
    }

    Ok(remote)
}
