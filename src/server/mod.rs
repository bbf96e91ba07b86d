//! Socket plumbing: listener accept loops, outgoing dials, and the
//! per-connection reader/writer tasks.
//!
//! Nothing here understands the protocol beyond the framing and the identity
//! preamble; decoded multiparts are forwarded to the proxy loop as
//! [`SocketEvent`]s, and the proxy alone decides what they mean.

mod link;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use service::{auth::AllowFn, connection::PubKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{Sender, UnboundedSender};
use tokio::sync::watch;

/// Transport-level event posted to the proxy loop.
///
/// `token` is the proxy's arena index for the connection; the reader task
/// tags every event with it so the proxy never has to hold socket state.
pub enum SocketEvent {
    /// An accepted peer finished the transport preamble.
    Accepted {
        token: u64,
        addr: SocketAddr,
        pubkey: Option<PubKey>,
        allow: Option<AllowFn>,
        writer: UnboundedSender<Vec<Bytes>>,
    },
    /// An outgoing dial completed its transport preamble.
    Connected {
        token: u64,
        addr: SocketAddr,
        pubkey: Option<PubKey>,
        writer: UnboundedSender<Vec<Bytes>>,
    },
    /// An outgoing dial failed before the link came up.
    ConnectFailed { token: u64, error: String },
    /// A complete multipart message arrived on the link.
    Frames { token: u64, frames: Vec<Bytes> },
    /// The link is gone: EOF, socket error, or framing violation.
    Closed { token: u64 },
}

/// Accepts connections on a bound listener until the node shuts down.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    curve: Option<PubKey>,
    allow: Option<AllowFn>,
    tokens: Arc<AtomicU64>,
    ingress: Sender<SocketEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_addr = listener
        .local_addr()
        .expect("get listener local addr failed!");

    loop {
        let (socket, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("listener accept failed: addr={:?}, err={}", local_addr, e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };

        log::info!("socket accept: addr={:?}, interface={:?}", addr, local_addr);

        // Commands are small and latency matters more than throughput here.
        if let Err(e) = socket.set_nodelay(true) {
            log::error!("socket set nodelay failed: addr={}, err={}", addr, e);
        }

        let token = tokens.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(link::run_incoming(
            socket,
            token,
            addr,
            curve,
            allow.clone(),
            ingress.clone(),
        ));
    }

    log::info!("listener closed: interface={:?}", local_addr);
}

/// Dials an outgoing link; progress is reported through `ingress` as
/// `Connected`/`ConnectFailed` followed by the usual frame events.
pub(crate) fn spawn_outgoing(
    addr: SocketAddr,
    token: u64,
    curve: Option<PubKey>,
    expected: Option<PubKey>,
    ingress: Sender<SocketEvent>,
) {
    tokio::spawn(async move {
        let socket = match TcpStream::connect(addr).await {
            Ok(socket) => socket,
            Err(e) => {
                let _ = ingress
                    .send(SocketEvent::ConnectFailed {
                        token,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        if let Err(e) = socket.set_nodelay(true) {
            log::error!("socket set nodelay failed: addr={}, err={}", addr, e);
        }

        link::run_outgoing(socket, token, addr, curve, expected, ingress).await;
    });
}
