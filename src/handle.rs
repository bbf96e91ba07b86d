use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use service::{
    connection::{ConnectionId, PubKey},
    replies::ReplyResult,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::proxy::{ConnectOptions, Control};

/// Handle onto a running node.
///
/// Cheap to clone and safe to use from any thread: every operation marshals a
/// control message onto the proxy loop, which owns the sockets. Operations on
/// a node that has shut down return an error.
#[derive(Clone)]
pub struct Handle {
    control: UnboundedSender<Control>,
    local_addrs: Vec<SocketAddr>,
    default_reply_timeout: Duration,
}

impl Handle {
    pub(crate) fn new(
        control: UnboundedSender<Control>,
        local_addrs: Vec<SocketAddr>,
        default_reply_timeout: Duration,
    ) -> Self {
        Self {
            control,
            local_addrs,
            default_reply_timeout,
        }
    }

    /// Addresses the node's listeners are actually bound to, in registration
    /// order. Useful when a listener was configured on port 0.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Posts a fire-and-forget command onto a connection.
    pub fn send<I>(&self, to: ConnectionId, command: impl Into<String>, parts: I) -> Result<()>
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.post(Control::Send {
            to,
            command: command.into(),
            parts: parts.into_iter().collect(),
        })
    }

    /// Issues a request command with the node's default reply timeout.
    ///
    /// The continuation is invoked exactly once: with the reply payload, or
    /// with the timeout / lost-connection / remote-rejection error.
    pub fn request<I, F>(
        &self,
        to: ConnectionId,
        command: impl Into<String>,
        parts: I,
        continuation: F,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Bytes>,
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.request_with_timeout(to, command, parts, self.default_reply_timeout, continuation)
    }

    /// Issues a request command with an explicit reply timeout.
    pub fn request_with_timeout<I, F>(
        &self,
        to: ConnectionId,
        command: impl Into<String>,
        parts: I,
        timeout: Duration,
        continuation: F,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Bytes>,
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.post(Control::Request {
            to,
            command: command.into(),
            parts: parts.into_iter().collect(),
            timeout,
            continuation: Box::new(continuation),
        })
    }

    /// Opens an outgoing link to an arbitrary remote and returns its
    /// connection identity. The link handshakes in the background; sends
    /// issued before it is up are queued on it.
    pub async fn connect_remote(
        &self,
        addr: SocketAddr,
        options: ConnectOptions,
    ) -> Result<ConnectionId> {
        let (done, conn) = oneshot::channel();
        self.post(Control::ConnectRemote {
            addr,
            options,
            done,
        })?;

        conn.await
            .context("node is shut down")?
            .map_err(anyhow::Error::msg)
    }

    /// Opens an outgoing link to a service node at the given address. The
    /// returned identity is the pubkey itself, so later sends route to
    /// whichever live link terminates that peer.
    pub async fn connect_sn(&self, pubkey: PubKey, addr: SocketAddr) -> Result<ConnectionId> {
        let (done, conn) = oneshot::channel();
        self.post(Control::ConnectSn { pubkey, addr, done })?;

        conn.await
            .context("node is shut down")?
            .map_err(anyhow::Error::msg)
    }

    /// Administratively closes a connection. Pending requests issued on it
    /// complete with a lost-connection error.
    pub fn disconnect(&self, conn: ConnectionId) -> Result<()> {
        self.post(Control::Disconnect { conn })
    }

    /// Stops the proxy loop, closes every connection, and drains the worker
    /// pool.
    pub fn shutdown(&self) -> Result<()> {
        self.post(Control::Shutdown)
    }

    fn post(&self, op: Control) -> Result<()> {
        self.control
            .send(op)
            .map_err(|_| anyhow::anyhow!("node is shut down"))
    }
}
