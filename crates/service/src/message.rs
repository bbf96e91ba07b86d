use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::{auth::AuthLevel, connection::ConnectionId};

/// Outgoing frames marshalled from a worker (or the embedder's handle) to the
/// proxy loop, which owns every socket. Posting is a lock-free enqueue and
/// never blocks the caller.
#[derive(Debug)]
pub struct Directive {
    pub to: ConnectionId,
    pub frames: Vec<Bytes>,
}

/// Cloneable producer half of the worker-to-proxy channel.
#[derive(Clone)]
pub struct ProxySender(UnboundedSender<Directive>);

impl ProxySender {
    pub fn new(sender: UnboundedSender<Directive>) -> Self {
        Self(sender)
    }

    pub fn post(&self, directive: Directive) {
        if self.0.send(directive).is_err() {
            log::debug!("proxy loop is gone, dropping directive");
        }
    }
}

/// Command context handed to a handler.
///
/// Exposes the peer's identity and granted tier along with the body frames.
/// Handlers never touch sockets: replies and follow-up sends are marshalled
/// back to the proxy loop as directives.
pub struct Message {
    conn: ConnectionId,
    auth_level: AuthLevel,
    command: String,
    frames: Vec<Bytes>,
    reply_tag: Option<Bytes>,
    proxy: ProxySender,
}

impl Message {
    pub fn new(
        conn: ConnectionId,
        auth_level: AuthLevel,
        command: String,
        frames: Vec<Bytes>,
        reply_tag: Option<Bytes>,
        proxy: ProxySender,
    ) -> Self {
        Self {
            conn,
            auth_level,
            command,
            frames,
            reply_tag,
            proxy,
        }
    }

    /// Identity of the peer that sent the command.
    pub fn conn(&self) -> &ConnectionId {
        &self.conn
    }

    pub fn auth_level(&self) -> AuthLevel {
        self.auth_level
    }

    /// The `category.command` name this message was dispatched as.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Body frames, with the command name and reply tag already stripped.
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// True when the command was registered as a request and a reply tag was
    /// supplied.
    pub fn is_request(&self) -> bool {
        self.reply_tag.is_some()
    }

    pub fn reply_tag(&self) -> Option<&Bytes> {
        self.reply_tag.as_ref()
    }

    pub fn proxy(&self) -> ProxySender {
        self.proxy.clone()
    }

    /// Sends the reply for a request command: `REPLY`, the caller's tag, then
    /// the given payload frames.
    ///
    /// For a command not invoked as a request there is nothing to correlate
    /// the reply with, so the call is logged and dropped.
    pub fn send_reply<I>(&self, parts: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        let Some(tag) = &self.reply_tag else {
            log::warn!(
                "send_reply on a non-request command, dropping: conn={}, command={}",
                self.conn,
                self.command
            );
            return;
        };

        let mut frames = vec![Bytes::from_static(codec::REPLY), tag.clone()];
        frames.extend(parts);
        self.proxy.post(Directive {
            to: self.conn.clone(),
            frames,
        });
    }

    /// Posts new frames onto the originating connection, regardless of the
    /// command kind.
    pub fn send_back<I>(&self, frames: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.proxy.post(Directive {
            to: self.conn.clone(),
            frames: frames.into_iter().collect(),
        });
    }
}
