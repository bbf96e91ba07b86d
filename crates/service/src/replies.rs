use std::fmt;
use std::time::{Duration, Instant};

use ahash::HashMap;
use bytes::Bytes;
use codec::Reason;
use rand::Rng;

use crate::connection::ConnectionId;

/// Correlation timeout applied when the caller does not supply one.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// Reply tags are uniformly random bytes of this length, which keeps
/// collisions negligible and prediction impractical.
pub const TAG_LEN: usize = 8;

/// Why a pending request completed without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// The deadline passed without a matching reply.
    Timeout,
    /// The connection the request went out on is gone.
    ConnectionLost,
    /// The peer rejected the request with a failure response.
    Remote(Reason),
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Remote(reason) => write!(f, "peer rejected request: {reason}"),
        }
    }
}

pub type ReplyResult = Result<Vec<Bytes>, ReplyError>;

/// Continuation invoked exactly once when a pending request resolves.
pub type ReplyContinuation = Box<dyn FnOnce(ReplyResult) + Send + 'static>;

struct Pending {
    continuation: ReplyContinuation,
    deadline: Instant,
    owner: ConnectionId,
}

/// Correlation table for requests this process has issued.
///
/// Owned by the proxy loop; workers never touch it directly. Size is bounded
/// by the number of outstanding requests and shrinks monotonically while no
/// new requests are registered.
#[derive(Default)]
pub struct ReplyTable {
    entries: HashMap<Bytes, Pending>,
}

impl ReplyTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a continuation and allocates a fresh tag for it.
    pub fn register(
        &mut self,
        owner: ConnectionId,
        timeout: Duration,
        continuation: ReplyContinuation,
    ) -> Bytes {
        loop {
            let tag = Bytes::copy_from_slice(&rand::rng().random::<[u8; TAG_LEN]>());
            if self.entries.contains_key(&tag[..]) {
                continue;
            }

            self.entries.insert(
                tag.clone(),
                Pending {
                    continuation,
                    deadline: Instant::now() + timeout,
                    owner,
                },
            );

            return tag;
        }
    }

    /// Invokes the continuation registered for `tag` with the reply payload.
    ///
    /// Returns false when no entry matches; a second reply for an already
    /// completed tag lands here and is dropped silently.
    pub fn complete(&mut self, tag: &[u8], frames: Vec<Bytes>) -> bool {
        match self.entries.remove(tag) {
            Some(pending) => {
                (pending.continuation)(Ok(frames));
                true
            }
            None => {
                log::debug!("dropping reply with no pending entry: tag={:?}", tag);
                false
            }
        }
    }

    /// Resolves the entry for `tag` with an error instead of a payload.
    pub fn fail(&mut self, tag: &[u8], error: ReplyError) -> bool {
        match self.entries.remove(tag) {
            Some(pending) => {
                (pending.continuation)(Err(error));
                true
            }
            None => false,
        }
    }

    /// Removes and cancels every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        let expired: Vec<Bytes> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in expired {
            if let Some(pending) = self.entries.remove(&tag[..]) {
                log::debug!("pending request expired: tag={:?}, conn={}", tag, pending.owner);
                (pending.continuation)(Err(ReplyError::Timeout));
            }
        }
    }

    /// Cancels every entry owned by a connection that has gone dead.
    pub fn drop_connection(&mut self, conn: &ConnectionId) {
        let lost: Vec<Bytes> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.owner == *conn)
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in lost {
            if let Some(pending) = self.entries.remove(&tag[..]) {
                (pending.continuation)(Err(ReplyError::ConnectionLost));
            }
        }
    }

    /// The nearest outstanding deadline; bounds the proxy's poll wait.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|pending| pending.deadline).min()
    }
}
