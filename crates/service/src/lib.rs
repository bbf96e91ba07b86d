//! Transport-agnostic dispatch core for curvemq.
//!
//! Everything here is independent of the socket layer: peer identity
//! ([`connection::ConnectionId`]), authorization policy ([`auth::Access`]),
//! the command registry ([`registry::Registry`]), correlation of outgoing
//! requests ([`replies::ReplyTable`]), and the executor pool that runs
//! command handlers ([`workers::WorkerPool`]). The proxy loop in the server
//! crate wires these together around the actual sockets.

pub mod auth;
pub mod connection;
pub mod message;
pub mod registry;
pub mod replies;
pub mod workers;

pub use auth::{Access, Allow, AllowFn, AuthLevel};
pub use connection::{ConnectionId, PubKey, PubKeyError};
pub use message::{Directive, Message, ProxySender};
pub use registry::{CategoryBuilder, CommandKind, Registry, RegistryError};
pub use replies::{
    DEFAULT_REPLY_TIMEOUT, ReplyContinuation, ReplyError, ReplyResult, ReplyTable,
};
pub use workers::{Backlog, Job, WorkerPool, WorkerPoolOptions};
