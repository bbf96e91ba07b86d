//! Message-oriented RPC and event framework over authenticated dealer/router
//! links.
//!
//! Peers, whether service nodes in a permissioned overlay or arbitrary
//! authenticated remotes, exchange categorised commands, optionally receive
//! replies, and are subject to per-command authorization checks. A single
//! proxy loop owns all sockets; command handlers run on a bounded worker pool
//! with per-connection ordering, and report back to the loop through
//! non-blocking directives.
//!
//! ```no_run
//! use curvemq::{AuthLevel, Config, Node};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut node = Node::new(Config::default());
//!     node.add_category("sys", AuthLevel::Basic)?
//!         .add_request_command("ping", |message| {
//!             message.send_reply([bytes::Bytes::from_static(b"pong")]);
//!         })?;
//!
//!     node.listen_plain("127.0.0.1:7700".parse()?, None);
//!     let handle = node.start().await?;
//!     # drop(handle);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod handle;
pub mod node;
pub mod proxy;
pub mod server;

pub use config::Config;
pub use handle::Handle;
pub use node::Node;
pub use proxy::ConnectOptions;

// The dispatch core, re-exported for embedders.
pub use service::{
    Access, Allow, AllowFn, AuthLevel, ConnectionId, Message, PubKey, PubKeyError, RegistryError,
    ReplyError, ReplyResult, DEFAULT_REPLY_TIMEOUT,
};
