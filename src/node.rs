use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use anyhow::Result;
use service::{
    auth::{Access, AllowFn},
    connection::PubKey,
    message::ProxySender,
    registry::{CategoryBuilder, Registry, RegistryError},
    workers::{WorkerPool, WorkerPoolOptions},
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{channel, unbounded_channel};
use tokio::sync::watch;

use crate::{config::Config, handle::Handle, proxy::Proxy, server};

/// Sockets a stalled proxy stops draining exert TCP backpressure through
/// this bound; it only needs to cover the gap until readers park on a full
/// channel.
const INGRESS_BACKLOG: usize = 64;

struct ListenerSpec {
    addr: SocketAddr,
    curve: bool,
    allow: Option<AllowFn>,
}

/// Builder for a curvemq node.
///
/// Categories and listeners are registered up front; [`start`](Node::start)
/// binds the sockets, launches the proxy loop and worker pool, and returns
/// the running [`Handle`]. The registry is immutable from that point on.
pub struct Node {
    config: Config,
    registry: Registry,
    listeners: Vec<ListenerSpec>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Registry::default(),
            listeners: Vec::new(),
        }
    }

    /// Registers a command category; commands are added through the returned
    /// builder. Duplicate names and names containing `'.'` are rejected.
    pub fn add_category(
        &mut self,
        name: impl Into<String>,
        access: impl Into<Access>,
    ) -> Result<CategoryBuilder<'_>, RegistryError> {
        self.registry.add_category(name, access)
    }

    /// Adds a plaintext listener. Peers get no transport-verified pubkey;
    /// `allow` decides their grant, defaulting to no authorization at all.
    pub fn listen_plain(&mut self, addr: SocketAddr, allow: Option<AllowFn>) -> &mut Self {
        self.listeners.push(ListenerSpec {
            addr,
            curve: false,
            allow,
        });
        self
    }

    /// Adds a curve listener. Peers present their 32-byte identity during the
    /// transport preamble and `allow` sees it verified.
    pub fn listen_curve(&mut self, addr: SocketAddr, allow: Option<AllowFn>) -> &mut Self {
        self.listeners.push(ListenerSpec {
            addr,
            curve: true,
            allow,
        });
        self
    }

    /// Binds every listener and launches the node.
    ///
    /// Bind failures and configuration conflicts surface here, synchronously;
    /// nothing is spawned until all listeners are bound.
    pub async fn start(self) -> Result<Handle> {
        anyhow::ensure!(
            self.config.pending_lowater < self.config.pending_hiwater,
            "pending low watermark must be below the high watermark",
        );

        let local_pubkey = self.config.pubkey.map(PubKey::from);
        if self.listeners.iter().any(|listener| listener.curve) && local_pubkey.is_none() {
            anyhow::bail!("curve listeners require a configured local pubkey");
        }

        let mut bound = Vec::with_capacity(self.listeners.len());
        let mut local_addrs = Vec::with_capacity(self.listeners.len());
        for spec in self.listeners {
            let listener = TcpListener::bind(spec.addr).await?;
            let addr = listener.local_addr()?;
            log::info!("listening: addr={}, curve={}", addr, spec.curve);

            local_addrs.push(addr);
            bound.push((listener, spec));
        }

        let (directive_tx, directive_rx) = unbounded_channel();
        let (control_tx, control_rx) = unbounded_channel();
        let (ingress_tx, ingress_rx) = channel(INGRESS_BACKLOG);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Connection handles start at 1; 0 is reserved as the invalid id.
        let tokens = Arc::new(AtomicU64::new(1));

        let pool = WorkerPool::start(WorkerPoolOptions {
            workers: self.config.workers,
            pending_hiwater: self.config.pending_hiwater,
            pending_lowater: self.config.pending_lowater,
        });

        for (listener, spec) in bound {
            // Validated above: a curve listener implies a configured pubkey.
            let curve = match (spec.curve, local_pubkey) {
                (true, Some(pubkey)) => Some(pubkey),
                _ => None,
            };

            tokio::spawn(server::accept_loop(
                listener,
                curve,
                spec.allow,
                tokens.clone(),
                ingress_tx.clone(),
                shutdown_rx.clone(),
            ));
        }

        let default_reply_timeout = self.config.reply_timeout_duration();
        let proxy = Proxy::new(
            self.config,
            Arc::new(self.registry),
            pool,
            ProxySender::new(directive_tx),
            tokens,
            ingress_tx,
            shutdown_tx,
        );
        tokio::spawn(proxy.run(directive_rx, control_rx, ingress_rx));

        Ok(Handle::new(control_tx, local_addrs, default_reply_timeout))
    }
}
