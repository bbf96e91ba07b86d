use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Node configuration, supplied programmatically by the embedder.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// Whether this process serves commands restricted to service nodes.
    ///
    /// Commands registered with a local-service-node-only access policy are
    /// rejected with `NOT_A_SERVICE_NODE` unless this is set.
    ///
    #[serde(default)]
    pub service_node: bool,
    ///
    /// Public key advertised on curve listeners and outgoing curve links.
    ///
    /// Required once any curve endpoint is configured; plain-only nodes can
    /// leave it unset. Key generation itself is up to the embedder's
    /// cryptographic library.
    ///
    #[serde(default)]
    pub pubkey: Option<[u8; 32]>,
    ///
    /// Number of worker threads executing command handlers.
    ///
    #[serde(default = "Config::workers")]
    pub workers: usize,
    ///
    /// Pending-job count above which ingress reads stall.
    ///
    #[serde(default = "Config::pending_hiwater")]
    pub pending_hiwater: usize,
    ///
    /// Once stalled, ingress resumes when the backlog falls below this.
    ///
    #[serde(default = "Config::pending_lowater")]
    pub pending_lowater: usize,
    ///
    /// Default reply correlation timeout in milliseconds, applied to requests
    /// issued without an explicit timeout.
    ///
    #[serde(default = "Config::reply_timeout")]
    pub reply_timeout: u64,
    ///
    /// Idle timeout
    ///
    /// If no message is received within the specified number of seconds, an
    /// accepted connection is retired to prevent resources from being
    /// occupied indefinitely. Outgoing connections are exempt.
    ///
    #[serde(default = "Config::idle_timeout")]
    pub idle_timeout: u32,
    ///
    /// Seconds a freshly accepted connection may sit in the handshake state
    /// before it is discarded.
    ///
    #[serde(default = "Config::handshake_timeout")]
    pub handshake_timeout: u32,
}

impl Config {
    fn workers() -> usize {
        num_cpus::get()
    }

    fn pending_hiwater() -> usize {
        500
    }

    fn pending_lowater() -> usize {
        250
    }

    fn reply_timeout() -> u64 {
        15_000
    }

    fn idle_timeout() -> u32 {
        60
    }

    fn handshake_timeout() -> u32 {
        10
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_node: false,
            pubkey: None,
            workers: Self::workers(),
            pending_hiwater: Self::pending_hiwater(),
            pending_lowater: Self::pending_lowater(),
            reply_timeout: Self::reply_timeout(),
            idle_timeout: Self::idle_timeout(),
            handshake_timeout: Self::handshake_timeout(),
        }
    }
}

impl Config {
    pub fn reply_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.reply_timeout)
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout as u64)
    }

    pub fn handshake_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout as u64)
    }
}
