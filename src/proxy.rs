//! The proxy loop: a single task owning every socket-facing table.
//!
//! All dispatch-level state lives here: connection identities and handshake
//! states, the service node link index, and the reply correlation table. The
//! loop processes events in strict priority order on each wakeup. Outgoing
//! directives from workers come first, then control operations from the
//! embedder's handle, then timer work (reply expiry, idle sweep), and only
//! then new frames from peers, with ingress reads stalled entirely while the
//! worker pool is past its high watermark.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use bytes::{BufMut, Bytes, BytesMut};
use codec::Reason;
use service::{
    auth::{Allow, AuthLevel},
    connection::{ConnectionId, PubKey},
    message::{Directive, Message, ProxySender},
    registry::{CommandKind, Registry},
    replies::{ReplyContinuation, ReplyError, ReplyTable},
    workers::{Backlog, Job, WorkerPool},
};
use tokio::sync::mpsc::{Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};

use crate::{
    config::Config,
    server::{self, SocketEvent},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Options for an outgoing link.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Perform the curve identity exchange on this link. Implied when
    /// `remote_pubkey` is set.
    pub curve: bool,
    /// Expected remote identity; the dial fails on a mismatch.
    pub remote_pubkey: Option<PubKey>,
    /// Grant applied to commands the peer sends us over this link.
    pub allow: Allow,
}

/// Control operations posted from the embedder-facing handle.
pub enum Control {
    Send {
        to: ConnectionId,
        command: String,
        parts: Vec<Bytes>,
    },
    Request {
        to: ConnectionId,
        command: String,
        parts: Vec<Bytes>,
        timeout: Duration,
        continuation: ReplyContinuation,
    },
    ConnectRemote {
        addr: SocketAddr,
        options: ConnectOptions,
        done: oneshot::Sender<Result<ConnectionId, String>>,
    },
    ConnectSn {
        pubkey: PubKey,
        addr: SocketAddr,
        done: oneshot::Sender<Result<ConnectionId, String>>,
    },
    Disconnect {
        conn: ConnectionId,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Accepted; nothing is dispatched until the peer's lone `HI` arrives.
    PreHandshake,
    /// Outgoing; dialing, or `HI` sent and `HELLO` still outstanding.
    AwaitingHello,
    Ready,
}

struct Connection {
    peer: ConnectionId,
    addr: SocketAddr,
    state: LinkState,
    outgoing: bool,
    allow: Allow,
    writer: Option<UnboundedSender<Vec<Bytes>>>,
    /// Sends issued before an outgoing link finished its handshake.
    queued: Vec<Vec<Bytes>>,
    last_activity: Instant,
}

pub struct Proxy {
    config: Config,
    registry: Arc<Registry>,
    pool: WorkerPool,
    backlog: Backlog,
    replies: ReplyTable,
    conns: HashMap<u64, Connection>,
    /// Live link currently terminating each known service node.
    sn_links: HashMap<PubKey, u64>,
    tokens: Arc<AtomicU64>,
    ingress_tx: Sender<SocketEvent>,
    proxy_tx: ProxySender,
    shutdown: watch::Sender<bool>,
    last_sweep: Instant,
}

impl Proxy {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config,
        registry: Arc<Registry>,
        pool: WorkerPool,
        proxy_tx: ProxySender,
        tokens: Arc<AtomicU64>,
        ingress_tx: Sender<SocketEvent>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let backlog = pool.backlog();
        Self {
            config,
            registry,
            pool,
            backlog,
            replies: ReplyTable::default(),
            conns: HashMap::new(),
            sn_links: HashMap::new(),
            tokens,
            ingress_tx,
            proxy_tx,
            shutdown,
            last_sweep: Instant::now(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut directives: UnboundedReceiver<Directive>,
        mut control: UnboundedReceiver<Control>,
        mut ingress: Receiver<SocketEvent>,
    ) {
        log::info!(
            "proxy loop started: workers={}, service_node={}",
            self.config.workers,
            self.config.service_node,
        );

        let backlog = self.backlog.clone();
        loop {
            let saturated = backlog.saturated();
            let wake = self.next_wake();

            tokio::select! {
                biased;

                Some(directive) = directives.recv() => self.apply_directive(directive),
                Some(op) = control.recv() => {
                    if self.apply_control(op) {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wake) => self.on_timer(),
                _ = backlog.drained(), if saturated => {}
                event = ingress.recv(), if !saturated => match event {
                    Some(event) => self.on_socket_event(event),
                    None => break,
                },
            }
        }

        let _ = self.shutdown.send(true);
        self.retire_all();
        log::info!("proxy loop stopped");
    }

    /// The poll wait is bounded by the nearest reply deadline and the idle
    /// sweep cadence; the loop never blocks on anything else.
    fn next_wake(&self) -> tokio::time::Instant {
        let sweep = self.last_sweep + SWEEP_INTERVAL;
        let wake = match self.replies.next_deadline() {
            Some(deadline) => deadline.min(sweep),
            None => sweep,
        };

        tokio::time::Instant::from_std(wake)
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        self.replies.expire(now);

        if now.duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            self.last_sweep = now;
            self.sweep_idle(now);
        }
    }

    fn sweep_idle(&mut self, now: Instant) {
        let idle = self.config.idle_timeout_duration();
        let handshake = self.config.handshake_timeout_duration();

        let expired: Vec<u64> = self
            .conns
            .iter()
            .filter_map(|(token, conn)| {
                let dead = match conn.state {
                    LinkState::Ready => {
                        !conn.outgoing && now.duration_since(conn.last_activity) > idle
                    }
                    LinkState::PreHandshake | LinkState::AwaitingHello => {
                        now.duration_since(conn.last_activity) > handshake
                    }
                };

                dead.then_some(*token)
            })
            .collect();

        for token in expired {
            if let Some(conn) = self.conns.get(&token) {
                log::info!("connection timed out: conn={}, addr={}", conn.peer, conn.addr);
            }
            self.retire(token);
        }
    }

    fn apply_directive(&mut self, directive: Directive) {
        match self.resolve(&directive.to) {
            Some(token) => self.write_frames(token, directive.frames),
            None => log::warn!("send to unknown connection dropped: conn={}", directive.to),
        }
    }

    fn apply_control(&mut self, op: Control) -> bool {
        match op {
            Control::Send { to, command, parts } => {
                let mut frames = Vec::with_capacity(parts.len() + 1);
                frames.push(Bytes::from(command.into_bytes()));
                frames.extend(parts);

                match self.resolve(&to) {
                    Some(token) => self.write_frames(token, frames),
                    None => log::warn!("send to unknown connection dropped: conn={}", to),
                }
            }
            Control::Request {
                to,
                command,
                parts,
                timeout,
                continuation,
            } => {
                let Some(token) = self.resolve(&to) else {
                    continuation(Err(ReplyError::ConnectionLost));
                    return false;
                };

                let tag = self.replies.register(to, timeout, continuation);
                let mut frames = Vec::with_capacity(parts.len() + 2);
                frames.push(Bytes::from(command.into_bytes()));
                frames.push(tag);
                frames.extend(parts);
                self.write_frames(token, frames);
            }
            Control::ConnectRemote {
                addr,
                options,
                done,
            } => {
                let _ = done.send(self.open_outgoing(addr, options, None));
            }
            Control::ConnectSn { pubkey, addr, done } => {
                let options = ConnectOptions {
                    curve: true,
                    remote_pubkey: Some(pubkey),
                    allow: Allow {
                        level: AuthLevel::None,
                        service_node: true,
                    },
                };

                let _ = done.send(self.open_outgoing(addr, options, Some(pubkey)));
            }
            Control::Disconnect { conn } => match self.resolve(&conn) {
                Some(token) => self.retire(token),
                None => log::warn!("disconnect of unknown connection ignored: conn={}", conn),
            },
            Control::Shutdown => return true,
        }

        false
    }

    fn open_outgoing(
        &mut self,
        addr: SocketAddr,
        options: ConnectOptions,
        sn: Option<PubKey>,
    ) -> Result<ConnectionId, String> {
        let curve = options.curve || options.remote_pubkey.is_some();
        let local = match (curve, self.config.pubkey) {
            (true, None) => {
                return Err("curve link requires a configured local pubkey".to_string());
            }
            (true, Some(pubkey)) => Some(PubKey::from(pubkey)),
            (false, _) => None,
        };

        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let peer = match sn {
            Some(pubkey) => {
                self.sn_links.insert(pubkey, token);
                ConnectionId::sn(pubkey)
            }
            None => ConnectionId::remote(token, Bytes::new()),
        };

        self.conns.insert(
            token,
            Connection {
                peer: peer.clone(),
                addr,
                state: LinkState::AwaitingHello,
                outgoing: true,
                allow: options.allow,
                writer: None,
                queued: Vec::new(),
                last_activity: Instant::now(),
            },
        );

        log::info!("connecting: conn={}, addr={}", peer, addr);
        server::spawn_outgoing(
            addr,
            token,
            local,
            options.remote_pubkey,
            self.ingress_tx.clone(),
        );

        Ok(peer)
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Accepted {
                token,
                addr,
                pubkey,
                allow,
                writer,
            } => {
                let allow = allow
                    .map(|grant| grant(&addr, pubkey.as_ref()))
                    .unwrap_or_default();

                let peer = match (pubkey, allow.service_node) {
                    (Some(pubkey), true) => {
                        self.sn_links.insert(pubkey, token);
                        ConnectionId::sn(pubkey)
                    }
                    _ => ConnectionId::remote(token, route_for(token)),
                };

                log::info!(
                    "connection admitted: conn={}, addr={}, level={}",
                    peer,
                    addr,
                    allow.level,
                );

                self.conns.insert(
                    token,
                    Connection {
                        peer,
                        addr,
                        state: LinkState::PreHandshake,
                        outgoing: false,
                        allow,
                        writer: Some(writer),
                        queued: Vec::new(),
                        last_activity: Instant::now(),
                    },
                );
            }
            SocketEvent::Connected {
                token,
                addr,
                pubkey,
                writer,
            } => {
                // Retired while the dial was in flight; dropping the writer
                // tears the fresh link down again.
                let Some(conn) = self.conns.get_mut(&token) else {
                    return;
                };

                log::info!(
                    "outgoing link up: conn={}, addr={}, pubkey={:?}",
                    conn.peer,
                    addr,
                    pubkey,
                );

                let _ = writer.send(vec![Bytes::from_static(codec::HI)]);
                conn.writer = Some(writer);
                conn.last_activity = Instant::now();
            }
            SocketEvent::ConnectFailed { token, error } => {
                if let Some(conn) = self.conns.get(&token) {
                    log::warn!(
                        "outgoing connect failed: conn={}, addr={}, err={}",
                        conn.peer,
                        conn.addr,
                        error,
                    );
                }
                self.retire(token);
            }
            SocketEvent::Frames { token, frames } => self.on_frames(token, frames),
            SocketEvent::Closed { token } => self.retire(token),
        }
    }

    fn on_frames(&mut self, token: u64, frames: Vec<Bytes>) {
        if frames.is_empty() {
            return;
        }

        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        conn.last_activity = Instant::now();

        match conn.state {
            LinkState::PreHandshake => {
                // The first thing on an accepted link must be a lone HI;
                // anything else is discarded without reply.
                if frames.len() == 1 && frames[0] == codec::HI {
                    conn.state = LinkState::Ready;
                    if let Some(writer) = &conn.writer {
                        let _ = writer.send(vec![Bytes::from_static(codec::HELLO)]);
                    }
                    log::debug!("handshake complete: conn={}", conn.peer);
                } else {
                    log::warn!(
                        "bad handshake, discarding connection: conn={}, addr={}",
                        conn.peer,
                        conn.addr,
                    );
                    self.retire(token);
                }
            }
            LinkState::AwaitingHello => {
                if frames.len() == 1 && frames[0] == codec::HELLO {
                    conn.state = LinkState::Ready;
                    log::debug!("outgoing handshake complete: conn={}", conn.peer);

                    let queued = std::mem::take(&mut conn.queued);
                    if let Some(writer) = &conn.writer {
                        for frames in queued {
                            let _ = writer.send(frames);
                        }
                    }
                } else {
                    log::warn!(
                        "unexpected frames before HELLO, dropping link: conn={}",
                        conn.peer,
                    );
                    self.retire(token);
                }
            }
            LinkState::Ready => self.dispatch(token, frames),
        }
    }

    fn dispatch(&mut self, token: u64, frames: Vec<Bytes>) {
        // A reply to a request this process originated.
        if frames[0] == codec::REPLY {
            if frames.len() < 2 {
                log::warn!("malformed REPLY with no tag: conn={}", token);
                return;
            }

            let payload = frames[2..].to_vec();
            self.replies.complete(&frames[1], payload);
            return;
        }

        // A peer rejecting one of our requests: reason, REPLY, tag.
        if frames.len() == 3 && frames[1] == codec::REPLY {
            if let Some(reason) = Reason::from_bytes(&frames[0]) {
                self.replies.fail(&frames[2], ReplyError::Remote(reason));
                return;
            }
        }

        // A peer rejecting a fire-and-forget send: reason, echoed command.
        if frames.len() == 2 {
            if let Some(reason) = Reason::from_bytes(&frames[0]) {
                log::warn!(
                    "peer rejected command: conn={}, reason={}, command={:?}",
                    token,
                    reason,
                    frames[1],
                );
                return;
            }
        }

        let (peer, allow) = {
            let conn = &self.conns[&token];
            (conn.peer.clone(), conn.allow)
        };

        let command_frame = frames[0].clone();
        let Some(command) = std::str::from_utf8(&command_frame)
            .ok()
            .map(|command| command.to_owned())
        else {
            self.send_failure(token, Reason::UnknownCommand, command_frame, None);
            return;
        };

        let Some(resolved) = self.registry.lookup(&command) else {
            self.send_failure(token, Reason::UnknownCommand, command_frame, None);
            return;
        };

        let is_request = resolved.kind == CommandKind::Request;
        let reply_tag = if is_request {
            frames.get(1).filter(|tag| !tag.is_empty()).cloned()
        } else {
            None
        };

        if let Err(reason) =
            resolved
                .access
                .check(allow.level, self.config.service_node, allow.service_node)
        {
            self.send_failure(token, reason, command_frame, reply_tag);
            return;
        }

        if is_request && reply_tag.is_none() {
            self.send_failure(token, Reason::NoReplyTag, command_frame, None);
            return;
        }

        let skip = if is_request { 2 } else { 1 };
        let body: Vec<Bytes> = frames.into_iter().skip(skip).collect();

        log::debug!("dispatching command: conn={}, command={}", peer, command);
        self.pool.submit(Job {
            handler: resolved.handler,
            message: Message::new(
                peer,
                allow.level,
                command,
                body,
                reply_tag,
                self.proxy_tx.clone(),
            ),
        });
    }

    /// Emits a failure response without terminating the connection: two
    /// frames `reason, echoed-command`, or `reason, REPLY, tag` when the
    /// rejected invocation carried a reply tag so the caller's correlation
    /// table is notified instead of timing out.
    fn send_failure(
        &mut self,
        token: u64,
        reason: Reason,
        command: Bytes,
        reply_tag: Option<Bytes>,
    ) {
        log::debug!(
            "rejecting command: conn={}, reason={}, command={:?}",
            token,
            reason,
            command,
        );

        let frames = match reply_tag {
            Some(tag) => vec![
                Bytes::from_static(reason.as_bytes()),
                Bytes::from_static(codec::REPLY),
                tag,
            ],
            None => vec![Bytes::from_static(reason.as_bytes()), command],
        };

        self.write_frames(token, frames);
    }

    fn write_frames(&mut self, token: u64, frames: Vec<Bytes>) {
        let Some(conn) = self.conns.get_mut(&token) else {
            log::warn!("write to retired connection dropped: conn={}", token);
            return;
        };

        let ready = conn.state == LinkState::Ready;
        match &conn.writer {
            Some(writer) if ready || !conn.outgoing => {
                let _ = writer.send(frames);
            }
            _ => conn.queued.push(frames),
        }
    }

    fn resolve(&self, id: &ConnectionId) -> Option<u64> {
        match id {
            ConnectionId::ServiceNode(pubkey) => self.sn_links.get(pubkey).copied(),
            ConnectionId::Remote { id: token, .. } => {
                let conn = self.conns.get(token)?;
                (conn.peer == *id).then_some(*token)
            }
        }
    }

    fn retire(&mut self, token: u64) {
        let Some(conn) = self.conns.remove(&token) else {
            return;
        };

        if let ConnectionId::ServiceNode(pubkey) = &conn.peer {
            if self.sn_links.get(pubkey) == Some(&token) {
                self.sn_links.remove(pubkey);
            }
        }

        // Anything still waiting on this link is cancelled, not left to time
        // out.
        self.replies.drop_connection(&conn.peer);
        log::info!("connection closed: conn={}, addr={}", conn.peer, conn.addr);
    }

    fn retire_all(&mut self) {
        for token in self.conns.keys().copied().collect::<Vec<_>>() {
            self.retire(token);
        }
    }
}

/// Router-style return path for an accepted peer: a zero octet plus the
/// connection counter.
fn route_for(token: u64) -> Bytes {
    let mut route = BytesMut::with_capacity(5);
    route.put_u8(0);
    route.put_u32(token as u32);
    route.freeze()
}
