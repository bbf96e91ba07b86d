use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use ahash::HashMap;
use bytes::Bytes;
use codec::Reason;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::{
    connection::ConnectionId,
    message::{Directive, Message},
    registry::CommandHandler,
};

#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    /// Number of executor threads.
    pub workers: usize,
    /// Pending-job count above which the proxy stops pulling ingress.
    pub pending_hiwater: usize,
    /// Once stalled, ingress resumes when the backlog falls below this.
    pub pending_lowater: usize,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            pending_hiwater: 500,
            pending_lowater: 250,
        }
    }
}

/// A handler invocation bound for an executor thread.
pub struct Job {
    pub handler: CommandHandler,
    pub message: Message,
}

#[derive(Default)]
struct ConnQueue {
    jobs: VecDeque<Job>,
    /// True while the connection sits in the ready list or a worker is
    /// draining it; at most one worker runs a given connection's jobs, which
    /// is what keeps them in submission order.
    active: bool,
}

#[derive(Default)]
struct Queues {
    map: HashMap<ConnectionId, ConnQueue>,
    ready: VecDeque<ConnectionId>,
    shutdown: bool,
}

struct Shared {
    queues: Mutex<Queues>,
    available: Condvar,
    pending: AtomicUsize,
    hiwater: usize,
    lowater: usize,
    drained: Notify,
}

/// Watermark view of the pool's backlog, cheap to clone and safe to await on
/// from the proxy loop.
#[derive(Clone)]
pub struct Backlog {
    shared: Arc<Shared>,
}

impl Backlog {
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// True once the backlog has crossed the high watermark; the caller
    /// should stop pulling ingress until [`drained`](Self::drained) resolves.
    pub fn saturated(&self) -> bool {
        self.pending() >= self.shared.hiwater
    }

    /// Resolves once the backlog has fallen back below the low watermark.
    pub async fn drained(&self) {
        loop {
            if self.pending() <= self.shared.lowater {
                return;
            }

            let notified = self.shared.drained.notified();
            if self.pending() <= self.shared.lowater {
                return;
            }

            notified.await;
        }
    }
}

/// Fixed-size pool of executor threads.
///
/// Jobs are queued per connection: jobs from the same connection run in
/// submission order relative to each other, while unrelated connections are
/// drained concurrently. No job is ever dropped; overload is handled by the
/// watermark backpressure in [`Backlog`].
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(options: WorkerPoolOptions) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            available: Condvar::new(),
            pending: AtomicUsize::new(0),
            hiwater: options.pending_hiwater,
            lowater: options.pending_lowater,
            drained: Notify::new(),
        });

        let threads = (0..options.workers.max(1))
            .map(|index| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("curvemq-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning worker thread failed!")
            })
            .collect();

        log::info!(
            "worker pool started: workers={}, hiwater={}, lowater={}",
            options.workers.max(1),
            options.pending_hiwater,
            options.pending_lowater,
        );

        Self { shared, threads }
    }

    pub fn backlog(&self) -> Backlog {
        Backlog {
            shared: self.shared.clone(),
        }
    }

    /// Enqueues a job behind any other jobs from the same connection.
    pub fn submit(&self, job: Job) {
        let conn = job.message.conn().clone();
        let mut queues = self.shared.queues.lock();
        if queues.shutdown {
            log::warn!("worker pool shut down, dropping job: conn={}", conn);
            return;
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);

        let queue = queues.map.entry(conn.clone()).or_default();
        queue.jobs.push_back(job);
        if !queue.active {
            queue.active = true;
            queues.ready.push_back(conn);
            self.shared.available.notify_one();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.queues.lock().shutdown = true;
        self.shared.available.notify_all();

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("worker thread terminated abnormally");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let (conn, job) = {
            let mut queues = shared.queues.lock();
            loop {
                if let Some(conn) = queues.ready.pop_front() {
                    let queue = queues
                        .map
                        .get_mut(&conn)
                        .expect("ready connection missing its queue!");
                    let job = queue
                        .jobs
                        .pop_front()
                        .expect("ready connection with empty queue!");
                    break (conn, job);
                }

                // Remaining jobs are drained before the threads exit.
                if queues.shutdown {
                    return;
                }

                shared.available.wait(&mut queues);
            }
        };

        run_job(job);

        {
            let mut queues = shared.queues.lock();
            let queue = queues
                .map
                .get_mut(&conn)
                .expect("active connection missing its queue!");
            if queue.jobs.is_empty() {
                queues.map.remove(&conn);
            } else {
                queues.ready.push_back(conn);
                shared.available.notify_one();
            }
        }

        let remaining = shared.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= shared.lowater {
            shared.drained.notify_waiters();
        }
    }
}

fn run_job(job: Job) {
    let conn = job.message.conn().clone();
    let command = job.message.command().to_string();
    let reply_tag = job.message.reply_tag().cloned();
    let proxy = job.message.proxy();

    let handler = job.handler;
    let message = job.message;
    if catch_unwind(AssertUnwindSafe(move || (handler)(message))).is_err() {
        log::error!(
            "command handler panicked: conn={}, command={}",
            conn,
            command
        );

        // A requesting peer would otherwise wait out its timeout; tell it the
        // handler faulted instead.
        if let Some(tag) = reply_tag {
            proxy.post(Directive {
                to: conn,
                frames: vec![
                    Bytes::from_static(Reason::HandlerFailure.as_bytes()),
                    Bytes::from_static(codec::REPLY),
                    tag,
                ],
            });
        }
    }
}
