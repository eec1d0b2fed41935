use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::arbiter::protocol::{CurrentJob, JobRequest, StatusAnswer, WaitingJob};

/// Outcome of an acquire request, delivered on the task's ready channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Granted { task_id: u64 },
    Rejected,
}

/// Messages consumed by the scheduler task. Sessions never touch scheduler
/// state directly; everything goes through this inbox.
#[derive(Debug)]
pub(crate) enum SchedMsg {
    ClientConnected,
    ClientDisconnected,
    Register {
        request: JobRequest,
        ready: oneshot::Sender<Admission>,
    },
    Done {
        task_id: u64,
    },
    Status {
        reply: oneshot::Sender<StatusAnswer>,
    },
    StopAccepting,
}

/// A task waiting for admission.
#[derive(Debug)]
struct QueuedTask {
    id: u64,
    /// Effective core demand, already clamped to `max_cores`.
    need: u32,
    request: JobRequest,
    ready: oneshot::Sender<Admission>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    /// Admission order: priority descending, then effective cores
    /// ascending, then registration order. `BinaryHeap` pops the greatest
    /// element, so "greater" means "admitted earlier".
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.need.cmp(&self.need))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A task that has been admitted and holds cores.
#[derive(Debug, Clone)]
struct RunningJob {
    id: u64,
    need: u32,
    request: JobRequest,
    start_time: DateTime<Utc>,
}

/// The single task that owns all arbiter state.
pub(crate) struct Scheduler {
    max_cores: u32,
    idle_grace: Duration,
    accepting: bool,
    num_clients: usize,
    next_id: u64,
    running: Vec<RunningJob>,
    waiting: BinaryHeap<QueuedTask>,
    inbox: mpsc::Receiver<SchedMsg>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(
        max_cores: u32,
        idle_grace: Duration,
        inbox: mpsc::Receiver<SchedMsg>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            max_cores,
            idle_grace,
            accepting: true,
            num_clients: 0,
            next_id: 0,
            running: Vec::new(),
            waiting: BinaryHeap::new(),
            inbox,
            shutdown,
        }
    }

    /// Run until idle or externally cancelled. Cancels the shutdown token
    /// on exit so the listener stops accepting.
    pub(crate) async fn run(mut self) {
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                recv = tokio::time::timeout(self.idle_grace, self.inbox.recv()) => match recv {
                    Ok(Some(msg)) => Some(msg),
                    Ok(None) => break,
                    // Inbox silent for the whole grace period.
                    Err(_) => None,
                },
            };

            if let Some(msg) = msg {
                self.handle(msg);
            }
            self.admit();

            if self.is_idle() {
                tracing::info!("No clients and no jobs, shutting down");
                break;
            }
        }
        self.shutdown.cancel();
    }

    fn handle(&mut self, msg: SchedMsg) {
        match msg {
            SchedMsg::ClientConnected => {
                self.num_clients += 1;
            }
            SchedMsg::ClientDisconnected => {
                self.num_clients = self.num_clients.saturating_sub(1);
            }
            SchedMsg::Register { request, ready } => {
                if !self.accepting {
                    tracing::info!(pid = request.pid, "Acquire rejected, not accepting");
                    let _ = ready.send(Admission::Rejected);
                    return;
                }
                let id = self.next_id;
                self.next_id += 1;
                let need = self.cores_of(&request);
                tracing::info!(
                    task_id = id,
                    cores = need,
                    priority = request.priority,
                    pid = request.pid,
                    "Task registered"
                );
                self.waiting.push(QueuedTask {
                    id,
                    need,
                    request,
                    ready,
                });
            }
            SchedMsg::Done { task_id } => {
                match self.running.iter().position(|j| j.id == task_id) {
                    Some(idx) => {
                        let job = self.running.remove(idx);
                        tracing::info!(task_id, cores = job.need, "Task released");
                    }
                    None => {
                        tracing::warn!(task_id, "Release for unknown task, ignoring");
                    }
                }
            }
            SchedMsg::Status { reply } => {
                let _ = reply.send(self.status_answer());
            }
            SchedMsg::StopAccepting => {
                tracing::info!("No longer accepting new acquire requests");
                self.accepting = false;
            }
        }
    }

    /// Admit waiters in priority order while capacity allows.
    fn admit(&mut self) {
        self.purge_waiting();
        while let Some(top) = self.waiting.peek() {
            let free = self.max_cores - self.used_cores();
            if top.need > free {
                break;
            }
            let Some(task) = self.waiting.pop() else {
                break;
            };
            if task
                .ready
                .send(Admission::Granted { task_id: task.id })
                .is_err()
            {
                tracing::warn!(task_id = task.id, "Waiter vanished before admission");
                continue;
            }
            tracing::info!(task_id = task.id, cores = task.need, "Task admitted");
            self.running.push(RunningJob {
                id: task.id,
                need: task.need,
                request: task.request,
                start_time: Utc::now(),
            });
        }
    }

    /// Drop waiters whose session has gone away. A dead waiter must not
    /// keep the daemon alive or shadow admissible tasks behind it.
    fn purge_waiting(&mut self) {
        if self.waiting.iter().any(|t| t.ready.is_closed()) {
            let live: Vec<QueuedTask> = std::mem::take(&mut self.waiting)
                .into_iter()
                .filter(|t| {
                    if t.ready.is_closed() {
                        tracing::warn!(task_id = t.id, "Dropping abandoned waiter");
                        false
                    } else {
                        true
                    }
                })
                .collect();
            self.waiting = live.into_iter().collect();
        }
    }

    fn used_cores(&self) -> u32 {
        self.running.iter().map(|j| j.need).sum()
    }

    /// Exclusive requests take the whole host; oversized requests are
    /// clamped so they stay admissible.
    fn cores_of(&self, request: &JobRequest) -> u32 {
        if request.cores <= 0 {
            self.max_cores
        } else {
            (request.cores as u32).min(self.max_cores)
        }
    }

    fn status_answer(&self) -> StatusAnswer {
        let running = self
            .running
            .iter()
            .map(|j| CurrentJob {
                id: j.id,
                job: j.request.clone(),
                start_time: j.start_time.timestamp_micros() as f64 / 1e6,
            })
            .collect();

        let mut waiting: Vec<(i32, u32, u64, WaitingJob)> = self
            .waiting
            .iter()
            .filter(|t| !t.ready.is_closed())
            .map(|t| {
                (
                    t.request.priority,
                    t.need,
                    t.id,
                    WaitingJob {
                        id: t.id,
                        job: t.request.clone(),
                    },
                )
            })
            .collect();
        waiting.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        StatusAnswer {
            max_cores: self.max_cores,
            running,
            waiting: waiting.into_iter().map(|(_, _, _, w)| w).collect(),
        }
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty()
            && self.waiting.iter().all(|t| t.ready.is_closed())
            && self.num_clients == 0
    }
}
