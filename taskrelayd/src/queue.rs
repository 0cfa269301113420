//! Single-worker FIFO queue.
//!
//! Requests are executed strictly one at a time in arrival order. Each request's reply target
//! is told `queued` when something is already running ahead of it, `processing` when it starts,
//! and finally receives exactly one terminal message.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use taskrelay_common::{ActionKinds, Message, RelayConfig, Severity, TaskOutcome};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::executor::{TaskExecutor, TaskRequest};

/// Write side of one client connection. Sending to a closed connection is a no-op.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    connection: u64,
    tx: mpsc::UnboundedSender<Message>,
}

impl ReplyHandle {
    pub fn new(connection: u64, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { connection, tx }
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// Returns false when the connection is already gone.
    pub fn send(&self, msg: Message) -> bool {
        match self.tx.send(msg) {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    connection = self.connection,
                    kind = %err.0.kind,
                    "Reply target closed; dropping message"
                );
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct QueueItem {
    pub message: Message,
    pub reply: ReplyHandle,
    enqueued_at: Instant,
}

impl QueueItem {
    pub fn new(message: Message, reply: ReplyHandle) -> Self {
        Self {
            message,
            reply,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub kinds: ActionKinds,
    /// Pause after each item before the next one is pulled.
    pub item_delay: Duration,
    /// Upper bound on a single execution.
    pub execution_timeout: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            kinds: config.kinds.clone(),
            item_delay: config.item_delay(),
            execution_timeout: config.execution_timeout(),
        }
    }
}

struct Waiting {
    item: QueueItem,
    // Whether this item was told `queued`, so it still owes a `processing` notice.
    told_queued: bool,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Waiting>,
    worker_active: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    executor: Arc<dyn TaskExecutor>,
    settings: QueueSettings,
}

/// Cloneable handle to the process-wide queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(executor: Arc<dyn TaskExecutor>, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                executor,
                settings,
            }),
        }
    }

    /// Appends an item and starts the worker if it is idle. Never blocks.
    ///
    /// The stage notice is decided and sent under the queue lock: `queued` when a worker is
    /// active, which covers both an executing item and any item still waiting ahead of this
    /// one; otherwise `processing`.
    pub fn enqueue(&self, item: QueueItem) {
        let kinds = &self.inner.settings.kinds;
        let start_worker = {
            let mut state = self.lock_state();
            let busy = state.worker_active;

            if let Some(request_id) = item.message.request_id() {
                let stage = if busy { &kinds.queued } else { &kinds.processing };
                if !item.reply.send(Message::stage(stage, request_id)) {
                    warn!(request_id, "Could not deliver {} notice", stage);
                }
            }

            debug!(
                request_id = ?item.message.request_id(),
                connection = item.reply.connection(),
                queue_len = state.items.len() + 1,
                busy,
                "Request enqueued"
            );
            state.items.push_back(Waiting {
                item,
                told_queued: busy,
            });

            if busy {
                false
            } else {
                state.worker_active = true;
                true
            }
        };

        if start_worker {
            let queue = self.clone();
            tokio::spawn(async move { queue.run_worker().await });
        }
    }

    /// Items waiting behind the one currently executing.
    pub fn len(&self) -> usize {
        self.lock_state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_busy(&self) -> bool {
        self.lock_state().worker_active
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_worker(self) {
        debug!("Queue worker started");
        loop {
            let next = {
                let mut state = self.lock_state();
                match state.items.pop_front() {
                    Some(waiting) => Some((waiting, state.items.len())),
                    None => {
                        state.worker_active = false;
                        None
                    }
                }
            };

            let Some((waiting, remaining)) = next else {
                debug!("Queue drained; worker idle");
                return;
            };

            self.process(waiting, remaining).await;
            time::sleep(self.inner.settings.item_delay).await;
        }
    }

    async fn process(&self, waiting: Waiting, remaining: usize) {
        let Waiting { item, told_queued } = waiting;
        let kinds = &self.inner.settings.kinds;
        let request_id = item.message.request_id().map(str::to_owned);

        if told_queued {
            if let Some(id) = request_id.as_deref() {
                if !item.reply.send(Message::stage(&kinds.processing, id)) {
                    warn!(request_id = id, "Could not deliver processing notice");
                }
            }
        }

        info!(
            request_id = ?request_id,
            kind = %item.message.kind,
            remaining,
            waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
            "Processing request"
        );

        let request = TaskRequest::from_message(&item.message, item.enqueued_at);
        let outcome = self.execute(request).await;
        let success = outcome.success;

        let terminal = outcome.into_message(&kinds.response, request_id.as_deref());
        if !item.reply.send(terminal) {
            warn!(request_id = ?request_id, "Client gone before terminal response");
        }

        info!(request_id = ?request_id, success, "Completed request");
    }

    /// Runs the executor in its own task so a panic or overrun is contained.
    async fn execute(&self, request: TaskRequest) -> TaskOutcome {
        let executor = Arc::clone(&self.inner.executor);
        let limit = self.inner.settings.execution_timeout;
        let mut handle = tokio::spawn(async move { executor.execute(&request).await });

        match time::timeout(limit, &mut handle).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => {
                error!("Error processing request: {:#}", err);
                TaskOutcome::failure(Severity::Error, format!("{err:#}"))
            }
            Ok(Err(join_err)) => {
                error!("Executor task aborted: {}", join_err);
                TaskOutcome::failure(
                    Severity::Error,
                    format!("executor task aborted: {join_err}"),
                )
            }
            Err(_) => {
                handle.abort();
                warn!(timeout_ms = limit.as_millis() as u64, "Executor timed out");
                TaskOutcome::failure(
                    Severity::Error,
                    format!("execution timed out after {}ms", limit.as_millis()),
                )
            }
        }
    }
}
