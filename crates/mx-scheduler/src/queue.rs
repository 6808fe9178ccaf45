//! Per-queue FIFO state machine: `Idle -> Dispatching -> (Sleeping | Idle)`.
//! Distinct queues run independently; only one queue-head is ever in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use mx_core::{MxError, Result};
use mx_timer::RealtimeTimer;

use crate::ticket::{QueuedResult, Ticket};

/// Binds the actor that turns one event into a server reply. Implementors
/// mint nothing — the scheduler supplies the transaction id, stable across
/// retries of the same event.
#[async_trait]
pub trait Processor<E, R>: Send + Sync {
    async fn dispatch(&self, event: &E, transaction_id: &str) -> Result<R>;
}

pub type QueueSelector<E> = Arc<dyn Fn(&E) -> Option<String> + Send + Sync>;
pub type RetryPolicy<E> = Arc<dyn Fn(&E, u32, &MxError) -> i64 + Send + Sync>;

struct Queue<E, R> {
    items: VecDeque<Ticket<E, R>>,
    dispatching: bool,
    current_sleep: Option<Arc<Notify>>,
}

impl<E, R> Default for Queue<E, R> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            dispatching: false,
            current_sleep: None,
        }
    }
}

struct Inner<E, R> {
    queues: HashMap<String, Queue<E, R>>,
    processor: Option<Arc<dyn Processor<E, R>>>,
}

/// Organizes user-initiated sends into named FIFO queues and applies a retry
/// policy per queue-head. Events whose selector returns `None` bypass
/// queuing entirely — the caller dispatches them directly.
pub struct Scheduler<E, R> {
    inner: Arc<Mutex<Inner<E, R>>>,
    selector: QueueSelector<E>,
    retry: RetryPolicy<E>,
    timer: RealtimeTimer,
    next_id: Arc<AtomicU64>,
}

impl<E, R> Clone for Scheduler<E, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            selector: self.selector.clone(),
            retry: self.retry.clone(),
            timer: self.timer.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E, R> Scheduler<E, R>
where
    E: Clone + PartialEq + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(selector: QueueSelector<E>, retry: RetryPolicy<E>, timer: RealtimeTimer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queues: HashMap::new(),
                processor: None,
            })),
            selector,
            retry,
            timer,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Binds the dispatch actor. Binding after events were already enqueued
    /// immediately starts processing every queue that is waiting.
    pub fn set_processor(&self, processor: Arc<dyn Processor<E, R>>) {
        let to_start: Vec<String> = {
            let mut inner = self.inner.lock().unwrap();
            inner.processor = Some(processor);
            inner
                .queues
                .iter_mut()
                .filter_map(|(name, q)| {
                    if !q.items.is_empty() && !q.dispatching {
                        q.dispatching = true;
                        Some(name.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        for name in to_start {
            self.spawn_dispatch_loop(name);
        }
    }

    /// Returns `None` if the selector routes `event` outside any queue — the
    /// caller is expected to dispatch it directly instead.
    pub fn enqueue(&self, event: E) -> Option<QueuedResult<R>> {
        let queue_name = (self.selector)(&event)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transaction_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let ticket = Ticket {
            id,
            event,
            attempts: 0,
            transaction_id,
            tx: Some(tx),
        };

        let should_start = {
            let mut inner = self.inner.lock().unwrap();
            let has_processor = inner.processor.is_some();
            let q = inner.queues.entry(queue_name.clone()).or_default();
            q.items.push_back(ticket);
            let should_start = has_processor && !q.dispatching;
            if should_start {
                q.dispatching = true;
            }
            should_start
        };
        if should_start {
            self.spawn_dispatch_loop(queue_name);
        }
        Some(QueuedResult::new(rx))
    }

    /// A shallow copy of the queue `event` would route to.
    pub fn queue_for(&self, event: &E) -> Vec<E> {
        let queue_name = match (self.selector)(event) {
            Some(name) => name,
            None => return Vec::new(),
        };
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .get(&queue_name)
            .map(|q| q.items.iter().map(|t| t.event.clone()).collect())
            .unwrap_or_default()
    }

    /// Removes `event` by identity from whichever queue holds it. If it was
    /// the head of a queue currently sleeping between retries, the retry
    /// timer is aborted so the next queue-head is picked up immediately.
    pub fn remove(&self, event: &E) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for queue in inner.queues.values_mut() {
            if let Some(pos) = queue.items.iter().position(|t| &t.event == event) {
                let was_head = pos == 0;
                let mut ticket = queue.items.remove(pos).unwrap();
                if let Some(tx) = ticket.tx.take() {
                    let _ = tx.send(Err(MxError::Cancelled));
                }
                if was_head {
                    if let Some(notify) = queue.current_sleep.take() {
                        notify.notify_waiters();
                    }
                }
                return true;
            }
        }
        false
    }

    fn spawn_dispatch_loop(&self, queue_name: String) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.dispatch_loop(queue_name).await;
        });
    }

    async fn dispatch_loop(&self, queue_name: String) {
        loop {
            let (processor, id, event, transaction_id, attempts) = {
                let mut inner = self.inner.lock().unwrap();
                let queue = match inner.queues.get_mut(&queue_name) {
                    Some(q) => q,
                    None => return,
                };
                match queue.items.front() {
                    Some(ticket) => (
                        inner.processor.clone().expect("dispatch loop only runs once a processor is bound"),
                        ticket.id,
                        ticket.event.clone(),
                        ticket.transaction_id.clone(),
                        ticket.attempts,
                    ),
                    None => {
                        queue.dispatching = false;
                        return;
                    }
                }
            };

            match processor.dispatch(&event, &transaction_id).await {
                Ok(reply) => {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(queue) = inner.queues.get_mut(&queue_name) {
                        // The head may have been removed (and possibly replaced by a
                        // different ticket) while `dispatch` was in flight — only settle
                        // it if it's still the same ticket this result belongs to.
                        if queue.items.front().map(|t| t.id) == Some(id) {
                            if let Some(mut ticket) = queue.items.pop_front() {
                                if let Some(tx) = ticket.tx.take() {
                                    let _ = tx.send(Ok(reply));
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    let wait_ms = (self.retry)(&event, attempts + 1, &err);
                    if wait_ms < 0 {
                        debug!(queue = %queue_name, attempts = attempts + 1, "giving up on queue head");
                        let mut inner = self.inner.lock().unwrap();
                        if let Some(queue) = inner.queues.get_mut(&queue_name) {
                            if queue.items.front().map(|t| t.id) == Some(id) {
                                if let Some(mut ticket) = queue.items.pop_front() {
                                    if let Some(tx) = ticket.tx.take() {
                                        let _ = tx.send(Err(MxError::GaveUp(Box::new(err))));
                                    }
                                }
                            }
                        }
                        continue;
                    }

                    let notify = Arc::new(Notify::new());
                    {
                        let mut inner = self.inner.lock().unwrap();
                        if let Some(queue) = inner.queues.get_mut(&queue_name) {
                            if let Some(ticket) = queue.items.front_mut() {
                                if ticket.id == id {
                                    ticket.attempts = attempts + 1;
                                }
                            }
                            queue.current_sleep = Some(notify.clone());
                        } else {
                            return;
                        }
                    }
                    sleep_or_cancelled(&self.timer, wait_ms, notify).await;
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(queue) = inner.queues.get_mut(&queue_name) {
                        queue.current_sleep = None;
                        if queue.items.is_empty() {
                            queue.dispatching = false;
                            return;
                        }
                    } else {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_or_cancelled(timer: &RealtimeTimer, wait_ms: i64, cancelled: Arc<Notify>) {
    let (tx, rx) = oneshot::channel::<()>();
    let key = timer.schedule(wait_ms, move || {
        let _ = tx.send(());
    });
    tokio::select! {
        _ = rx => {}
        _ = cancelled.notified() => {
            timer.cancel(key);
            warn!("retry sleep aborted by queue-head removal");
        }
    }
}
