//! Types shared between a queue's internal bookkeeping and the settle-result
//! handed back to callers of [`crate::Scheduler::enqueue`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use mx_core::{MxError, Result};

/// Implemented by whatever event type a [`crate::Scheduler`] is instantiated
/// over. Only what the default queue selector needs — callers supplying a
/// custom selector closure don't have to touch this at all.
pub trait SchedulerEvent: Clone + Send + Sync + 'static {
    fn event_type(&self) -> &str;
}

pub(crate) struct Ticket<E, R> {
    pub(crate) id: u64,
    pub(crate) event: E,
    pub(crate) attempts: u32,
    pub(crate) transaction_id: String,
    pub(crate) tx: Option<oneshot::Sender<Result<R>>>,
}

/// The settle-result returned by [`crate::Scheduler::enqueue`]. Resolves once
/// the event's dispatch succeeds, exhausts its retries, or is removed from
/// its queue.
pub struct QueuedResult<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> QueuedResult<R> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<R>>) -> Self {
        Self { rx }
    }
}

impl<R> Future for QueuedResult<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MxError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
