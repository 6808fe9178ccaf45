//! A cancellable handle over an in-flight request.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use mx_core::{MxError, Result};

#[derive(Debug, Clone, Copy)]
pub(crate) enum CancelReason {
    User,
    LocalTimeout(Duration),
}

impl CancelReason {
    fn into_error(self) -> MxError {
        match self {
            CancelReason::User => MxError::Cancelled,
            CancelReason::LocalTimeout(d) => MxError::LocalTimeout(d),
        }
    }
}

/// Shared between a [`PendingResult`] and the task executing its request.
#[derive(Default)]
pub(crate) struct CancelHandle {
    notify: Notify,
    reason: Mutex<Option<CancelReason>>,
}

impl CancelHandle {
    pub(crate) fn trigger(&self, reason: CancelReason) {
        let mut slot = self.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.notify.notify_waiters();
    }

    pub(crate) async fn cancelled(&self) -> MxError {
        self.notify.notified().await;
        self.reason
            .lock()
            .unwrap()
            .unwrap_or(CancelReason::User)
            .into_error()
    }
}

/// A request or upload in flight. Awaiting it resolves to the final result;
/// [`PendingResult::cancel`] is idempotent and always safe — a cancelled
/// request eventually settles with [`MxError::Cancelled`] (or
/// [`MxError::LocalTimeout`] if a local deadline fired first).
pub struct PendingResult<T> {
    rx: oneshot::Receiver<Result<T>>,
    cancel: Arc<CancelHandle>,
}

impl<T> PendingResult<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T>>, cancel: Arc<CancelHandle>) -> Self {
        Self { rx, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.trigger(CancelReason::User);
    }
}

impl<T> Future for PendingResult<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MxError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
