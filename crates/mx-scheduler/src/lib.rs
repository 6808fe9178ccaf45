//! Named FIFO queues with per-attempt retry policy and idempotent
//! transaction ids — everything upstream of the actual HTTP dispatch.

mod policy;
mod queue;
mod ticket;

pub use policy::{queue_messages, retry_backoff_ratelimit};
pub use queue::{Processor, QueueSelector, RetryPolicy, Scheduler};
pub use ticket::{QueuedResult, SchedulerEvent};

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use mx_core::MxError;
    use mx_timer::RealtimeTimer;

    use super::*;

    #[derive(Clone, PartialEq, Debug)]
    struct Msg {
        id: u32,
        kind: &'static str,
    }

    impl SchedulerEvent for Msg {
        fn event_type(&self) -> &str {
            self.kind
        }
    }

    struct RecordingProcessor {
        calls: Arc<std::sync::Mutex<Vec<(u32, String)>>>,
        fail_first_n: AtomicU32,
    }

    #[async_trait]
    impl Processor<Msg, String> for RecordingProcessor {
        async fn dispatch(&self, event: &Msg, transaction_id: &str) -> mx_core::Result<String> {
            self.calls.lock().unwrap().push((event.id, transaction_id.to_string()));
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                return Err(MxError::RateLimited { retry_after_ms: 5 });
            }
            Ok(format!("ok-{}", event.id))
        }
    }

    fn scheduler() -> Scheduler<Msg, String> {
        Scheduler::new(Arc::new(queue_messages), Arc::new(retry_backoff_ratelimit), RealtimeTimer::new())
    }

    #[tokio::test]
    async fn non_message_events_bypass_the_queue() {
        let s = scheduler();
        assert!(s.enqueue(Msg { id: 1, kind: "m.reaction" }).is_none());
    }

    #[tokio::test]
    async fn events_settle_in_enqueue_order() {
        let s = scheduler();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        s.set_processor(Arc::new(RecordingProcessor {
            calls: calls.clone(),
            fail_first_n: AtomicU32::new(0),
        }));

        let r1 = s.enqueue(Msg { id: 1, kind: "m.room.message" }).unwrap();
        let r2 = s.enqueue(Msg { id: 2, kind: "m.room.message" }).unwrap();
        let r3 = s.enqueue(Msg { id: 3, kind: "m.room.message" }).unwrap();

        assert_eq!(r1.await.unwrap(), "ok-1");
        assert_eq!(r2.await.unwrap(), "ok-2");
        assert_eq!(r3.await.unwrap(), "ok-3");
        assert_eq!(calls.lock().unwrap().iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn retry_reuses_the_same_transaction_id() {
        let s = scheduler();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        s.set_processor(Arc::new(RecordingProcessor {
            calls: calls.clone(),
            fail_first_n: AtomicU32::new(1),
        }));

        let r = s.enqueue(Msg { id: 1, kind: "m.room.message" }).unwrap();
        assert_eq!(r.await.unwrap(), "ok-1");

        let seen = calls.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, seen[1].1);
    }

    #[tokio::test]
    async fn setting_processor_after_enqueue_still_drains_the_queue() {
        let s = scheduler();
        let r1 = s.enqueue(Msg { id: 1, kind: "m.room.message" }).unwrap();
        let r2 = s.enqueue(Msg { id: 2, kind: "m.room.message" }).unwrap();

        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        s.set_processor(Arc::new(RecordingProcessor {
            calls: calls.clone(),
            fail_first_n: AtomicU32::new(0),
        }));
        // a second bind with nothing new queued must not double-dispatch
        s.set_processor(Arc::new(RecordingProcessor {
            calls: calls.clone(),
            fail_first_n: AtomicU32::new(0),
        }));

        assert_eq!(r1.await.unwrap(), "ok-1");
        assert_eq!(r2.await.unwrap(), "ok-2");
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn immediate_removal_yields_no_dispatch_and_a_rejection() {
        let s = scheduler();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        s.set_processor(Arc::new(RecordingProcessor {
            calls: calls.clone(),
            fail_first_n: AtomicU32::new(0),
        }));

        let event = Msg { id: 1, kind: "m.room.message" };
        let r = s.enqueue(event.clone()).unwrap();
        assert!(s.remove(&event));
        let err = r.await.unwrap_err();
        assert!(matches!(err, MxError::Cancelled));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(calls.lock().unwrap().is_empty());
    }

    struct GateProcessor {
        calls: Arc<std::sync::Mutex<Vec<u32>>>,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Processor<Msg, String> for GateProcessor {
        async fn dispatch(&self, event: &Msg, _transaction_id: &str) -> mx_core::Result<String> {
            self.calls.lock().unwrap().push(event.id);
            if event.id == 1 {
                self.gate.notified().await;
            }
            Ok(format!("ok-{}", event.id))
        }
    }

    #[tokio::test]
    async fn removal_during_in_flight_dispatch_does_not_settle_a_stranger_ticket() {
        let s = scheduler();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());
        s.set_processor(Arc::new(GateProcessor { calls: calls.clone(), gate: gate.clone() }));

        let ev1 = Msg { id: 1, kind: "m.room.message" };
        let r1 = s.enqueue(ev1.clone()).unwrap();
        // give the dispatch loop a chance to pick up ev1 and block inside dispatch()
        tokio::time::sleep(Duration::from_millis(20)).await;

        let r2 = s.enqueue(Msg { id: 2, kind: "m.room.message" }).unwrap();

        // remove ev1 while its dispatch is still in flight
        assert!(s.remove(&ev1));
        let err1 = r1.await.unwrap_err();
        assert!(matches!(err1, MxError::Cancelled));

        // let the blocked ev1 dispatch finally resolve — it must not settle ev2
        gate.notify_waiters();

        assert_eq!(r2.await.unwrap(), "ok-2");
        assert_eq!(calls.lock().unwrap().clone(), vec![1, 2]);
    }

    struct AlwaysFailProcessor;

    #[async_trait]
    impl Processor<Msg, String> for AlwaysFailProcessor {
        async fn dispatch(&self, _event: &Msg, _transaction_id: &str) -> mx_core::Result<String> {
            Err(MxError::HttpStatus { status: 500, body: "down".to_string() })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts() {
        let s = scheduler();
        s.set_processor(Arc::new(AlwaysFailProcessor));
        let r = s.enqueue(Msg { id: 9, kind: "m.room.message" }).unwrap();
        let err = r.await.unwrap_err();
        assert!(matches!(err, MxError::GaveUp(_)));
    }
}
