//! Serialized execution context.
//!
//! An [`AsyncQueue`] is the sending half of a single-consumer channel whose
//! receiver is drained by exactly one tokio task. Everything that touches
//! client state is a message on that channel, so messages run one at a time
//! in enqueue order. Timers scheduled through the queue come back as
//! messages too (see [`crate::timer`]).
//!
//! Only [`AsyncQueue`] keeps the worker alive. Anything the worker itself
//! owns that sends back to the queue holds a [`WeakQueue`], so the worker's
//! receiver closes once the last outside handle is dropped.

use crate::error::{SyncError, SyncResult};
use crate::timer::{DelayedOperation, Scheduler, TimerFired, TimerId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_QUEUE: u64;
}

/// Sending half of a serialized execution context.
#[derive(Debug)]
pub struct AsyncQueue<M> {
    id: u64,
    sender: mpsc::UnboundedSender<M>,
}

impl<M> Clone for AsyncQueue<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
        }
    }
}

/// Non-owning sending half of a serialized execution context.
///
/// Sends fail with [`SyncError::ShutDown`] once every [`AsyncQueue`] for the
/// context has been dropped.
#[derive(Debug)]
pub struct WeakQueue<M> {
    id: u64,
    sender: mpsc::WeakUnboundedSender<M>,
}

impl<M> Clone for WeakQueue<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
        }
    }
}

/// Receiving half of a serialized execution context.
#[derive(Debug)]
pub struct QueueReceiver<M> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M: Send + 'static> AsyncQueue<M> {
    /// Creates a queue and the receiver its worker task drains.
    pub fn new() -> (Self, QueueReceiver<M>) {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { id, sender }, QueueReceiver { id, receiver })
    }

    /// Appends a message. Fails once the worker has stopped.
    pub fn enqueue(&self, message: M) -> SyncResult<()> {
        self.sender.send(message).map_err(|_| SyncError::ShutDown)
    }

    /// Returns true once the worker has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Returns a handle that sends to this queue without keeping it open.
    pub fn downgrade(&self) -> WeakQueue<M> {
        WeakQueue {
            id: self.id,
            sender: self.sender.downgrade(),
        }
    }

    /// Returns true when called from this queue's worker task.
    pub fn is_current_queue(&self) -> bool {
        is_current_queue(self.id)
    }

    /// Fails fatally unless called from this queue's worker task.
    pub fn verify_is_current_queue(&self) {
        verify_is_current_queue(self.id);
    }
}

impl<M> WeakQueue<M> {
    /// Appends a message. Fails once the worker has stopped or no
    /// [`AsyncQueue`] is left.
    pub fn enqueue(&self, message: M) -> SyncResult<()> {
        let sender = self.sender.upgrade().ok_or(SyncError::ShutDown)?;
        sender.send(message).map_err(|_| SyncError::ShutDown)
    }

    /// Returns true when called from this queue's worker task.
    pub fn is_current_queue(&self) -> bool {
        is_current_queue(self.id)
    }
}

impl<M> QueueReceiver<M> {
    /// Receives the next message, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Returns true when called from the worker task draining this receiver.
    pub fn is_current_queue(&self) -> bool {
        is_current_queue(self.id)
    }

    /// Fails fatally unless called from the worker task draining this receiver.
    pub fn verify_is_current_queue(&self) {
        verify_is_current_queue(self.id);
    }

    /// Spawns `worker` as the queue's task.
    ///
    /// Inside `worker`, [`is_current_queue`](Self::is_current_queue) holds.
    pub fn spawn<F, Fut>(self, worker: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(QueueReceiver<M>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.id;
        tokio::spawn(CURRENT_QUEUE.scope(id, worker(self)))
    }
}

fn is_current_queue(id: u64) -> bool {
    CURRENT_QUEUE.try_with(|current| *current == id).unwrap_or(false)
}

fn verify_is_current_queue(id: u64) {
    hard_assert!(
        is_current_queue(id),
        "operation must run on async queue {}",
        id
    );
}

impl<M> Scheduler for AsyncQueue<M>
where
    M: From<TimerFired> + Send + 'static,
{
    fn enqueue_after_delay(&self, timer_id: TimerId, delay: Duration) -> DelayedOperation {
        self.downgrade().enqueue_after_delay(timer_id, delay)
    }
}

impl<M> Scheduler for WeakQueue<M>
where
    M: From<TimerFired> + Send + 'static,
{
    fn enqueue_after_delay(&self, timer_id: TimerId, delay: Duration) -> DelayedOperation {
        let cancelled = Arc::new(AtomicBool::new(false));
        let fired = TimerFired::new(timer_id, Arc::clone(&cancelled));
        let queue = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The worker may already be gone at shutdown.
            let _ = queue.enqueue(M::from(fired));
        });
        DelayedOperation::new(timer_id, cancelled, Some(task.abort_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum Message {
        Work(u32),
        Timer(TimerFired),
    }

    impl From<TimerFired> for Message {
        fn from(fired: TimerFired) -> Self {
            Message::Timer(fired)
        }
    }

    #[tokio::test]
    async fn messages_run_in_enqueue_order_on_the_queue() {
        let (queue, receiver) = AsyncQueue::<Message>::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        for i in 0..5 {
            queue.enqueue(Message::Work(i)).unwrap();
        }
        assert!(!queue.is_current_queue());

        let worker_queue = queue.clone();
        receiver.spawn(move |mut receiver| async move {
            let mut seen = Vec::new();
            while seen.len() < 5 {
                if let Some(Message::Work(i)) = receiver.recv().await {
                    assert!(worker_queue.is_current_queue());
                    receiver.verify_is_current_queue();
                    seen.push(i);
                }
            }
            let _ = done_tx.send(seen);
        });

        assert_eq!(done_rx.await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    #[should_panic(expected = "INTERNAL ASSERTION FAILED")]
    async fn verify_fails_off_queue() {
        let (queue, _receiver) = AsyncQueue::<Message>::new();
        queue.verify_is_current_queue();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay() {
        let (queue, mut receiver) = AsyncQueue::<Message>::new();
        let start = tokio::time::Instant::now();
        let _op = queue.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_secs(60));

        match receiver.recv().await {
            Some(Message::Timer(fired)) => {
                assert_eq!(fired.timer_id(), TimerId::LruGarbageCollection);
                assert!(!fired.is_cancelled());
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_arrives() {
        let (queue, mut receiver) = AsyncQueue::<Message>::new();
        let op = queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(10));
        op.cancel();
        queue.enqueue(Message::Work(1)).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;

        let mut delivered = Vec::new();
        while let Ok(message) = receiver.receiver.try_recv() {
            delivered.push(message);
        }
        assert_eq!(delivered.len(), 1);
        assert!(matches!(delivered[0], Message::Work(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn weak_handles_do_not_keep_the_queue_open() {
        let (queue, mut receiver) = AsyncQueue::<Message>::new();
        let weak = queue.downgrade();
        weak.enqueue(Message::Work(7)).unwrap();
        let _op = weak.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_secs(60));
        drop(queue);

        assert!(matches!(receiver.recv().await, Some(Message::Work(7))));
        assert!(receiver.recv().await.is_none());
        assert_eq!(weak.enqueue(Message::Work(8)), Err(SyncError::ShutDown));
    }

    #[test]
    fn enqueue_after_worker_stops_fails() {
        let (queue, receiver) = AsyncQueue::<Message>::new();
        drop(receiver);
        assert!(queue.is_closed());
        assert_eq!(queue.enqueue(Message::Work(0)), Err(SyncError::ShutDown));
    }
}
