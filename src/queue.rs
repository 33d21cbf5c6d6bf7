//! Bounded FIFO handoff between the capture side and the network side.
//!
//! [`BoundedAsyncQueue`] is the only buffer between a producer that can
//! outrun the network and the sender that drains it. Backpressure is
//! expressed by suspending `put` on a full queue, never by dropping.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::QueueClosed;

/// A capacity-bounded, order-preserving async queue.
///
/// - `put` appends, or suspends while the queue is full. Suspended producers
///   are resumed strictly in arrival order.
/// - `get` removes the head, or suspends while the queue is empty. If a
///   consumer is already waiting, `put` hands the item to it directly.
/// - [`close`](Self::close) rejects every pending and future call with
///   [`QueueClosed`].
///
/// Handles are cheap to clone; every clone refers to the same queue, so any
/// number of producers and consumers can share it.
///
/// # Cancellation
///
/// Dropping a suspended `put` withdraws its item unless a consumer already
/// made room for it, in which case the item stays queued. Dropping a
/// suspended `get` that was already handed an item puts that item back at
/// the head, so nothing is lost.
///
/// # Example
///
/// ```
/// use audio_uplink::BoundedAsyncQueue;
///
/// # tokio_test_block_on(async {
/// let queue = BoundedAsyncQueue::bounded(2);
/// queue.put(1).await.unwrap();
/// queue.put(2).await.unwrap();
/// assert!(queue.is_full());
/// assert_eq!(queue.get().await.unwrap(), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct BoundedAsyncQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    capacity: Option<usize>,
    state: Mutex<State<T>>,
    /// Signalled whenever the queue becomes empty or is closed.
    emptied: Notify,
}

struct State<T> {
    items: VecDeque<T>,
    /// Producers suspended on a full queue, holding the item they offer.
    /// Non-empty only while `items` is at capacity.
    producers: VecDeque<ParkedPut<T>>,
    /// Consumers suspended on an empty queue. Non-empty only while `items` is empty.
    consumers: VecDeque<oneshot::Sender<T>>,
    closed: bool,
}

struct ParkedPut<T> {
    item: T,
    admitted: oneshot::Sender<()>,
}

impl<T> Clone for BoundedAsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for BoundedAsyncQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> std::fmt::Debug for BoundedAsyncQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BoundedAsyncQueue")
            .field("capacity", &self.inner.capacity)
            .field("len", &state.items.len())
            .field("waiting_producers", &state.producers.len())
            .field("waiting_consumers", &state.consumers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> BoundedAsyncQueue<T> {
    /// Creates a queue; `None` means unbounded.
    ///
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.map(|c| c.max(1)),
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    producers: VecDeque::new(),
                    consumers: VecDeque::new(),
                    closed: false,
                }),
                emptied: Notify::new(),
            }),
        }
    }

    /// Creates a queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity))
    }

    /// Creates a queue whose `put` never suspends.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Maximum number of buffered items, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Returns `true` if no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().items.is_empty()
    }

    /// Returns `true` if a `put` would suspend.
    pub fn is_full(&self) -> bool {
        let state = self.inner.state.lock();
        self.inner.is_full(&state)
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of producers currently suspended in `put`.
    pub fn waiting_producers(&self) -> usize {
        self.inner.state.lock().producers.len()
    }

    /// Number of consumers currently suspended in `get`.
    pub fn waiting_consumers(&self) -> usize {
        self.inner.state.lock().consumers.len()
    }

    /// Enqueues an item, suspending while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if the queue is closed before the item is admitted.
    pub async fn put(&self, item: T) -> Result<(), QueueClosed> {
        let admitted = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            let Some(item) = state.hand_to_consumer(item) else {
                return Ok(());
            };
            if state.producers.is_empty() && !self.inner.is_full(&state) {
                state.items.push_back(item);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.producers.push_back(ParkedPut { item, admitted: tx });
            rx
        };

        admitted.await.map_err(|_| QueueClosed)
    }

    /// Removes the head item, suspending while the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if the queue is closed before an item arrives.
    pub async fn get(&self) -> Result<T, QueueClosed> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            if let Some(item) = state.items.pop_front() {
                self.inner.after_removal(&mut state);
                return Ok(item);
            }
            let (tx, rx) = oneshot::channel();
            state.consumers.push_back(tx);
            rx
        };

        let mut pending = PendingGet {
            rx: Some(rx),
            inner: &self.inner,
        };
        pending.recv().await
    }

    /// Resolves once every buffered and suspended item has been taken, or
    /// the queue is closed.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock();
                if state.closed || (state.items.is_empty() && state.producers.is_empty()) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Shuts the queue down.
    ///
    /// Every suspended `put` and `get` resolves with [`QueueClosed`], as does
    /// every later call. Returns the items that were buffered or offered by
    /// suspended producers, oldest first. Closing twice returns an empty vec.
    pub fn close(&self) -> Vec<T> {
        let (discarded, consumers) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Vec::new();
            }
            state.closed = true;
            let mut discarded: Vec<T> = state.items.drain(..).collect();
            // Dropping `admitted` wakes each parked producer with an error.
            discarded.extend(state.producers.drain(..).map(|parked| parked.item));
            (discarded, std::mem::take(&mut state.consumers))
        };
        drop(consumers);
        self.inner.emptied.notify_waiters();
        discarded
    }
}

impl<T> Inner<T> {
    fn is_full(&self, state: &State<T>) -> bool {
        self.capacity
            .is_some_and(|capacity| state.items.len() >= capacity)
    }

    /// Admits the oldest live parked producer into the freed slot.
    fn after_removal(&self, state: &mut State<T>) {
        while !self.is_full(state) {
            let Some(parked) = state.producers.pop_front() else {
                break;
            };
            if parked.admitted.is_closed() {
                // The put was cancelled; its item goes with it.
                continue;
            }
            state.items.push_back(parked.item);
            let _ = parked.admitted.send(());
        }
        if state.items.is_empty() && state.producers.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    /// Returns an item taken by a cancelled `get` to the head of the queue.
    ///
    /// This can leave the queue one over capacity until the next `get`.
    fn restore(&self, item: T) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(item) = state.hand_to_consumer(item) {
            state.items.push_front(item);
        }
    }
}

impl<T> State<T> {
    /// Gives the item to the oldest live waiting consumer, or hands it back.
    fn hand_to_consumer(&mut self, mut item: T) -> Option<T> {
        while let Some(consumer) = self.consumers.pop_front() {
            match consumer.send(item) {
                Ok(()) => return None,
                Err(returned) => item = returned,
            }
        }
        Some(item)
    }
}

/// A suspended `get`; restores a delivered item if dropped before completion.
struct PendingGet<'a, T> {
    rx: Option<oneshot::Receiver<T>>,
    inner: &'a Inner<T>,
}

impl<T> PendingGet<'_, T> {
    async fn recv(&mut self) -> Result<T, QueueClosed> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(QueueClosed);
        };
        let result = rx.await.map_err(|_| QueueClosed);
        self.rx = None;
        result
    }
}

impl<T> Drop for PendingGet<'_, T> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(item) = rx.try_recv() {
                self.inner.restore(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_fifo_order_with_interleaving() {
        let queue = BoundedAsyncQueue::bounded(3);
        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), 1);
        queue.put(3).await.unwrap();
        queue.put(4).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), 2);
        assert_eq!(queue.get().await.unwrap(), 3);
        assert_eq!(queue.get().await.unwrap(), 4);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_put_suspends_when_full() {
        let queue = BoundedAsyncQueue::bounded(2);
        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(20), queue.put(3)).await;
        assert!(blocked.is_err(), "third put should suspend");
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_get_resumes_exactly_one_producer() {
        let queue = BoundedAsyncQueue::bounded(1);
        queue.put(0).await.unwrap();

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.put(1).await }
        });
        until(|| queue.waiting_producers() == 1).await;
        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.put(2).await }
        });
        until(|| queue.waiting_producers() == 2).await;

        assert_eq!(queue.get().await.unwrap(), 0);
        first.await.unwrap().unwrap();
        assert_eq!(queue.waiting_producers(), 1);
        assert!(!second.is_finished());

        assert_eq!(queue.get().await.unwrap(), 1);
        second.await.unwrap().unwrap();
        assert_eq!(queue.get().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_waiting_consumer_receives_directly() {
        let queue = BoundedAsyncQueue::<u32>::bounded(1);
        let consumer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        until(|| queue.waiting_consumers() == 1).await;

        queue.put(42).await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(consumer.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_consumers_served_in_arrival_order() {
        let queue = BoundedAsyncQueue::<u32>::unbounded();
        let mut consumers = Vec::new();
        for n in 0..3 {
            let queue_clone = queue.clone();
            consumers.push(tokio::spawn(async move { queue_clone.get().await }));
            until(|| queue.waiting_consumers() == n + 1).await;
        }

        for item in [10, 20, 30] {
            queue.put(item).await.unwrap();
        }

        let mut received = Vec::new();
        for consumer in consumers {
            received.push(consumer.await.unwrap().unwrap());
        }
        assert_eq!(received, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_unbounded_never_suspends() {
        let queue = BoundedAsyncQueue::unbounded();
        for i in 0..10_000 {
            queue.put(i).await.unwrap();
        }
        assert_eq!(queue.len(), 10_000);
        assert!(!queue.is_full());
        assert_eq!(queue.capacity(), None);
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let queue = BoundedAsyncQueue::bounded(1);
        queue.put(1).await.unwrap();
        let producer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.put(2).await }
        });
        until(|| queue.waiting_producers() == 1).await;

        let discarded = queue.close();
        assert_eq!(discarded, vec![1, 2]);
        assert_eq!(producer.await.unwrap(), Err(QueueClosed));

        assert_eq!(queue.put(3).await, Err(QueueClosed));
        assert_eq!(queue.get().await, Err(QueueClosed));
        assert!(queue.close().is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_consumers() {
        let queue = BoundedAsyncQueue::<u8>::bounded(4);
        let consumer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        until(|| queue.waiting_consumers() == 1).await;

        assert!(queue.close().is_empty());
        assert_eq!(consumer.await.unwrap(), Err(QueueClosed));
    }

    #[tokio::test]
    async fn test_cancelled_get_does_not_swallow_items() {
        let queue = BoundedAsyncQueue::bounded(2);
        let cancelled = tokio::time::timeout(Duration::from_millis(5), queue.get()).await;
        assert!(cancelled.is_err());

        queue.put(7).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_put_is_withdrawn() {
        let queue = BoundedAsyncQueue::bounded(1);
        queue.put(1).await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(5), queue.put(2)).await;
        assert!(cancelled.is_err());

        assert_eq!(queue.get().await.unwrap(), 1);
        assert!(queue.is_empty());
        queue.put(3).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_drained_waits_for_consumer() {
        let queue = BoundedAsyncQueue::bounded(4);
        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drained().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        queue.get().await.unwrap();
        queue.get().await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_drained_returns_on_close() {
        let queue = BoundedAsyncQueue::bounded(4);
        queue.put(1).await.unwrap();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drained().await }
        });
        tokio::task::yield_now().await;
        queue.close();
        waiter.await.unwrap();
    }

    #[test]
    fn test_zero_capacity_treated_as_one() {
        let queue = BoundedAsyncQueue::<u8>::bounded(0);
        assert_eq!(queue.capacity(), Some(1));
    }
}
