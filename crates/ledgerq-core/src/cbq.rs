//! Component F: an unbounded, lock-minimizing FIFO with waiter handoff.
//!
//! Two lock-free queues carry the state: `items` (freshly put values) and
//! `priority` (aborted values, which must be redelivered ahead of anything
//! fresher). A third, `waiters`, holds pending consumers as one-shot
//! channels. Producers and consumers never block each other directly;
//! instead, whichever thread flips `draining` from false to true becomes the
//! sole pairing worker for as long as there is pairable work, then hands
//! leadership back. Every other thread just pushes and returns.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct Waiter<T> {
    tx: oneshot::Sender<T>,
}

/// An unbounded, multi-producer multi-consumer blocking FIFO.
pub struct CbQueue<T> {
    items: SegQueue<T>,
    priority: SegQueue<T>,
    waiters: SegQueue<Waiter<T>>,
    draining: AtomicBool,
    size: AtomicUsize,
}

impl<T: Send + 'static> Default for CbQueue<T> {
    fn default() -> Self {
        CbQueue::new()
    }
}

impl<T: Send + 'static> CbQueue<T> {
    pub fn new() -> Self {
        CbQueue {
            items: SegQueue::new(),
            priority: SegQueue::new(),
            waiters: SegQueue::new(),
            draining: AtomicBool::new(false),
            size: AtomicUsize::new(0),
        }
    }

    /// Enqueues `item` behind anything already waiting. Never blocks, never
    /// fails.
    pub fn put(&self, item: T) {
        self.items.push(item);
        self.size.fetch_add(1, Ordering::Relaxed);
        self.kick();
    }

    /// Returns `item` to the front of the queue, ahead of freshly put items.
    /// Used when a journaled-queue reader aborts an open read.
    pub fn put_priority(&self, item: T) {
        self.priority.push(item);
        self.size.fetch_add(1, Ordering::Relaxed);
        self.kick();
    }

    /// Synchronous, non-suspending check for an immediately available item.
    pub fn poll(&self) -> Option<T> {
        let item = self.priority.pop().or_else(|| self.items.pop());
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Waits for the next item, or returns `None` once `deadline` passes.
    /// `None` deadline waits indefinitely. Dropping the returned future
    /// before it resolves is equivalent to a deadline expiring: the pending
    /// waiter is discarded the next time the drain loop reaches it, and its
    /// slot is released without consuming an item.
    pub async fn get(&self, deadline: Option<Instant>) -> Option<T> {
        // Always register a waiter rather than racing a direct pop against
        // already-queued waiters: fairness is "registration order", and a
        // fast-path pop here could let a late caller cut the line.
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter { tx });
        self.kick();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    res = rx => res.ok(),
                    _ = tokio::time::sleep_until(deadline) => None,
                }
            }
            None => rx.await.ok(),
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn to_debug(&self) -> String {
        format!(
            "CbQueue{{size={}, waiters_approx={}}}",
            self.size(),
            if self.waiters.is_empty() { 0 } else { 1 }
        )
    }

    /// The single-flight pairing gate. Only the thread that wins the
    /// false->true transition runs `pair_all`; everyone else has already
    /// pushed their item/waiter and returns immediately. Because only the
    /// draining thread ever pops from `items`/`priority`/`waiters`, a
    /// `is_empty()` check it performs cannot be invalidated by another
    /// thread's pop -- only by another thread's push, which is exactly the
    /// condition the re-check loop below exists to catch.
    fn kick(&self) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        loop {
            self.pair_all();
            self.draining.store(false, Ordering::Release);
            if self.has_pairable_work()
                && self
                    .draining
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                continue;
            }
            break;
        }
    }

    fn has_pairable_work(&self) -> bool {
        !self.waiters.is_empty() && (!self.priority.is_empty() || !self.items.is_empty())
    }

    fn pair_all(&self) {
        while !self.waiters.is_empty() {
            let Some(item) = self.priority.pop().or_else(|| self.items.pop()) else {
                break;
            };
            let Some(waiter) = self.waiters.pop() else {
                // No consumer after all; put the item back and stop.
                self.priority.push(item);
                break;
            };
            if let Err(item) = waiter.tx.send(item) {
                // Consumer dropped its future (cancellation/timeout raced
                // the handoff); the item is not lost, it goes back to the
                // front for the next waiter.
                self.priority.push(item);
                continue;
            }
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

pub type SharedCbQueue<T> = Arc<CbQueue<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let queue: CbQueue<u32> = CbQueue::new();
        queue.put(7);
        assert_eq!(queue.get(None).await, Some(7));
    }

    #[tokio::test]
    async fn get_waits_for_put() {
        let queue = Arc::new(CbQueue::<u32>::new());
        let q2 = queue.clone();
        let handle = tokio::spawn(async move { q2.get(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(9);
        assert_eq!(handle.await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn get_times_out_when_empty() {
        let queue: CbQueue<u32> = CbQueue::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(queue.get(Some(deadline)).await, None);
    }

    #[tokio::test]
    async fn priority_items_are_served_before_plain_items() {
        let queue: CbQueue<u32> = CbQueue::new();
        queue.put(1);
        queue.put(2);
        queue.put_priority(99);
        assert_eq!(queue.get(None).await, Some(99));
        assert_eq!(queue.get(None).await, Some(1));
        assert_eq!(queue.get(None).await, Some(2));
    }

    #[tokio::test]
    async fn poll_is_non_blocking() {
        let queue: CbQueue<u32> = CbQueue::new();
        assert_eq!(queue.poll(), None);
        queue.put(5);
        assert_eq!(queue.poll(), Some(5));
        assert_eq!(queue.poll(), None);
    }

    #[tokio::test]
    async fn size_tracks_unconsumed_items() {
        let queue: CbQueue<u32> = CbQueue::new();
        queue.put(1);
        queue.put(2);
        assert_eq!(queue.size(), 2);
        queue.get(None).await;
        assert_eq!(queue.size(), 1);
    }
}
