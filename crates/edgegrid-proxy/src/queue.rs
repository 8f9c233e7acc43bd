//! FIFO of requests waiting for a dispatch worker.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO with an async wait for the next item.
pub struct RequestQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an item. A closed queue hands the item back.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.closed {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest item, if any.
    pub fn dequeue(&self) -> Option<T> {
        self.inner.lock().expect("queue lock").items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the oldest item. `None` once closed and drained.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock");
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse new items and wake every waiter. Queued items remain.
    pub fn close(&self) {
        self.inner.lock().expect("queue lock").closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn dequeue_is_fifo() {
        let q = RequestQueue::new();
        for i in 0..5 {
            q.enqueue(i).unwrap();
        }
        let out: Vec<_> = std::iter::from_fn(|| q.dequeue()).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_dequeue_is_none() {
        let q: RequestQueue<u8> = RequestQueue::new();
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn length_tracks_enqueues_minus_dequeues() {
        let q = RequestQueue::new();
        for i in 0..7 {
            q.enqueue(i).unwrap();
        }
        for _ in 0..3 {
            q.dequeue();
        }
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn closed_queue_returns_item() {
        let q = RequestQueue::new();
        q.close();
        assert_eq!(q.enqueue("late"), Err("late"));
    }

    #[tokio::test]
    async fn next_waits_for_enqueue() {
        let q = Arc::new(RequestQueue::new());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.enqueue(42).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = Arc::new(RequestQueue::new());
        q.enqueue(1).unwrap();
        q.close();
        assert_eq!(q.next().await, Some(1));
        assert_eq!(q.next().await, None);
    }

    #[tokio::test]
    async fn each_item_is_delivered_once() {
        let q = Arc::new(RequestQueue::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while let Some(i) = q.next().await {
                        got.push(i);
                    }
                    got
                })
            })
            .collect();
        for i in 0..100 {
            q.enqueue(i).unwrap();
        }
        q.close();

        let mut all = Vec::new();
        for w in workers {
            all.extend(w.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
