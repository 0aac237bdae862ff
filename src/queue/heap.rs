//! Thread-safe max-heap over async tasks.
//!
//! Ordering: strictly by priority (larger first), ties broken FIFO by an
//! enqueue sequence number. One mutex guards the heap; consumers park on a
//! `Notify` when the heap is empty. The heap is always checked before
//! parking, so a permit stored by a racing `enqueue` is never lost.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::types::{MiddlewareError, Result};

use super::task::AsyncTask;

struct HeapEntry {
    priority: i32,
    seq: u64,
    task: AsyncTask,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first; among equals the earlier sequence
        // number wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    closed: bool,
}

/// Priority queue feeding the async consumer workers.
pub struct PriorityQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    size: AtomicUsize,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Add a task. Fails once the queue has been closed.
    pub fn enqueue(&self, task: AsyncTask) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            if inner.closed {
                return Err(MiddlewareError::PoolClosed("async queue".to_string()));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(HeapEntry {
                priority: task.priority,
                seq,
                task,
            });
        }
        self.size.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority task, waiting while the queue is empty.
    /// Returns `None` only when the queue is closed and fully drained.
    pub async fn dequeue(&self) -> Option<AsyncTask> {
        loop {
            let wakeup = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("queue mutex poisoned");
                if let Some(entry) = inner.heap.pop() {
                    self.size.fetch_sub(1, Ordering::Relaxed);
                    // Pass the permit along in case more tasks remain for
                    // other parked consumers.
                    if !inner.heap.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(entry.task);
                }
                if inner.closed {
                    return None;
                }
            }
            wakeup.await;
        }
    }

    /// Tasks currently queued.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Stop accepting tasks and wake every parked consumer so drained
    /// consumers can observe the close.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("queue mutex poisoned").closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::task::TaskKind;
    use serde_json::json;

    fn task(priority: i32, label: &str) -> AsyncTask {
        AsyncTask::new(
            TaskKind::Business {
                op: label.to_string(),
                params: json!({}),
            },
            priority,
        )
    }

    fn op_of(task: &AsyncTask) -> String {
        match &task.kind {
            TaskKind::Business { op, .. } => op.clone(),
            other => panic!("unexpected kind {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_strict_priority_order() {
        let queue = PriorityQueue::new();
        queue.enqueue(task(1, "low")).expect("enqueue");
        queue.enqueue(task(5, "medium")).expect("enqueue");
        queue.enqueue(task(10, "high")).expect("enqueue");

        assert_eq!(op_of(&queue.dequeue().await.expect("pop")), "high");
        assert_eq!(op_of(&queue.dequeue().await.expect("pop")), "medium");
        assert_eq!(op_of(&queue.dequeue().await.expect("pop")), "low");
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_equal_priority_is_fifo() {
        let queue = PriorityQueue::new();
        for label in ["first", "second", "third"] {
            queue.enqueue(task(5, label)).expect("enqueue");
        }

        assert_eq!(op_of(&queue.dequeue().await.expect("pop")), "first");
        assert_eq!(op_of(&queue.dequeue().await.expect("pop")), "second");
        assert_eq!(op_of(&queue.dequeue().await.expect("pop")), "third");
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_and_drains() {
        let queue = PriorityQueue::new();
        queue.enqueue(task(5, "pending")).expect("enqueue");
        queue.close();

        assert!(matches!(
            queue.enqueue(task(5, "late")),
            Err(MiddlewareError::PoolClosed(_))
        ));

        // Already-queued work still drains, then the queue reports empty.
        assert_eq!(op_of(&queue.dequeue().await.expect("pop")), "pending");
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = std::sync::Arc::new(PriorityQueue::new());

        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        queue.enqueue(task(3, "late-arrival")).expect("enqueue");
        let got = waiter.await.expect("join").expect("task");
        assert_eq!(op_of(&got), "late-arrival");
    }
}
