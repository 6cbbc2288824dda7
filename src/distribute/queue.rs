//! Bounded Task Queue
//!
//! FIFO of crawl Tasks shared by the producer and consumer sides of a node.
//!
//! ## Responsibilities
//! - **Ordering**: Tasks come out in the order they went in.
//! - **Numbering**: `push` stamps each Task with the queue length it found,
//!   counting itself, minus one.
//! - **Backpressure**: `push` waits while the queue is full, `pull` while it is empty.

use super::types::Task;
use crate::error::{Result, TransportError};

use tokio::sync::{Mutex, mpsc};

pub const DEFAULT_TASK_QUEUE_CAP: usize = 1024;

pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    rx: Mutex<mpsc::Receiver<Task>>,
    /// Serializes pushes so the Id read and the send are one step.
    push_lock: Mutex<()>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_QUEUE_CAP)
    }
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            push_lock: Mutex::new(()),
        }
    }

    /// Enqueues new work, waiting for room. Returns the assigned Id.
    pub async fn push(&self, task: Task) -> Result<usize> {
        self.send(task, true).await
    }

    /// Enqueues a Task received from a producer, keeping its Id.
    pub async fn accept(&self, task: Task) -> Result<usize> {
        self.send(task, false).await
    }

    async fn send(&self, mut task: Task, stamp: bool) -> Result<usize> {
        let _guard = self.push_lock.lock().await;
        let permit = self.tx.reserve().await.map_err(|_| TransportError::Closed)?;

        if stamp {
            // The reserved slot already counts toward len().
            task.id = self.len() - 1;
        }
        let id = task.id;
        permit.send(task);

        tracing::trace!("Queued task {}", id);
        Ok(id)
    }

    /// Dequeues the oldest Task, waiting until one exists.
    pub async fn pull(&self) -> Task {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(task) => task,
            // The sender lives in `self`, so the channel cannot close under us.
            None => std::future::pending().await,
        }
    }

    /// Takes the oldest Task if one is ready. Never waits, including on a
    /// concurrent `pull` that holds the receiver.
    pub fn try_pull(&self) -> Option<Task> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}
