//! FIFO of job ids shared by the worker pool.

use super::error::QueueClosed;
use crate::domain::jobs::JobId;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    ids: VecDeque<JobId>,
    closed: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: JobId) -> Result<(), QueueClosed> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueClosed);
            }
            inner.ids.push_back(id);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the next id. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<JobId> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(id) = inner.ids.pop_front() {
                    // Pass the wakeup on if more work is waiting.
                    if !inner.ids.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(id);
                }
            }
            notified.await;
        }
    }

    /// Removes a queued id. Returns whether it was still waiting.
    pub fn remove(&self, id: &JobId) -> bool {
        let mut inner = self.lock();
        let before = inner.ids.len();
        inner.ids.retain(|queued| queued != id);
        inner.ids.len() != before
    }

    /// Closes the queue, wakes every waiter and hands back what was left.
    pub fn close(&self) -> Vec<JobId> {
        let remaining = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.ids.drain(..).collect()
        };
        self.notify.notify_waiters();
        remaining
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
