use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::WorkItem;

/// Unbounded in-process FIFO feeding the worker loops.
///
/// Every enqueue adds one semaphore permit. A consumer first takes a permit and
/// only then pops, so a pop always finds an item and no item is handed to two
/// consumers. Waiting consumers are woken in arrival order.
#[derive(Debug)]
pub struct WorkQueue<T = WorkItem> {
    items: Mutex<VecDeque<T>>,
    available: Semaphore,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
        }
    }

    /// Append an item and wake one waiting consumer. Never blocks.
    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.add_permits(1);
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once `cancel` fires before an item became available; that
    /// is the normal worker shutdown path, not a failure.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<T> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = self.available.acquire() => permit.ok()?,
        };
        // The item now belongs to this caller; the permit must not come back.
        permit.forget();
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
