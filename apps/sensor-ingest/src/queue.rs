use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex, Notify};

/// Unbounded FIFO between the receive task and the insert task, with a
/// drain barrier: [`TransferQueue::join`] resolves once every item that was
/// `put` has been matched by a `mark_done`.
#[derive(Debug)]
pub struct TransferQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
    unfinished: AtomicU64,
    drained: Notify,
}

impl<T> TransferQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            unfinished: AtomicU64::new(0),
            drained: Notify::new(),
        }
    }

    pub fn put(&self, item: T) {
        let pending = self.unfinished.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(pending, "queued reading");
        // The receiver lives inside `self`, so the channel cannot be closed here.
        if self.tx.send(item).is_err() {
            self.finish_one();
        }
    }

    /// Waits for the next item. Cancel-safe: dropping the future loses nothing.
    pub async fn get(&self) -> T {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(item) => item,
            // `tx` is owned by `self`, so the channel never reports closed.
            None => std::future::pending().await,
        }
    }

    pub fn mark_done(&self) {
        self.finish_one();
    }

    /// Drain barrier.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.unfinished.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> u64 {
        self.unfinished.load(Ordering::Acquire)
    }

    fn finish_one(&self) {
        let previous = self
            .unfinished
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.drained.notify_waiters(),
            Ok(_) => {}
            Err(_) => tracing::error!("mark_done called more times than items were queued"),
        }
    }
}

impl<T> Default for TransferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
