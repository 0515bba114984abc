use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("hand-off queue was cancelled")]
pub struct Cancelled;

/// Bounded queue carrying finished work from worker threads to the main
/// thread.
///
/// Pushing blocks while the queue is full; cancelling wakes every blocked
/// producer and consumer and turns later operations into no-ops. Workers
/// treat `Err(Cancelled)` as the signal to stop.
pub struct HandoffQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    // dropping the sender disconnects `cancel_rx`, which wakes every select
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    cancelled: AtomicBool,
    capacity: usize,
}

impl<T> HandoffQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        let (cancel_tx, cancel_rx) = bounded(0);
        Self {
            sender,
            receiver,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
            cancelled: AtomicBool::new(false),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Blocks until there is room or the queue is cancelled.
    pub fn push(&self, item: T) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        select! {
            send(self.sender, item) -> res => res.map_err(|_| Cancelled),
            recv(self.cancel_rx) -> _ => Err(Cancelled),
        }
    }

    /// Blocks until an item arrives; `None` once cancelled.
    pub fn pop(&self) -> Option<T> {
        if self.is_cancelled() {
            return None;
        }
        select! {
            recv(self.receiver) -> item => item.ok(),
            recv(self.cancel_rx) -> _ => None,
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        if self.is_cancelled() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<T> {
        if self.is_cancelled() {
            return Vec::new();
        }
        self.receiver.try_iter().collect()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_tx.lock().take();
        while self.receiver.try_recv().is_ok() {}
    }
}

impl<T> Drop for HandoffQueue<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn fifo_within_capacity() {
        let queue = HandoffQueue::bounded(4);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn cancel_unblocks_a_full_push() {
        let queue = Arc::new(HandoffQueue::bounded(1));
        queue.push(0u32).unwrap();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(1))
        };
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        queue.cancel();
        assert_eq!(producer.join().unwrap(), Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancel_unblocks_an_empty_pop() {
        let queue = Arc::new(HandoffQueue::<u32>::bounded(2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.cancel();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn cancelled_queue_is_inert() {
        let queue = HandoffQueue::bounded(2);
        queue.push(1).unwrap();
        queue.cancel();
        assert!(queue.is_cancelled());
        assert_eq!(queue.push(2), Err(Cancelled));
        assert!(queue.drain().is_empty());
        assert_eq!(queue.pop(), None);
    }
}
