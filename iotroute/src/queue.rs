use std::sync::atomic::{AtomicUsize, Ordering};
use crossbeam::queue::SegQueue;

/// Lock-free bounded FIFO. Pushing onto a full queue hands the value back.
pub struct Queue<T> {
    cap: usize,
    inner: SegQueue<T>,
    dropped: AtomicUsize,
}

impl<T> Drop for Queue<T> {
    #[inline]
    fn drop(&mut self) {
        if !self.inner.is_empty() {
            log::debug!("Queue Drop ... len: {}", self.len());
        }
    }
}

impl<T> Queue<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, inner: SegQueue::new(), dropped: AtomicUsize::new(0) }
    }

    #[inline]
    pub fn push(&self, v: T) -> Result<(), T> {
        if self.inner.len() >= self.cap {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Err(v);
        }
        self.inner.push(v);
        Ok(())
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Takes at most `max` values in FIFO order
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.len()));
        while out.len() < max {
            match self.inner.pop() {
                Some(v) => out.push(v),
                None => break,
            }
        }
        out
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of values rejected because the queue was full
    #[inline]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}
