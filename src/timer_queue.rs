use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// An object with a deadline which may be checked without exclusive access.
pub trait Timer {
    fn is_due(&self, now_ms: u64) -> bool;
}

/// A rotating set of weakly-held timers. Each pass visits a bounded number of entries, so the
/// cost of a pass does not grow with the number of timers.
pub struct TimerQueue<T> {
    queue: VecDeque<Weak<T>>,
}

impl<T> Default for TimerQueue<T>
where
    T: Timer,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T>
where
    T: Timer,
{
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, timer: Weak<T>) {
        self.queue.push_back(timer);
    }

    /// Visits up to `limit` timers, passing those which are due to `on_due`. Timers whose owners
    /// have been dropped are forgotten.
    pub fn poll<F>(&mut self, limit: usize, now_ms: u64, mut on_due: F)
    where
        F: FnMut(Arc<T>),
    {
        for _ in 0..limit.min(self.queue.len()) {
            let timer_weak = match self.queue.pop_front() {
                Some(timer_weak) => timer_weak,
                None => break,
            };

            if let Some(timer) = timer_weak.upgrade() {
                self.queue.push_back(timer_weak);

                if timer.is_due(now_ms) {
                    on_due(timer);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
