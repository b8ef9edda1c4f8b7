use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Delay queue keyed by scheduled emit time.
///
/// The queue carries a soft bound; beyond it frames are refused and the
/// caller counts the drop. Closing wakes the dispatcher, which then drains
/// nothing further.
pub struct DelayQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    bound: usize,
}

struct Inner {
    entries: BTreeMap<(Instant, u64), Vec<u8>>,
    next_seq: u64,
    open: bool,
}

impl DelayQueue {
    pub fn new(bound: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_seq: 0,
                open: true,
            }),
            cond: Condvar::new(),
            bound,
        }
    }

    /// Enqueues a frame for emission at `due`. Returns false at the bound.
    pub fn push(&self, due: Instant, frame: Vec<u8>) -> bool {
        self.insert(due, frame, 0)
    }

    /// Enqueues a frame, then swaps its payload with the entry `gap`
    /// positions ahead of it in emission order.
    pub fn push_reordered(&self, due: Instant, frame: Vec<u8>, gap: usize) -> bool {
        self.insert(due, frame, gap)
    }

    fn insert(&self, due: Instant, frame: Vec<u8>, gap: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open || inner.entries.len() >= self.bound {
            return false;
        }
        let key = (due, inner.next_seq);
        inner.next_seq += 1;
        inner.entries.insert(key, frame);
        if gap > 0 {
            let ahead = inner
                .entries
                .range(..key)
                .rev()
                .nth(gap - 1)
                .map(|(k, _)| *k);
            if let Some(ahead) = ahead {
                if let (Some(a), Some(b)) =
                    (inner.entries.remove(&ahead), inner.entries.remove(&key))
                {
                    inner.entries.insert(ahead, b);
                    inner.entries.insert(key, a);
                }
            }
        }
        self.cond.notify_one();
        true
    }

    /// Blocks until the earliest frame falls due, returning it; `None` once
    /// the queue is closed.
    pub fn pop_due(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !inner.open {
                return None;
            }
            match inner.entries.first_key_value().map(|(k, _)| *k) {
                Some(key) => {
                    let now = Instant::now();
                    if key.0 <= now {
                        return inner.entries.remove(&key);
                    }
                    let wait = key.0.duration_since(now);
                    let (guard, _) = self.cond.wait_timeout(inner, wait).unwrap();
                    inner = guard;
                }
                None => {
                    let (guard, _) = self
                        .cond
                        .wait_timeout(inner, Duration::from_millis(100))
                        .unwrap();
                    inner = guard;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().open = false;
        self.cond.notify_all();
    }
}
