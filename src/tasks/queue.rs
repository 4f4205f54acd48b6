use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ordered FIFO shared between the router and listener pump loops. Critical
/// sections are short and never held across an await point.
#[derive(Debug)]
pub struct TaskQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, value: T) {
        self.lock().push_back(value);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pop_front(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Pop from the front while `take` accepts the head element; stops at the
    /// first rejection so FIFO order is preserved.
    pub fn drain_while<F>(&self, mut take: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut queue = self.lock();
        let mut out = Vec::new();
        while let Some(front) = queue.front() {
            if !take(front) {
                break;
            }
            if let Some(value) = queue.pop_front() {
                out.push(value);
            }
        }
        out
    }

    /// Remove and return the first element matching `pred`, keeping the
    /// relative order of the rest.
    pub fn remove_where<F>(&self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut queue = self.lock();
        let index = queue.iter().position(|v| pred(v))?;
        queue.remove(index)
    }

    pub fn contains_where<F>(&self, mut pred: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        self.lock().iter().any(|v| pred(v))
    }
}

impl<T: Clone> TaskQueue<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = TaskQueue::new();
        q.put(1);
        q.put(2);
        q.put(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.snapshot(), vec![2, 3]);
    }

    #[test]
    fn drain_stops_at_first_rejection() {
        let q = TaskQueue::new();
        for v in [100usize, 2000, 50] {
            q.put(v);
        }
        let mut size = 0usize;
        let budget = 200usize;
        let taken = q.drain_while(|v| {
            if size + v < budget {
                size += v;
                true
            } else {
                false
            }
        });
        // The 2000-byte element blocks the queue; the 50 behind it must not
        // be skipped over.
        assert_eq!(taken, vec![100]);
        assert_eq!(q.snapshot(), vec![2000, 50]);
    }

    #[test]
    fn remove_where_keeps_order() {
        let q = TaskQueue::new();
        for v in ["a", "b", "c"] {
            q.put(v);
        }
        assert_eq!(q.remove_where(|v| *v == "b"), Some("b"));
        assert_eq!(q.snapshot(), vec!["a", "c"]);
        assert_eq!(q.remove_where(|v| *v == "z"), None);
    }

    #[test]
    fn concurrent_put_and_drain() {
        use std::sync::Arc;
        let q = Arc::new(TaskQueue::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    q.put(t * 100 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 400);
    }
}
