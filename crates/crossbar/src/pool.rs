use std::sync::Mutex;

/// A value that can be recycled through a [`Pool`].
pub trait Reusable: Send {
    /// Clears per-call state before the value goes back on the shelf.
    fn reset(&mut self);
}

/// Thread-safe free-list of reusable values. `acquire` hands out a stored
/// value or builds a fresh one; `release` resets the value and stores it
/// unless the pool is at capacity, in which case the value is dropped.
pub struct Pool<T: Reusable> {
    items: Mutex<Vec<T>>,
    capacity: usize,
    build: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Reusable> Pool<T> {
    pub fn new(capacity: usize, build: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Pool {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            build: Box::new(build),
        }
    }

    pub fn acquire(&self) -> T {
        let recycled = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        recycled.unwrap_or_else(|| (self.build)())
    }

    pub fn release(&self, mut item: T) {
        item.reset();
        let mut items = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    /// Number of values currently on the shelf.
    pub fn idle(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
