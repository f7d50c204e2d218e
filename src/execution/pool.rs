//! Fixed-capacity free-lists for operator instances.

use crate::config::ExecConfig;
use crate::metrics::POOL_GETS;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reset hook run before an instance re-enters its pool. Must drop every
/// reference to per-run resources (connections, children, outputs).
pub trait Recycle {
    fn recycle(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub gets: u64,
    pub hits: u64,
    pub puts: u64,
}

/// Free-list of boxed instances
///
/// `get` pops a recycled instance or allocates; `put` takes the box by value,
/// so an instance cannot be returned twice.
#[derive(Debug)]
pub struct OperatorPool<T> {
    name: &'static str,
    capacity: usize,
    free: Mutex<Vec<Box<T>>>,
    gets: AtomicU64,
    hits: AtomicU64,
    puts: AtomicU64,
}

impl<T: Recycle + Default> OperatorPool<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            free: Mutex::new(Vec::new()),
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Pool sized from `PHOTONQ_OPERATOR_POOL_SIZE`.
    pub fn from_env(name: &'static str) -> Self {
        Self::new(name, ExecConfig::from_env().operator_pool_size)
    }

    pub fn get(&self) -> Box<T> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        match self.free.lock().pop() {
            Some(item) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                POOL_GETS.with_label_values(&[self.name, "hit"]).inc();
                item
            }
            None => {
                POOL_GETS.with_label_values(&[self.name, "miss"]).inc();
                Box::default()
            }
        }
    }

    pub fn put(&self, mut item: Box<T>) {
        item.recycle();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(item);
            self.puts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
        }
    }
}
