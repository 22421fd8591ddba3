//! Bounded worker pool for per-login work.

use crate::error::{Error, Result};
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};

/// Fixed-size rayon pool that isolates panics per item.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// Pool with `jobs` threads; 0 leaves the size to rayon (one per core).
    pub fn new(jobs: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("reconcile-{i}"))
            .build()
            .map_err(|e| Error::Pool(format!("failed to create thread pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `work` over every item and wait for all of them.
    ///
    /// Results come back in input order. A panicking item yields `Err` with
    /// the panic message; its siblings are unaffected.
    pub fn run<T, R, F>(&self, items: &[T], work: F) -> Vec<std::result::Result<R, String>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    panic::catch_unwind(AssertUnwindSafe(|| work(item))).map_err(panic_message)
                })
                .collect()
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
