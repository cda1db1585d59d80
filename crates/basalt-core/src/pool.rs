use basalt_common::{BasaltError, Result};

/// Fixed-size worker pool shared across queries.
///
/// The pool is created at process init and torn down with the process; the
/// combine node submits one task per leaf plan. Tasks run to completion and
/// poll the query deadline flag at block granularity.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    num_threads: usize,
}

impl WorkerPool {
    /// Builds a pool with the given thread count.
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(BasaltError::InvalidConfig(
                "worker pool needs at least one thread".to_string(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("query-worker-{i}"))
            .build()
            .map_err(|e| BasaltError::InvalidConfig(format!("worker pool build failed: {e}")))?;
        Ok(Self { pool, num_threads })
    }

    /// Submits a detached task.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.spawn(job);
    }

    /// Configured thread count.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_submitted_tasks() {
        let pool = WorkerPool::new(2).expect("pool");
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i).expect("send"));
        }
        drop(tx);
        let mut seen: Vec<i32> = rx.iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_zero_threads() {
        assert!(WorkerPool::new(0).is_err());
    }
}
