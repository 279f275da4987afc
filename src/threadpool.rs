//! Fixed-size worker pool for block I/O. One mutex+condvar per worker plus
//! a pool-wide busy table, mirroring the original implementation's
//! per-worker wait/signal design rather than a shared work queue.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often an idle worker wakes up to check the pool's quit flag.
/// Documented per the redesign note asking for this to not be a silent
/// magic number; still 300 µs as specified.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_micros(300);

type Task = Box<dyn FnOnce() + Send>;

struct WorkerShared {
    lock: Mutex<Option<Task>>,
    cond: Condvar,
}

struct PoolShared {
    busy: Mutex<Vec<bool>>,
    quit: Mutex<bool>,
}

pub struct WorkerPool {
    pool: Arc<PoolShared>,
    workers: Vec<Arc<WorkerShared>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(n: usize) -> WorkerPool {
        let pool = Arc::new(PoolShared {
            busy: Mutex::new(vec![false; n]),
            quit: Mutex::new(false),
        });

        let mut workers = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);

        for id in 0..n {
            let worker = Arc::new(WorkerShared {
                lock: Mutex::new(None),
                cond: Condvar::new(),
            });
            let worker_clone = Arc::clone(&worker);
            let pool_clone = Arc::clone(&pool);

            let handle = thread::spawn(move || worker_thread_fn(id, worker_clone, pool_clone));

            workers.push(worker);
            handles.push(handle);
        }

        WorkerPool {
            pool,
            workers,
            handles,
        }
    }

    /// Dispatches `task` to the first idle worker. O(N) scan over the busy
    /// table, as specified. Returns `Err(())` if every worker is busy.
    pub fn run(&self, task: Task) -> Result<(), ()> {
        let mut busy = self.pool.busy.lock().unwrap();
        for (id, slot) in busy.iter_mut().enumerate() {
            if !*slot {
                *slot = true;
                drop(busy);

                let worker = &self.workers[id];
                let mut guard = worker.lock.lock().unwrap();
                *guard = Some(task);
                worker.cond.notify_one();
                return Ok(());
            }
        }
        Err(())
    }
}

fn worker_thread_fn(id: usize, worker: Arc<WorkerShared>, pool: Arc<PoolShared>) {
    loop {
        let task = {
            let mut guard = worker.lock.lock().unwrap();
            loop {
                if let Some(task) = guard.take() {
                    break task;
                }
                if *pool.quit.lock().unwrap() {
                    return;
                }
                let (g, _timeout) = worker
                    .cond
                    .wait_timeout(guard, WORKER_POLL_INTERVAL)
                    .unwrap();
                guard = g;
            }
        };

        task();

        let mut busy = pool.busy.lock().unwrap();
        busy[id] = false;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        *self.pool.quit.lock().unwrap() = true;
        for worker in &self.workers {
            worker.cond.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn dispatches_and_completes() {
        let pool = WorkerPool::new(4);
        let counter = StdArc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = StdArc::clone(&counter);
            pool.run(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        // give workers a moment to drain; pool Drop joins all of them anyway.
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn saturation_returns_err() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        pool.run(Box::new(move || {
            let _ = rx.recv();
        }))
        .unwrap();
        assert!(pool.run(Box::new(|| {})).is_err());
        drop(tx);
    }
}
