// src/pool.rs
//! Fixed-size worker pool draining one FIFO task queue.
//!
//! Tasks are plain messages handed to a single handler shared by every
//! worker; the pool never runs arbitrary closures. Shutdown is cooperative:
//! already-queued tasks still run before their worker exits.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

struct Queue<T> {
    tasks: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    wake: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        // Handlers never run under this lock, so a poisoned queue is still consistent.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `size` workers (at least one), each feeding tasks to `handler`.
    pub fn new<F>(size: usize, handler: F) -> std::io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            wake: Condvar::new(),
        });
        let handler = Arc::new(handler);

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let shared = Arc::clone(&shared);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("ember-worker-{}", i))
                .spawn(move || worker_loop(i, &shared, &*handler))?;
            handles.push(handle);
        }

        Ok(Self { shared, handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Enqueue a task and wake one idle worker.
    pub fn submit(&self, task: T) {
        self.shared.lock().tasks.push_back(task);
        self.shared.wake.notify_one();
    }

    /// Number of tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Close the queue, let workers drain what is left, and join them.
    pub fn shutdown(&mut self) {
        self.shared.lock().closed = true;
        self.shared.wake.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

fn worker_loop<T, F>(id: usize, shared: &Shared<T>, handler: &F)
where
    F: Fn(T),
{
    let mut queue = shared.lock();
    loop {
        if let Some(task) = queue.tasks.pop_front() {
            drop(queue);
            run_task(id, handler, task);
            queue = shared.lock();
        } else if queue.closed {
            break;
        } else {
            queue = shared
                .wake
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
    debug!("worker {} exiting", id);
}

#[cfg(feature = "catch-panic")]
fn run_task<T, F: Fn(T)>(id: usize, handler: &F, task: T) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(task)));
    if result.is_err() {
        error!("worker {} task panicked; continuing", id);
    }
}

#[cfg(not(feature = "catch-panic"))]
fn run_task<T, F: Fn(T)>(_id: usize, handler: &F, task: T) {
    handler(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_runs_every_submitted_task() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let mut pool = WorkerPool::new(4, move |n: usize| {
            seen_clone.fetch_add(n, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(pool.size(), 4);

        for _ in 0..1000 {
            pool.submit(1);
        }
        pool.shutdown();
        assert_eq!(seen.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_single_worker_preserves_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let mut pool = WorkerPool::new(1, move |n: u32| {
            order_clone.lock().unwrap().push(n);
        })
        .unwrap();

        for n in 0..50 {
            pool.submit(n);
        }
        pool.shutdown();
        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let done = Arc::new(AtomicUsize::new(0));
        let done_clone = done.clone();
        let mut pool = WorkerPool::new(2, move |_: ()| {
            thread::sleep(Duration::from_millis(5));
            done_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..20 {
            pool.submit(());
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert_eq!(pool.pending(), 0);
    }

    #[cfg(feature = "catch-panic")]
    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let done = Arc::new(AtomicUsize::new(0));
        let done_clone = done.clone();
        let mut pool = WorkerPool::new(1, move |fail: bool| {
            if fail {
                panic!("boom");
            }
            done_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.submit(true);
        pool.submit(false);
        pool.submit(false);
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }
}
