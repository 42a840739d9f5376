use anyhow::{anyhow, Context, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of OS threads shared by the build and run phases.
///
/// A size of 0 runs every task inline on the submitting thread. Otherwise
/// tasks are handed over through a rendezvous channel: `execute` blocks until
/// a worker is idle, so no more than `size` tasks are ever in flight and
/// nothing queues up behind the workers.
pub struct WorkerPool {
    size: usize,
    sender: Option<SyncSender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Ok(Self {
                size,
                sender: None,
                workers: Vec::new(),
            });
        }
        let (sender, receiver) = mpsc::sync_channel::<Task>(0);
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let receiver = receiver.clone();
            let worker_name = format!("{}-{}", name, idx);
            let handle = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || worker_loop(&worker_name, &receiver))
                .with_context(|| format!("failed to spawn worker {}", idx))?;
            workers.push(handle);
        }
        Ok(Self {
            size,
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_inline(&self) -> bool {
        self.sender.is_none()
    }

    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            None => {
                run_task("inline", Box::new(task));
                Ok(())
            }
            Some(sender) => sender
                .send(Box::new(task))
                .map_err(|_| anyhow!("worker pool has shut down")),
        }
    }

    /// Waits for every in-flight task and stops the workers.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(name: &str, receiver: &Mutex<Receiver<Task>>) {
    loop {
        let next = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        match next {
            Ok(task) => run_task(name, task),
            Err(_) => break,
        }
    }
}

fn run_task(name: &str, task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!(worker = name, "task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn inline_pool_runs_on_caller_thread() {
        let pool = WorkerPool::new("inline", 0).expect("pool");
        assert!(pool.is_inline());
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        pool.execute(move || {
            tx.send(thread::current().id()).expect("send");
        })
        .expect("execute");
        assert_eq!(rx.try_recv().expect("ran synchronously"), caller);
    }

    #[test]
    fn never_exceeds_pool_size_in_flight() {
        let pool = WorkerPool::new("bounded", 3).expect("pool");
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            let done = done.clone();
            pool.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            })
            .expect("execute");
        }
        pool.join();
        assert_eq!(done.load(Ordering::SeqCst), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("panics", 1).expect("pool");
        let done = Arc::new(AtomicUsize::new(0));
        pool.execute(|| panic!("boom")).expect("execute");
        let counter = done.clone();
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("execute");
        pool.join();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
