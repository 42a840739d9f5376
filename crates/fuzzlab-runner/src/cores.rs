use anyhow::{bail, Result};
use fuzzlab_core::CancelToken;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

const CANCEL_CHECK: Duration = Duration::from_millis(50);

/// Source of the CPU cores trials may be pinned to.
pub trait CorePool: Send + Sync {
    fn cores(&self) -> Result<Vec<usize>>;
}

#[derive(Debug, Clone)]
pub struct FixedCores(pub Vec<usize>);

impl CorePool for FixedCores {
    fn cores(&self) -> Result<Vec<usize>> {
        Ok(self.0.clone())
    }
}

/// The cores this process is allowed to run on.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffinityCores;

#[cfg(target_os = "linux")]
impl CorePool for AffinityCores {
    fn cores(&self) -> Result<Vec<usize>> {
        use nix::sched::{sched_getaffinity, CpuSet};
        use nix::unistd::Pid;

        let set = sched_getaffinity(Pid::from_raw(0))?;
        Ok((0..CpuSet::count())
            .filter(|cpu| set.is_set(*cpu).unwrap_or(false))
            .collect())
    }
}

#[cfg(not(target_os = "linux"))]
impl CorePool for AffinityCores {
    fn cores(&self) -> Result<Vec<usize>> {
        let count = std::thread::available_parallelism()?.get();
        Ok((0..count).collect())
    }
}

/// Hands out cores so that no two live leases share one.
///
/// Only the first `slots` cores of the pool are used. Returned cores go to
/// the back of the queue, which cycles assignments round-robin.
#[derive(Debug)]
pub struct CoreAllocator {
    free: Mutex<VecDeque<usize>>,
    released: Condvar,
    slots: usize,
}

impl CoreAllocator {
    /// `concurrency` 0 means sequential and needs one core.
    pub fn new(pool: &dyn CorePool, concurrency: usize) -> Result<Arc<Self>> {
        let slots = concurrency.max(1);
        let mut cores = pool.cores()?;
        let mut seen = std::collections::HashSet::new();
        cores.retain(|core| seen.insert(*core));
        if cores.len() < slots {
            bail!(
                "{} concurrent trials need {} cores but only {} are available",
                slots,
                slots,
                cores.len()
            );
        }
        cores.truncate(slots);
        tracing::debug!(?cores, "core pool");
        Ok(Arc::new(Self {
            free: Mutex::new(cores.into()),
            released: Condvar::new(),
            slots,
        }))
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<usize>> {
        match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Blocks until a core is free. Returns `None` once `cancel` fires.
    pub fn acquire(self: &Arc<Self>, cancel: &CancelToken) -> Option<CoreLease> {
        let mut free = self.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(core) = free.pop_front() {
                return Some(CoreLease {
                    core,
                    allocator: self.clone(),
                });
            }
            free = match self.released.wait_timeout(free, CANCEL_CHECK) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn release(&self, core: usize) {
        self.lock().push_back(core);
        self.released.notify_one();
    }
}

/// Exclusive use of one core; returned to the allocator on drop.
#[derive(Debug)]
pub struct CoreLease {
    core: usize,
    allocator: Arc<CoreAllocator>,
}

impl CoreLease {
    pub fn core(&self) -> usize {
        self.core
    }
}

impl Drop for CoreLease {
    fn drop(&mut self) {
        self.allocator.release(self.core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sequential_run_reuses_first_core() {
        let alloc = CoreAllocator::new(&FixedCores(vec![4, 5, 6]), 0).expect("alloc");
        let cancel = CancelToken::new();
        for _ in 0..3 {
            let lease = alloc.acquire(&cancel).expect("lease");
            assert_eq!(lease.core(), 4);
        }
    }

    #[test]
    fn cores_cycle_round_robin() {
        let alloc = CoreAllocator::new(&FixedCores(vec![0, 1, 2, 3]), 2).expect("alloc");
        let cancel = CancelToken::new();
        let seen: Vec<usize> = (0..4)
            .map(|_| alloc.acquire(&cancel).expect("lease").core())
            .collect();
        assert_eq!(seen, vec![0, 1, 0, 1]);
    }

    #[test]
    fn live_leases_never_share_a_core() {
        let alloc = CoreAllocator::new(&FixedCores(vec![0, 1]), 2).expect("alloc");
        let cancel = CancelToken::new();
        let a = alloc.acquire(&cancel).expect("a");
        let b = alloc.acquire(&cancel).expect("b");
        assert_ne!(a.core(), b.core());

        let waiter = {
            let alloc = alloc.clone();
            let cancel = cancel.clone();
            thread::spawn(move || alloc.acquire(&cancel).map(|l| l.core()))
        };
        thread::sleep(Duration::from_millis(20));
        let freed = a.core();
        drop(a);
        assert_eq!(waiter.join().expect("join"), Some(freed));
        drop(b);
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let alloc = CoreAllocator::new(&FixedCores(vec![0]), 1).expect("alloc");
        let cancel = CancelToken::new();
        let _held = alloc.acquire(&cancel).expect("held");
        let waiter = {
            let alloc = alloc.clone();
            let cancel = cancel.clone();
            thread::spawn(move || alloc.acquire(&cancel).is_none())
        };
        cancel.cancel();
        assert!(waiter.join().expect("join"));
    }

    #[test]
    fn more_slots_than_cores_is_rejected() {
        let err = CoreAllocator::new(&FixedCores(vec![0, 0, 1]), 3).unwrap_err();
        assert!(err.to_string().contains("only 2"), "{}", err);
    }

    #[test]
    fn affinity_reports_at_least_one_core() {
        assert!(!AffinityCores.cores().expect("cores").is_empty());
    }
}
