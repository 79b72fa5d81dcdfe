//! Wait-sets: "sleep until someone resumes this set".
//!
//! A wait-set lives inside the cache state and is only touched while the
//! state mutex is held. Each suspended thread pushes its own [`Waiter`]
//! (one condvar per sleeper) and parks on it; parking releases the state
//! mutex. `resume_all` pops the stack, so the most recently suspended
//! thread is woken first.
//!
//! There is no timeout and no cancellation. A resumed thread must
//! re-check the condition it slept on: wakeups are broadcast and
//! another thread may have consumed the resource first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, MutexGuard, PoisonError};

/// One suspended thread
pub(crate) struct Waiter {
    /// Set under the state mutex by `resume_all`
    woken: AtomicBool,
    condvar: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Waiter {
            woken: AtomicBool::new(false),
            condvar: Condvar::new(),
        }
    }

    #[inline]
    fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Relaxed)
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Relaxed);
        self.condvar.notify_one();
    }
}

/// LIFO stack of suspended threads
#[derive(Default)]
pub(crate) struct WaitSet {
    stack: Vec<Arc<Waiter>>,
}

impl WaitSet {
    pub(crate) const fn new() -> Self {
        WaitSet { stack: Vec::new() }
    }

    fn enqueue(&mut self) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter::new());
        self.stack.push(Arc::clone(&waiter));
        waiter
    }

    /// Wake every suspended thread, newest first. Returns how many.
    pub(crate) fn resume_all(&mut self) -> usize {
        let n = self.stack.len();
        while let Some(waiter) = self.pop_newest() {
            waiter.wake();
        }
        n
    }

    #[inline]
    fn pop_newest(&mut self) -> Option<Arc<Waiter>> {
        self.stack.pop()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Move the sleepers out, leaving this set empty
    pub(crate) fn take(&mut self) -> WaitSet {
        WaitSet { stack: std::mem::take(&mut self.stack) }
    }
}

/// Suspend the calling thread on the wait-set chosen by `select`.
///
/// The guard is released while parked and re-acquired before returning.
pub(crate) fn suspend<'a, T>(
    mut guard: MutexGuard<'a, T>,
    select: impl FnOnce(&mut T) -> &mut WaitSet,
) -> MutexGuard<'a, T> {
    let waiter = select(&mut guard).enqueue();
    while !waiter.is_woken() {
        guard = waiter
            .condvar
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    struct Shared {
        set: WaitSet,
        ready: bool,
    }

    fn wait_until_sleeping(shared: &Mutex<Shared>, n: usize) {
        while shared.lock().unwrap().set.len() < n {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_resume_all_on_empty_set() {
        let mut set = WaitSet::new();
        assert!(set.is_empty());
        assert_eq!(set.resume_all(), 0);
    }

    #[test]
    fn test_resume_wakes_every_sleeper() {
        let shared = Arc::new(Mutex::new(Shared { set: WaitSet::new(), ready: false }));
        let mut handles = vec![];

        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                let mut guard = shared.lock().unwrap();
                while !guard.ready {
                    guard = suspend(guard, |s| &mut s.set);
                }
            }));
        }

        wait_until_sleeping(&shared, 4);
        {
            let mut guard = shared.lock().unwrap();
            guard.ready = true;
            assert_eq!(guard.set.resume_all(), 4);
            assert!(guard.set.is_empty());
        }

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_sleeper_rechecks_condition() {
        // A wakeup without the condition becoming true sends the sleeper
        // straight back onto the set.
        let shared = Arc::new(Mutex::new(Shared { set: WaitSet::new(), ready: false }));

        let sleeper = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut guard = shared.lock().unwrap();
                let mut rounds = 0;
                while !guard.ready {
                    guard = suspend(guard, |s| &mut s.set);
                    rounds += 1;
                }
                rounds
            })
        };

        wait_until_sleeping(&shared, 1);
        shared.lock().unwrap().set.resume_all();

        wait_until_sleeping(&shared, 1);
        {
            let mut guard = shared.lock().unwrap();
            guard.ready = true;
            guard.set.resume_all();
        }

        assert_eq!(sleeper.join().unwrap(), 2);
    }

    #[test]
    fn test_newest_sleeper_resumes_first() {
        let mut set = WaitSet::new();
        let first = set.enqueue();
        let second = set.enqueue();
        let third = set.enqueue();

        let order: Vec<_> = std::iter::from_fn(|| set.pop_newest()).collect();
        assert_eq!(order.len(), 3);
        assert!(Arc::ptr_eq(&order[0], &third));
        assert!(Arc::ptr_eq(&order[1], &second));
        assert!(Arc::ptr_eq(&order[2], &first));
        assert!(set.is_empty());
    }

    #[test]
    fn test_take_moves_sleepers() {
        let mut set = WaitSet::new();
        let waiter = set.enqueue();
        let mut taken = set.take();

        assert!(set.is_empty());
        assert_eq!(taken.len(), 1);
        taken.resume_all();
        assert!(waiter.is_woken());
    }
}
