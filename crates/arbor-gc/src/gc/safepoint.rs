//! Stop-the-world coordination.
//!
//! The collecting thread parks every other attached thread before marking.
//! `unparked_thread_count` tracks the threads that still run mutator code:
//! it is positive only while a collection waits for threads to park, and
//! drops to `-N` when `N` threads sit in safepoint scopes with nobody
//! collecting. The last thread to park wakes the collector.

use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::gc::StackState;
use crate::stack::current_stack_position;
use crate::thread_state::ThreadState;

/// Asks a thread that may run for a long time without allocating to reach
/// a safepoint.
///
/// Registered per thread with
/// [`ThreadState::add_interruptor`](crate::ThreadState::add_interruptor).
/// A typical implementation posts a task to the thread's event loop that
/// calls [`ThreadState::safe_point`](crate::ThreadState::safe_point).
pub trait Interruptor: Send + Sync {
    /// A collection wants this thread parked.
    fn request_interrupt(&self);
    /// The collection finished or was abandoned.
    fn clear_interrupt(&self);
}

pub(crate) struct SafePointBarrier {
    unparked_thread_count: CachePadded<AtomicIsize>,
    can_resume: AtomicBool,
    mutex: Mutex<()>,
    parked: Condvar,
    resume: Condvar,
}

impl SafePointBarrier {
    pub fn new() -> Self {
        Self {
            unparked_thread_count: CachePadded::new(AtomicIsize::new(0)),
            can_resume: AtomicBool::new(true),
            mutex: Mutex::new(()),
            parked: Condvar::new(),
            resume: Condvar::new(),
        }
    }

    /// Whether a collection waits for threads to park.
    pub fn is_park_requested(&self) -> bool {
        !self.can_resume.load(Ordering::Acquire)
    }

    /// Requests every thread but `current` to park and waits up to
    /// `timeout` for them.
    ///
    /// On timeout the threads that did park are resumed and `false` is
    /// returned. The caller must be in a safepoint and hold the attach lock.
    pub fn park_others(
        &self,
        current: &ThreadState,
        threads: &[Arc<ThreadState>],
        timeout: Duration,
    ) -> bool {
        let mut guard = self.mutex.lock();
        self.unparked_thread_count
            .fetch_add(thread_count(threads), Ordering::AcqRel);
        self.can_resume.store(false, Ordering::Release);
        for state in threads {
            if !std::ptr::eq(Arc::as_ptr(state), current) {
                state.request_interrupts();
            }
        }
        let deadline = Instant::now() + timeout;
        while self.unparked_thread_count.load(Ordering::Acquire) > 0 {
            if self.parked.wait_until(&mut guard, deadline).timed_out() {
                let unparked = self.unparked_thread_count.load(Ordering::Acquire);
                if unparked > 0 {
                    crate::tracing::internal::log_park_timeout(unparked, timeout);
                    self.resume_locked(threads);
                    return false;
                }
            }
        }
        true
    }

    /// Lets every parked thread continue.
    pub fn resume_others(&self, threads: &[Arc<ThreadState>]) {
        let _guard = self.mutex.lock();
        self.resume_locked(threads);
    }

    fn resume_locked(&self, threads: &[Arc<ThreadState>]) {
        self.unparked_thread_count
            .fetch_sub(thread_count(threads), Ordering::AcqRel);
        self.can_resume.store(true, Ordering::Release);
        self.resume.notify_all();
        for state in threads {
            state.clear_interrupts();
        }
    }

    /// Parks the calling thread until the collection resumes it, if one is
    /// pending. The thread must have recorded its stack beforehand.
    pub fn check_and_park(&self) -> bool {
        if self.can_resume.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.mutex.lock();
        if self.unparked_thread_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.parked.notify_one();
        }
        while !self.can_resume.load(Ordering::Acquire) {
            self.resume.wait(&mut guard);
        }
        self.unparked_thread_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Counts the calling thread as parked without blocking it.
    pub fn enter_safe_point(&self) {
        if self.unparked_thread_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.mutex.lock();
            self.parked.notify_one();
        }
    }

    /// Counts the calling thread as running again. Returns `true` when a
    /// collection is pending and the thread has to park.
    pub fn leave_safe_point(&self) -> bool {
        self.unparked_thread_count.fetch_add(1, Ordering::AcqRel) + 1 > 0
    }
}

fn thread_count(threads: &[Arc<ThreadState>]) -> isize {
    isize::try_from(threads.len()).unwrap_or(isize::MAX)
}

/// RAII guard keeping the current thread in a safepoint.
///
/// Inside the scope the thread must not touch heap objects; other threads
/// may collect without waiting for it. Stack words between the scope and
/// the point of entry are copied so that the collector can scan them while
/// the thread keeps running.
pub struct SafePointScope<'a> {
    state: &'a ThreadState,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl<'a> SafePointScope<'a> {
    /// Enters a safepoint on `state`, which must be the current thread's.
    #[must_use]
    pub fn new(state: &'a ThreadState, stack_state: StackState) -> Self {
        let marker = current_stack_position();
        state.enter_safe_point(stack_state, marker);
        Self {
            state,
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for SafePointScope<'_> {
    fn drop(&mut self) {
        self.state.leave_safe_point();
    }
}
