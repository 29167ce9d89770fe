//! Process-shared synchronization primitives
//!
//! Thin wrappers over `pthread_mutex_t` / `pthread_cond_t` configured with
//! `PTHREAD_PROCESS_SHARED`. They must be initialized in place inside a
//! shared mapping and are never moved afterwards.
//!
//! Mutexes are robust: if a worker dies while holding one, the next locker
//! gets `EOWNERDEAD`, marks the mutex consistent and carries on. Critical
//! sections only touch a handful of counters, so the protected data stays
//! usable.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::ptr::addr_of_mut;
use std::time::Duration;
use tracing::warn;

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Mutex usable across forked processes, guarding a `T` in the same mapping
#[repr(C)]
pub struct ProcessMutex<T> {
    raw: UnsafeCell<libc::pthread_mutex_t>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ProcessMutex<T> {}
unsafe impl<T: Send> Sync for ProcessMutex<T> {}

impl<T> ProcessMutex<T> {
    /// Initialize the pthread mutex in place.
    ///
    /// The data half is left as-is; callers place it in zero-filled memory
    /// where all-zero is a valid `T`.
    ///
    /// # Safety
    /// `this` must point into a writable shared mapping that outlives all
    /// processes using it, and must not already hold an initialized mutex.
    pub unsafe fn init_in_place(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let configured = check(libc::pthread_mutexattr_setpshared(
            attr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        ))
        .and_then(|_| {
            check(libc::pthread_mutexattr_setrobust(
                attr.as_mut_ptr(),
                libc::PTHREAD_MUTEX_ROBUST,
            ))
        })
        .and_then(|_| {
            check(libc::pthread_mutex_init(
                UnsafeCell::raw_get(addr_of_mut!((*this).raw)),
                attr.as_ptr(),
            ))
        });
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        configured
    }

    /// Destroy the pthread mutex.
    ///
    /// # Safety
    /// No process may use the mutex afterwards.
    pub unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.raw.get());
    }

    /// Acquire the mutex, blocking until it is available.
    ///
    /// Panics only if the pthread layer reports corruption (`EINVAL`),
    /// which means the shared mapping itself is broken.
    pub fn lock(&self) -> ProcessMutexGuard<'_, T> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        self.recover(rc, "lock");
        ProcessMutexGuard { mutex: self }
    }

    fn recover(&self, rc: libc::c_int, op: &str) {
        match rc {
            0 => {}
            libc::EOWNERDEAD => {
                warn!(op, "Previous owner of shared mutex died, recovering");
                unsafe { libc::pthread_mutex_consistent(self.raw.get()) };
            }
            other => panic!(
                "pthread mutex {} failed: {}",
                op,
                io::Error::from_raw_os_error(other)
            ),
        }
    }
}

/// RAII guard for [`ProcessMutex`]
pub struct ProcessMutexGuard<'a, T> {
    mutex: &'a ProcessMutex<T>,
}

impl<T> Deref for ProcessMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ProcessMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for ProcessMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}

/// Condition variable usable across forked processes
#[repr(C)]
pub struct ProcessCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for ProcessCondvar {}
unsafe impl Sync for ProcessCondvar {}

impl ProcessCondvar {
    /// Initialize the condvar in place, timed on `CLOCK_MONOTONIC`.
    ///
    /// # Safety
    /// Same contract as [`ProcessMutex::init_in_place`].
    pub unsafe fn init_in_place(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let configured = check(libc::pthread_condattr_setpshared(
            attr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        ))
        .and_then(|_| {
            check(libc::pthread_condattr_setclock(
                attr.as_mut_ptr(),
                libc::CLOCK_MONOTONIC,
            ))
        })
        .and_then(|_| {
            check(libc::pthread_cond_init(
                UnsafeCell::raw_get(addr_of_mut!((*this).raw)),
                attr.as_ptr(),
            ))
        });
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        configured
    }

    /// Destroy the condvar.
    ///
    /// # Safety
    /// No process may use the condvar afterwards.
    pub unsafe fn destroy(&self) {
        libc::pthread_cond_destroy(self.raw.get());
    }

    /// Block on the condvar for at most `timeout`, releasing the guard's
    /// mutex while waiting. Returns `true` if the wait timed out.
    pub fn wait_timeout<T>(&self, guard: &mut ProcessMutexGuard<'_, T>, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw.get(), &deadline)
        };
        match rc {
            libc::ETIMEDOUT => true,
            other => {
                guard.mutex.recover(other, "timedwait");
                false
            }
        }
    }

    /// Wake one waiter
    pub fn notify_one(&self) {
        unsafe {
            libc::pthread_cond_signal(self.raw.get());
        }
    }

    /// Wake every waiter
    pub fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.raw.get());
        }
    }
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
    }

    let total_nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    libc::timespec {
        tv_sec: now.tv_sec
            + timeout.as_secs() as libc::time_t
            + (total_nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (total_nanos % 1_000_000_000) as _,
    }
}
