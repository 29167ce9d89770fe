//! Supervisor threads: one per worker slot
//!
//! A supervisor forks a worker process, waits for it and reacts to how it
//! ended. A worker killed by a signal is replaced; the jobs it had not yet
//! claimed stay in the durable queue for the replacement.

use crate::error::WorkerError;
use crate::pool::worker::{run_child, WorkerSetup};
use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use parking_lot::RwLock;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// A worker process that died on a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub slot: usize,
    pub pid: i32,
    /// Signal name, e.g. `SIGSEGV`
    pub signal: String,
    /// Job the worker was running, if any
    pub path: Option<String>,
}

/// Lifecycle events reported by supervisors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Spawned { slot: usize, pid: i32 },
    Crashed(CrashReport),
    Exited { slot: usize, pid: i32, code: i32 },
}

/// Handle to one supervisor thread
pub struct Supervisor {
    slot: usize,
    handle: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl Supervisor {
    /// Start the supervisor thread for `slot`.
    ///
    /// `fork_guard` is taken for writing around `fork()`. Threads of the
    /// parent that use SQLite hold it for reading, so no connection is
    /// mid-statement when the address space is copied.
    pub(crate) fn spawn(
        slot: usize,
        setup: Arc<WorkerSetup>,
        fork_guard: Arc<RwLock<()>>,
        events: Sender<SupervisorEvent>,
    ) -> Result<Self, WorkerError> {
        let handle = thread::Builder::new()
            .name(format!("supervisor-{}", slot))
            .spawn(move || supervise(slot, &setup, &fork_guard, &events))
            .map_err(|e| WorkerError::SpawnFailed {
                slot,
                reason: e.to_string(),
            })?;

        Ok(Self {
            slot,
            handle: Some(handle),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whether the thread has ended
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the supervisor to finish
    pub fn join(mut self) -> Result<(), WorkerError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(WorkerError::Panicked { slot: self.slot }),
            },
            None => Ok(()),
        }
    }
}

fn supervise(
    slot: usize,
    setup: &WorkerSetup,
    fork_guard: &RwLock<()>,
    events: &Sender<SupervisorEvent>,
) -> Result<(), WorkerError> {
    let region = &setup.region;

    loop {
        if region.is_stopped() {
            return Ok(());
        }

        let parent = getpid();
        let child = {
            let _guard = fork_guard.write();
            // Keep other threads from holding the stderr lock across fork
            let mut stderr = io::stderr().lock();
            let _ = stderr.flush();
            match unsafe { fork() } {
                Ok(ForkResult::Child) => run_child(slot, parent, setup),
                Ok(ForkResult::Parent { child }) => child,
                Err(e) => {
                    return Err(WorkerError::Fork {
                        slot,
                        reason: e.to_string(),
                    })
                }
            }
        };

        let pid = child.as_raw();
        region.set_pid(slot, pid);
        debug!(slot, pid, "Worker process started");
        let _ = events.send(SupervisorEvent::Spawned { slot, pid });

        match wait_for(slot, child)? {
            Ended::Exited(0) => {
                debug!(slot, pid, "Worker process exited");
                let _ = events.send(SupervisorEvent::Exited { slot, pid, code: 0 });
                return Ok(());
            }
            Ended::Exited(code) => {
                error!(slot, pid, code, "Worker process exited after a fatal error");
                region.mark_fatal();
                let _ = events.send(SupervisorEvent::Exited { slot, pid, code });
                return Err(WorkerError::Fatal { slot, code });
            }
            Ended::Signaled(signal) => {
                let owner = region.slot_of(pid).unwrap_or(slot);
                let path = region.release_crashed(owner);
                error!(
                    slot = owner,
                    pid,
                    signal = signal.as_str(),
                    path = path.as_deref().unwrap_or("<idle>"),
                    "Worker process crashed"
                );
                let _ = events.send(SupervisorEvent::Crashed(CrashReport {
                    slot: owner,
                    pid,
                    signal: signal.as_str().to_string(),
                    path,
                }));
                if !region.is_stopped() {
                    info!(slot, "Restarting worker process");
                }
            }
        }
    }
}

/// How a worker process ended
enum Ended {
    Exited(i32),
    Signaled(Signal),
}

/// Block until `child` terminates
fn wait_for(slot: usize, child: Pid) -> Result<Ended, WorkerError> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(Ended::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(Ended::Signaled(signal)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(WorkerError::Wait {
                    slot,
                    reason: e.to_string(),
                })
            }
        }
    }
}
