//! The stop scope: freeze the target for the duration of inspection and
//! guarantee resumption on every exit path.
//!
//! For a live target, entry seizes and interrupts each kernel thread (with
//! a plain-attach fallback) and waits for it to stop, re-scanning /proc
//! until the thread set converges (threads can be spawned while we're
//! attaching). Drop detaches everything; if this process
//! dies mid-scope the kernel detaches for us when the tracer exits. Core
//! targets are already frozen, so entry and exit are no-ops there.

use std::collections::BTreeSet;
use std::io;

use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd;

use crate::core::process::{getregs, Process, TargetKind};
use crate::core::types::{Pid, ProcError};

pub struct StopScope {
    frozen: Vec<Pid>,
}

impl StopScope {
    /// Freeze `proc` and snapshot each thread's registers into its lwp map.
    pub fn new(proc: &mut Process) -> Result<StopScope, ProcError> {
        if proc.kind == TargetKind::Core {
            return Ok(StopScope { frozen: Vec::new() });
        }
        let pid = match proc.pid {
            Some(pid) => pid,
            None => return Err(ProcError::NoSuchProcess(0)),
        };

        let mut scope = StopScope { frozen: Vec::new() };
        let mut seen = BTreeSet::new();

        // New threads may appear while we stop the existing ones; loop a few
        // times until the set converges.
        for _ in 0..5 {
            let before = seen.len();
            for tid in proc.task_tids()? {
                if !seen.insert(tid) {
                    continue;
                }
                match freeze_thread(tid) {
                    Ok(()) => scope.frozen.push(tid),
                    Err(e) if e.raw_os_error() == Some(Errno::ESRCH as i32) => {
                        // The thread exited while we were attaching.
                        debug!("lwp {} went away during attach", tid);
                    }
                    Err(e) => warn!("couldn't stop lwp {}: {}", tid, e),
                }
            }
            if seen.len() == before {
                break;
            }
        }

        if scope.frozen.is_empty() {
            return Err(ProcError::StopFailed(pid));
        }

        proc.lwps.clear();
        for &tid in &scope.frozen {
            match getregs(tid) {
                Ok(regs) => {
                    proc.lwps.insert(tid, regs);
                }
                Err(e) => warn!("couldn't read registers of stopped lwp {}: {}", tid, e),
            }
        }
        Ok(scope)
    }
}

impl Drop for StopScope {
    fn drop(&mut self) {
        for &tid in &self.frozen {
            if let Err(e) = ptrace::detach(unistd::Pid::from_raw(tid), None) {
                if e != Errno::ESRCH {
                    // A thread we can't resume may stay stopped; be loud.
                    error!("failed to resume lwp {}: {}", tid, e);
                }
            }
        }
    }
}

fn freeze_thread(tid: Pid) -> io::Result<()> {
    let pid = unistd::Pid::from_raw(tid);
    match ptrace::seize(pid, ptrace::Options::empty()) {
        Ok(()) => {
            ptrace::interrupt(pid).map_err(io_err)?;
            loop {
                match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::PtraceEvent(..)) => return Ok(()),
                    Ok(status) => return Err(unexpected_status(status)),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(io_err(e)),
                }
            }
        }
        // Seize is refused wholesale on some kernels; fall back to the
        // classic attach.
        Err(Errno::ESRCH) => attach_thread(pid),
        Err(e) => Err(io_err(e)),
    }
}

/// PTRACE_ATTACH stops the thread with a SIGSTOP; any other signal arriving
/// first has to be re-injected while we keep waiting for ours.
fn attach_thread(pid: unistd::Pid) -> io::Result<()> {
    ptrace::attach(pid).map_err(io_err)?;
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(()),
            Ok(WaitStatus::Stopped(_, sig)) => ptrace::cont(pid, sig).map_err(io_err)?,
            Ok(status) => return Err(unexpected_status(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io_err(e)),
        }
    }
}

fn io_err(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn unexpected_status(status: WaitStatus) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("unexpected wait status {:?}", status),
    )
}
