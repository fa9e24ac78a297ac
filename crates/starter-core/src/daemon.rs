//! Instance daemonization: fork a session leader, keep the original
//! process around just long enough to hold the controlling terminal until
//! the daemon signals it is ready, per this crate's daemonization rule.

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, Pid};

use crate::process::fork::{fork_process, ForkError, Forked};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

type Result<T> = std::result::Result<T, DaemonError>;

/// What the parent side of [`daemonize`] should do next.
pub enum DaemonOutcome {
    /// We are the session-leading child; continue running engine setup and
    /// call [`signal_ready`] with the carried pid once fully initialized.
    Child(Pid),
    /// We were the original process; it has already waited for the daemon
    /// to either signal readiness (exit 0) or die (propagated status), and
    /// should exit immediately with `code`.
    ParentShouldExit(i32),
}

extern "C" fn noop_handler(_: libc::c_int) {}

/// Fork once; the child becomes a session leader with a cleared umask.
/// The parent blocks in `pause()` until the child raises SIGUSR1 (meaning
/// fully initialized) or dies, and reports which in [`DaemonOutcome`].
pub fn daemonize() -> Result<DaemonOutcome> {
    unsafe {
        signal::signal(Signal::SIGUSR1, SigHandler::Handler(noop_handler))?;
    }
    let mut mask = signal::SigSet::empty();
    mask.add(Signal::SIGUSR1);
    mask.thread_unblock()?;

    match fork_process()? {
        Forked::Child => {
            let parent = unistd::getppid();
            unistd::setsid()?;
            unsafe {
                libc::umask(0);
            }
            Ok(DaemonOutcome::Child(parent))
        }
        Forked::Parent(child) => {
            unistd::pause();
            match waitpid(child, Some(nix::sys::wait::WaitPidFlag::WNOHANG))? {
                WaitStatus::StillAlive => Ok(DaemonOutcome::ParentShouldExit(0)),
                WaitStatus::Exited(_, status) => Ok(DaemonOutcome::ParentShouldExit(status)),
                WaitStatus::Signaled(_, sig, _) => {
                    Ok(DaemonOutcome::ParentShouldExit(128 + sig as i32))
                }
                _ => Ok(DaemonOutcome::ParentShouldExit(0)),
            }
        }
    }
}

/// Called by the daemonized child once initialization is complete, to
/// release the waiting parent.
pub fn signal_ready(parent: Pid) -> Result<()> {
    signal::kill(parent, Signal::SIGUSR1)?;
    Ok(())
}
