//! A thin, typed wrapper over `fork(2)`/`clone3(2)`.
//!
//! Unlike a short-lived worker fork that runs a closure and exits, every
//! fork in the choreographer's state machine produces a process that keeps
//! running the same Rust call stack afterwards (it eventually returns a
//! [`crate::config::Role`] to its caller rather than exiting), so this
//! wrapper does not take a closure the way a thread-spawn-like helper would.
//! `spawn_and_wait` is kept alongside it for the handful of places (the
//! instance-daemon session leader) that really do want fork-run-exit.

use std::mem;

use nix::unistd::{self, Pid};

#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    #[error("fork failed: {0}")]
    Fork(nix::Error),
    #[error("clone3 failed: {0}")]
    Clone3(std::io::Error),
}

pub enum Forked {
    Parent(Pid),
    Child,
}

/// Fork the current process. The caller matches on the result and continues
/// executing distinct logic in each branch, same call stack, no process exit.
pub fn fork_process() -> Result<Forked, ForkError> {
    fork_process_with_flags(0)
}

/// Fork via `clone3(2)` with `flags` on top of plain `fork()` (`CLONE_FILES`,
/// `CLONE_FS`, `CLONE_NEWUSER`, `CLONE_NEWPID`, ...), while still returning
/// into the same call stack in both branches. `clone_args` carries no stack
/// pointer, so the kernel copies the caller's address space copy-on-write
/// exactly as `fork()` does and resumes both tasks at the syscall return,
/// rather than invoking a trampoline the way `nix::sched::clone`'s
/// stack-and-callback form does.
pub fn fork_process_with_flags(flags: u64) -> Result<Forked, ForkError> {
    if flags == 0 {
        return match unsafe { unistd::fork() }.map_err(ForkError::Fork)? {
            unistd::ForkResult::Parent { child } => Ok(Forked::Parent(child)),
            unistd::ForkResult::Child => Ok(Forked::Child),
        };
    }

    let mut args: libc::clone_args = unsafe { mem::zeroed() };
    args.flags = flags;
    args.exit_signal = libc::SIGCHLD as u64;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut args as *mut libc::clone_args,
            mem::size_of::<libc::clone_args>(),
        )
    };
    match ret {
        -1 => Err(ForkError::Clone3(std::io::Error::last_os_error())),
        0 => Ok(Forked::Child),
        pid => Ok(Forked::Parent(Pid::from_raw(pid as i32))),
    }
}

/// Fork and run `cb` in the child, exiting with its return code (or 255 on
/// error). Used for the instance-daemon session leader, which has no role
/// to return and no further Rust call stack to continue.
pub fn spawn_and_exit<F: FnOnce() -> i32>(cb: F) -> Result<Pid, ForkError> {
    match fork_process()? {
        Forked::Parent(child) => Ok(child),
        Forked::Child => {
            let code = cb();
            std::process::exit(code);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn test_fork_process_parent_sees_child_pid() {
        match fork_process().unwrap() {
            Forked::Parent(child) => {
                match waitpid(child, None).expect("waitpid failed") {
                    WaitStatus::Exited(p, _) => assert_eq!(p, child),
                    other => panic!("unexpected wait status: {other:?}"),
                }
            }
            Forked::Child => std::process::exit(0),
        }
    }

    #[test]
    fn test_spawn_and_exit_propagates_return_code() {
        let pid = spawn_and_exit(|| 7).unwrap();
        match waitpid(pid, None).expect("waitpid failed") {
            WaitStatus::Exited(p, status) => {
                assert_eq!(p, pid);
                assert_eq!(status, 7);
            }
            other => panic!("unexpected wait status: {other:?}"),
        }
    }
}
