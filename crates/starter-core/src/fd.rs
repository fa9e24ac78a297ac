//! File-descriptor snapshot/cleanup and stream repair.
//!
//! STAGE1 runs with `CLONE_FILES` so it can transparently share descriptors
//! opened for the engine's own use; after it exits, everything it opened
//! that wasn't explicitly registered for survival must be closed so the
//! rest of the choreography doesn't inherit stray fds into the container.

use std::collections::HashSet;
use std::os::fd::RawFd;

use nix::fcntl::{self, FdFlag};
use nix::sys::stat::Mode;
use nix::unistd;

#[derive(Debug, thiserror::Error)]
pub enum FdTrackerError {
    #[error("failed to list /proc/self/fd: {0}")]
    ListFailed(#[from] procfs::ProcError),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

type Result<T> = std::result::Result<T, FdTrackerError>;

/// Snapshot every fd currently open in this process, read via `/proc/self/fd`.
/// The directory-listing fd itself is excluded since `procfs` doesn't yield it.
pub fn snapshot() -> Result<HashSet<RawFd>> {
    let me = procfs::process::Process::myself()?;
    Ok(me.fd()?.flatten().map(|fd| fd.fd).collect())
}

/// After STAGE1 exits: anything open that was already open in `before` is
/// left alone; anything in `keep_list` gets FD_CLOEXEC rather than being
/// closed; everything else is closed outright.
pub fn cleanup_after_stage1(before: &HashSet<RawFd>, keep_list: &[RawFd]) -> Result<()> {
    let after = snapshot()?;
    let keep: HashSet<RawFd> = keep_list.iter().copied().collect();
    for fd in after.difference(before) {
        if keep.contains(fd) {
            let flags = fcntl::fcntl(*fd, fcntl::FcntlArg::F_GETFD)?;
            let mut flags = FdFlag::from_bits_truncate(flags);
            flags.insert(FdFlag::FD_CLOEXEC);
            fcntl::fcntl(*fd, fcntl::FcntlArg::F_SETFD(flags))?;
        } else {
            unistd::close(*fd)?;
        }
    }
    Ok(())
}

/// Re-open any currently-open `/dev/fuse` descriptors (major 10, minor 229)
/// after entering a freshly created user namespace. A `/dev/fuse` fd opened
/// before the switch still refers to the old namespace's view of the
/// device; only a fd opened after the switch is valid inside the new one.
pub fn reopen_fuse_descriptors() -> Result<()> {
    const FUSE_MAJOR: u32 = 10;
    const FUSE_MINOR: u32 = 229;

    let me = procfs::process::Process::myself()?;
    for entry in me.fd()?.flatten() {
        let procfs::process::FDTarget::Path(path) = &entry.target else {
            continue;
        };
        let st = match nix::sys::stat::fstat(entry.fd) {
            Ok(st) => st,
            Err(_) => continue,
        };
        if libc::major(st.st_rdev) != FUSE_MAJOR || libc::minor(st.st_rdev) != FUSE_MINOR {
            continue;
        }
        let reopened = fcntl::open(path.as_path(), fcntl::OFlag::O_RDWR, Mode::empty())?;
        unistd::dup2(reopened, entry.fd)?;
        unistd::close(reopened)?;
    }
    Ok(())
}

/// dup `/dev/null` over any of stdin/stdout/stderr that are closed, so
/// later code can assume fds 0/1/2 are always valid.
pub fn repair_streams() -> Result<()> {
    for fd in 0..=2 {
        if fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFD).is_err() {
            let devnull = fcntl::open("/dev/null", fcntl::OFlag::O_RDWR, Mode::empty())?;
            if devnull != fd {
                unistd::dup2(devnull, fd)?;
                unistd::close(devnull)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_snapshot_contains_stdio() {
        let fds = snapshot().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    #[serial]
    fn test_cleanup_closes_unregistered_fd() {
        let before = snapshot().unwrap();
        let fd = fcntl::open("/dev/null", fcntl::OFlag::O_RDONLY, Mode::empty()).unwrap();
        cleanup_after_stage1(&before, &[]).unwrap();
        let result = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFD);
        assert!(result.is_err(), "fd should have been closed");
    }

    #[test]
    #[serial]
    fn test_cleanup_keeps_registered_fd_with_cloexec() {
        let before = snapshot().unwrap();
        let fd = fcntl::open("/dev/null", fcntl::OFlag::O_RDONLY, Mode::empty()).unwrap();
        cleanup_after_stage1(&before, &[fd]).unwrap();
        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        unistd::close(fd).unwrap();
    }
}
