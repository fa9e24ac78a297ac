//! Mount-namespace shared-propagation handshake and the weak-chroot/
//! initrd-chroot safeguard described in this crate's mount rules.

use std::path::Path;

use nix::mount::MsFlags;
use nix::sys::stat::stat;

use crate::syscall::{Syscall, SyscallError};

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error(transparent)]
    Syscall(#[from] SyscallError),
    #[error("failed to stat {path}: {source}")]
    StatFailed {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error(
        "refusing to join container mount namespace: host root filesystem identity changed \
         across the join (weak chroot or initrd chroot); container process was not reached"
    )]
    WeakChroot,
}

type Result<T> = std::result::Result<T, MountError>;

/// Mark "/" `MS_SHARED|MS_REC` so mounts performed by one side of the
/// handshake become visible to the other.
pub fn make_root_shared<S: Syscall + ?Sized>(syscall: &S) -> Result<()> {
    syscall.mount(
        None,
        Path::new("/"),
        None,
        MsFlags::MS_SHARED | MsFlags::MS_REC,
        None,
    )?;
    Ok(())
}

/// `(dev, ino)` identity of a path, used to detect whether "/" changed
/// across a namespace join. Callers that need to compare a path's identity
/// before and after some intervening operation must capture this value
/// *before* that operation runs, since the comparison is only meaningful if
/// the "before" stat genuinely predates it.
pub fn root_identity(path: &str) -> Result<(u64, u64)> {
    let st = stat(path).map_err(|source| MountError::StatFailed {
        path: path.to_owned(),
        source,
    })?;
    Ok((st.st_dev, st.st_ino))
}

/// Compare a previously captured "/" identity against its current identity,
/// after master joins the container's shared mount namespace. A mismatch
/// means the host process itself is running under a weak chroot or an
/// initrd chroot it never left, and proceeding would let mount operations
/// leak outside the real host root; this is a refusal, not a retry.
pub fn verify_root_unchanged(before: (u64, u64), after_path: &str) -> Result<()> {
    if before != root_identity(after_path)? {
        return Err(MountError::WeakChroot);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn test_make_root_shared_issues_expected_mount() {
        let syscall = TestHelperSyscall::default();
        make_root_shared(&syscall).unwrap();
        let args = syscall.get_mount_args();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].target, Path::new("/"));
        assert!(args[0].flags.contains(MsFlags::MS_SHARED));
        assert!(args[0].flags.contains(MsFlags::MS_REC));
    }

    #[test]
    fn test_verify_root_unchanged_same_path_is_ok() {
        let before = root_identity("/").unwrap();
        assert!(verify_root_unchanged(before, "/").is_ok());
    }

    #[test]
    fn test_verify_root_unchanged_detects_mismatch() {
        let before = root_identity("/").unwrap();
        let err = verify_root_unchanged(before, "/proc").unwrap_err();
        assert!(matches!(err, MountError::WeakChroot));
    }
}
