//! Contains a wrapper of syscalls for unit tests.
//! This provides a uniform interface for the rest of the crate to call
//! the privileged primitives the choreographer needs.

pub mod linux;
#[allow(clippy::module_inception)]
pub mod syscall;
pub mod test;

pub use syscall::Syscall;

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error("failed to unshare: {0}")]
    UnshareFailed(nix::errno::Errno),
    #[error("failed to setns: {0}")]
    SetNamespaceFailed(nix::errno::Errno),
    #[error("failed to set real uid to {uid}: {errno}")]
    SetResuidFailed {
        errno: nix::errno::Errno,
        uid: nix::unistd::Uid,
    },
    #[error("failed to set real gid to {gid}: {errno}")]
    SetResgidFailed {
        errno: nix::errno::Errno,
        gid: nix::unistd::Gid,
    },
    #[error("setgroups failed: {0}")]
    SetGroupsFailed(nix::errno::Errno),
    #[error("failed to set capabilities: {0}")]
    SetCapsFailed(#[from] caps::errors::CapsError),
    #[error("prctl({name}) returned {errno}")]
    PrctlFailed { name: &'static str, errno: i32 },
    #[error("mount failed")]
    MountFailed {
        mount_source: Option<std::path::PathBuf>,
        mount_target: std::path::PathBuf,
        fstype: Option<String>,
        flags: nix::mount::MsFlags,
        data: Option<String>,
        errno: nix::errno::Errno,
    },
}

pub type Result<T> = std::result::Result<T, SyscallError>;
