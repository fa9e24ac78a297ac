//! Namespace creation, joining, and the create-or-enter decision rule.
//!
//! The seven namespace types are applied in a fixed order so that, e.g., a
//! user namespace is always entered/created before anything that depends on
//! the resulting UID/GID mapping. Grounded on the `ORDERED_NAMESPACES`
//! static and `unshare_or_setns` pattern this crate inherited its namespace
//! handling from, adapted to the create/enter/none decision rule described
//! in this crate's own namespace section rather than trusting a spec-supplied
//! path unconditionally.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sched::CloneFlags;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::sys::stat::{self, Mode};
use nix::unistd;

use crate::config::{NamespaceConfig, NamespaceDisposition};
use crate::syscall::{Syscall, SyscallError};

pub static ORDERED_NAMESPACES: &[CloneFlags] = &[
    CloneFlags::CLONE_NEWUSER,
    CloneFlags::CLONE_NEWPID,
    CloneFlags::CLONE_NEWUTS,
    CloneFlags::CLONE_NEWIPC,
    CloneFlags::CLONE_NEWNET,
    CloneFlags::CLONE_NEWCGROUP,
    CloneFlags::CLONE_NEWNS,
];

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error(transparent)]
    Syscall(#[from] SyscallError),
    #[error("failed to open namespace path {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("failed to close namespace fd: {0}")]
    CloseFailed(nix::Error),
    #[error("namespace not supported by this kernel: {0:?}")]
    NotSupported(CloneFlags),
    #[error("namespace disabled: {0:?}")]
    Disabled(CloneFlags),
    #[error("namespace nesting depth exceeded for {0:?}")]
    NestingDepthExceeded(CloneFlags),
    #[error("namespace limit reached, see {0}")]
    LimitReached(String),
    #[error("{0:?} requires privileges, check installation")]
    RequiresPrivileges(CloneFlags),
    #[error("user namespaces not allowed, set /proc/sys/kernel/unprivileged_userns_clone to 1")]
    UnprivilegedUsernsDisabled,
    #[error("user namespaces not allowed by this kernel")]
    UnprivilegedUsernsUnsupported,
    #[error("failed to bring up loopback interface: {0}")]
    LoopbackFailed(nix::Error),
}

fn namespace_proc_name(flag: CloneFlags) -> &'static str {
    match flag {
        CloneFlags::CLONE_NEWUSER => "user",
        CloneFlags::CLONE_NEWPID => "pid",
        CloneFlags::CLONE_NEWUTS => "uts",
        CloneFlags::CLONE_NEWIPC => "ipc",
        CloneFlags::CLONE_NEWNET => "net",
        CloneFlags::CLONE_NEWCGROUP => "cgroup",
        CloneFlags::CLONE_NEWNS => "mnt",
        _ => "unknown",
    }
}

/// Translate a failed unshare/setns errno into an actionable cause, per
/// this crate's namespace error-translation table.
pub fn translate_error(flag: CloneFlags, errno: nix::errno::Errno) -> NamespaceError {
    use nix::errno::Errno;
    let name = namespace_proc_name(flag);
    match errno {
        Errno::EINVAL => {
            if std::path::Path::new(&format!("/proc/self/ns/{name}")).exists() {
                NamespaceError::Disabled(flag)
            } else {
                NamespaceError::NotSupported(flag)
            }
        }
        Errno::EUSERS => NamespaceError::NestingDepthExceeded(flag),
        Errno::ENOSPC => {
            let limit_path = format!("/proc/sys/user/max_{name}_namespaces");
            if std::path::Path::new(&limit_path).exists() {
                NamespaceError::LimitReached(limit_path)
            } else {
                NamespaceError::NestingDepthExceeded(flag)
            }
        }
        Errno::EPERM => {
            if flag == CloneFlags::CLONE_NEWUSER {
                if std::path::Path::new("/proc/sys/kernel/unprivileged_userns_clone").exists() {
                    NamespaceError::UnprivilegedUsernsDisabled
                } else {
                    NamespaceError::UnprivilegedUsernsUnsupported
                }
            } else {
                NamespaceError::RequiresPrivileges(flag)
            }
        }
        other => NamespaceError::Syscall(SyscallError::UnshareFailed(other)),
    }
}

fn get_clone_flag(kind: NsKind) -> CloneFlags {
    match kind {
        NsKind::User => CloneFlags::CLONE_NEWUSER,
        NsKind::Pid => CloneFlags::CLONE_NEWPID,
        NsKind::Uts => CloneFlags::CLONE_NEWUTS,
        NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
        NsKind::Network => CloneFlags::CLONE_NEWNET,
        NsKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        NsKind::Mount => CloneFlags::CLONE_NEWNS,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NsKind {
    User,
    Pid,
    Uts,
    Ipc,
    Network,
    Cgroup,
    Mount,
}

fn path_for(config: &NamespaceConfig, kind: NsKind) -> Option<&str> {
    match kind {
        NsKind::User => config.user.as_deref(),
        NsKind::Pid => config.pid.as_deref(),
        NsKind::Uts => config.uts.as_deref(),
        NsKind::Ipc => config.ipc.as_deref(),
        NsKind::Network => config.network.as_deref(),
        NsKind::Cgroup => config.cgroup.as_deref(),
        NsKind::Mount => config.mount.as_deref(),
    }
}

/// Compares the inode of `path` against `/proc/self/ns/<name>`. Returns
/// `Ok(true)` when they differ (join is meaningful), `Ok(false)` when they
/// are the same namespace (never enter into self), and propagates ENOENT
/// as "don't join" per this crate's namespace primitives contract.
fn differs_from_self(path: &str, kind: NsKind) -> bool {
    let self_path = format!("/proc/self/ns/{}", namespace_proc_name(get_clone_flag(kind)));
    let target = match stat::stat(path) {
        Ok(st) => st,
        Err(_) => return false,
    };
    let mine = match stat::stat(self_path.as_str()) {
        Ok(st) => st,
        Err(_) => return true,
    };
    target.st_dev != mine.st_dev || target.st_ino != mine.st_ino
}

/// The create/enter/none decision rule: a non-empty configured path that
/// resolves to a different namespace than the caller's current one means
/// Enter; otherwise honor the requested flag bit, or do nothing. Every
/// namespace-kind branch returns an explicit disposition on every path.
pub fn decide(config: &NamespaceConfig, kind: NsKind) -> NamespaceDisposition {
    if let Some(path) = path_for(config, kind) {
        if !path.is_empty() && differs_from_self(path, kind) {
            return NamespaceDisposition::Enter;
        }
    }
    if config.flags & get_clone_flag(kind).bits() as u32 != 0 {
        NamespaceDisposition::Create
    } else {
        NamespaceDisposition::None
    }
}

/// Unshare (create) or open+setns (enter) a single namespace, per the
/// dispositions [`decide`] assigns. The choreographer calls this for every
/// kind except PID: a PID namespace only takes effect for children created
/// after the switch, never for the caller itself, so it is requested as a
/// `CLONE_NEWPID` clone flag on the container-side fork instead of through
/// `apply` here.
pub fn apply<S: Syscall + ?Sized>(
    config: &NamespaceConfig,
    kind: NsKind,
    syscall: &S,
) -> Result<NamespaceDisposition, NamespaceError> {
    let disposition = decide(config, kind);
    let flag = get_clone_flag(kind);
    match disposition {
        NamespaceDisposition::None => {}
        NamespaceDisposition::Create => {
            syscall
                .unshare(flag)
                .map_err(|_| translate_error(flag, nix::errno::Errno::last()))?;
        }
        NamespaceDisposition::Enter => {
            let path = path_for(config, kind).expect("enter implies a configured path");
            let fd: RawFd = fcntl::open(path, OFlag::empty(), Mode::empty())
                .map_err(|source| NamespaceError::OpenFailed {
                    path: path.to_owned(),
                    source,
                })?;
            let res = syscall.set_ns(fd, flag);
            unistd::close(fd).map_err(NamespaceError::CloseFailed)?;
            res?;
        }
    }
    Ok(disposition)
}

/// Bring `lo` up inside the network namespace just created, via the same
/// `SIOCGIFFLAGS`/`SIOCSIFFLAGS` ioctl pair any `ifconfig lo up` goes
/// through; a freshly unshared net namespace otherwise starts with `lo`
/// administratively down.
pub fn bring_up_loopback() -> Result<(), NamespaceError> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(NamespaceError::LoopbackFailed)?;

    let mut ifreq = libc::ifreq {
        ifr_name: [
            'l' as i8, 'o' as i8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
        ifr_ifru: libc::__c_anonymous_ifr_ifru { ifru_flags: 0 },
    };

    let res = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &ifreq) };
    Errno::result(res).map_err(NamespaceError::LoopbackFailed)?;

    unsafe {
        ifreq.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    let res = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &ifreq) };
    Errno::result(res).map_err(NamespaceError::LoopbackFailed)?;

    Ok(())
}

/// Apply every namespace kind in [`ORDERED_NAMESPACES`] order, collecting
/// the disposition chosen for each.
pub fn apply_all<S: Syscall + ?Sized>(
    config: &NamespaceConfig,
    syscall: &S,
) -> Result<HashMap<CloneFlags, NamespaceDisposition>, NamespaceError> {
    let kinds = [
        NsKind::User,
        NsKind::Pid,
        NsKind::Uts,
        NsKind::Ipc,
        NsKind::Network,
        NsKind::Cgroup,
        NsKind::Mount,
    ];
    let mut result = HashMap::new();
    for flag in ORDERED_NAMESPACES {
        let kind = kinds
            .iter()
            .copied()
            .find(|k| get_clone_flag(*k) == *flag)
            .expect("ORDERED_NAMESPACES and NsKind are kept in lockstep");
        let disposition = apply(config, kind, syscall)?;
        result.insert(*flag, disposition);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_decide_create_when_flag_set_and_no_path() {
        let config = NamespaceConfig {
            flags: CloneFlags::CLONE_NEWNET.bits() as u32,
            ..Default::default()
        };
        assert_eq!(decide(&config, NsKind::Network), NamespaceDisposition::Create);
    }

    #[test]
    #[serial]
    fn test_decide_none_when_flag_unset_and_no_path() {
        let config = NamespaceConfig::default();
        assert_eq!(decide(&config, NsKind::Ipc), NamespaceDisposition::None);
        assert_eq!(decide(&config, NsKind::Uts), NamespaceDisposition::None);
        assert_eq!(decide(&config, NsKind::Cgroup), NamespaceDisposition::None);
    }

    #[test]
    #[serial]
    fn test_apply_all_unshares_requested_namespaces() {
        let syscall = TestHelperSyscall::default();
        let config = NamespaceConfig {
            flags: (CloneFlags::CLONE_NEWPID.bits() | CloneFlags::CLONE_NEWUTS.bits()) as u32,
            ..Default::default()
        };
        let result = apply_all(&config, &syscall).unwrap();
        assert_eq!(result[&CloneFlags::CLONE_NEWPID], NamespaceDisposition::Create);
        assert_eq!(result[&CloneFlags::CLONE_NEWUTS], NamespaceDisposition::Create);
        assert_eq!(result[&CloneFlags::CLONE_NEWNET], NamespaceDisposition::None);
        let mut got = syscall.get_unshare_args();
        got.sort();
        let mut want = vec![CloneFlags::CLONE_NEWPID, CloneFlags::CLONE_NEWUTS];
        want.sort();
        assert_eq!(got, want);
    }
}
