//! Privilege escalation/de-escalation and the `apply_privileges` sequence
//! that installs a process's final identity and capability state.
//!
//! Grounded on the `priv_escalate`/`priv_drop` pair in the C starter this
//! crate's choreography is descended from, adapted to go through the
//! `Syscall` trait instead of calling `seteuid`/`setfsuid` directly.

use caps::{CapSet, Capability};
use nix::unistd::{self, Gid, Uid};

use crate::capabilities::{bits_to_set, drop_bounding_to, set_final_capabilities};
use crate::config::{self, Privileges};
use crate::syscall::{Syscall, SyscallError};

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error(transparent)]
    Syscall(#[from] SyscallError),
    #[error("requested effective capability {0:?} is not in the permitted set")]
    EffectiveNotPermitted(Capability),
    #[error("no_new_privs was requested but the kernel did not report it set after applying")]
    NoNewPrivsNotSet,
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

type Result<T> = std::result::Result<T, PrivilegeError>;

/// Set the effective UID back to root. When `keep_fsuid` is set, the
/// filesystem UID is restored to the real UID right after, which matters
/// on root-squashed NFS mounts where root has no filesystem access.
pub fn escalate(keep_fsuid: bool) -> Result<()> {
    unistd::seteuid(Uid::from_raw(0))?;
    if keep_fsuid {
        let real = unistd::getuid();
        unsafe {
            libc::setfsuid(real.as_raw());
        }
    }
    Ok(())
}

/// Restore the effective (and, if `permanent`, saved) UID/GID to the real
/// identity. A permanent drop cannot be undone by this process again.
pub fn drop(permanent: bool) -> Result<()> {
    let real_uid = unistd::getuid();
    let real_gid = unistd::getgid();
    if permanent {
        unistd::setresuid(real_uid, real_uid, real_uid)?;
        unistd::setresgid(real_gid, real_gid, real_gid)?;
    } else {
        unistd::seteuid(real_uid)?;
        unistd::setegid(real_gid)?;
    }
    Ok(())
}

static LAST_CAP: once_cell::sync::OnceCell<u32> = once_cell::sync::OnceCell::new();

/// Probe the highest capability the running kernel knows about via
/// `PR_CAPBSET_READ`, so callers can clamp configured bitsets to it. The
/// result never changes for the lifetime of a process, so it is probed once.
fn last_cap() -> u32 {
    *LAST_CAP.get_or_init(|| {
        for cap in (0..64u32).rev() {
            let res = unsafe { libc::prctl(libc::PR_CAPBSET_READ, cap as libc::c_ulong, 0, 0, 0) };
            if res >= 0 {
                return cap;
            }
        }
        0
    })
}

fn clamp_to_last_cap(bits: u64, last: u32) -> u64 {
    if last >= 63 {
        bits
    } else {
        bits & ((1u64 << (last + 1)) - 1)
    }
}

/// The authoritative identity-and-capability installation routine. Applies,
/// in order: capability clamping, the permitted-superset check, bounding
/// drop, keep-caps, gid/groups, uid, no_new_privs, the final three
/// capability sets, and ambient raise.
pub fn apply_privileges<S: Syscall + ?Sized>(priv_: &Privileges, syscall: &S) -> Result<()> {
    let last = last_cap();
    let mut caps = priv_.capabilities.clone();
    caps.permitted = clamp_to_last_cap(caps.permitted, last);
    caps.effective = clamp_to_last_cap(caps.effective, last);
    caps.inheritable = clamp_to_last_cap(caps.inheritable, last);
    caps.bounding = clamp_to_last_cap(caps.bounding, last);
    caps.ambient = clamp_to_last_cap(caps.ambient, last);

    if caps.effective & !caps.permitted != 0 {
        let offending = bits_to_set(caps.effective & !caps.permitted)
            .into_iter()
            .next()
            .unwrap_or(Capability::CAP_SYS_ADMIN);
        return Err(PrivilegeError::EffectiveNotPermitted(offending));
    }

    drop_bounding_to(&caps, syscall)?;

    syscall.set_keep_capabilities(true)?;

    let current_uid = unistd::getuid();
    if current_uid.is_root() || priv_.allow_setgroups {
        if let Some((&primary, supplementary)) = priv_.target_gid.split_first() {
            syscall.set_resgid(Gid::from_raw(primary))?;
            if !supplementary.is_empty() {
                let groups: Vec<Gid> = supplementary.iter().map(|g| Gid::from_raw(*g)).collect();
                syscall.set_groups(&groups)?;
            }
        }
    }

    if current_uid.is_root() {
        syscall.set_resuid(Uid::from_raw(priv_.target_uid))?;
    }

    if priv_.no_new_privs {
        syscall.set_no_new_privs()?;
        if !syscall.get_no_new_privs()? {
            return Err(PrivilegeError::NoNewPrivsNotSet);
        }
    }

    set_final_capabilities(&caps, syscall)?;

    for cap in bits_to_set(caps.ambient) {
        if let Err(e) = syscall.set_capability(CapSet::Ambient, &std::iter::once(cap).collect()) {
            tracing::warn!("failed to raise ambient capability {:?}: {}", cap, e);
        }
    }

    syscall.set_keep_capabilities(false)?;
    Ok(())
}

/// Capability set the RPC server assumes: CAP_SYS_ADMIN effective, full
/// inherited permitted set, and a bounding set trimmed to just what
/// privileged mount/device operations need.
pub fn rpc_server_privileges() -> config::Capabilities {
    let effective = Capability::CAP_SYS_ADMIN.to_bit_via();
    let bounding = Capability::CAP_SYS_ADMIN.to_bit_via()
        | Capability::CAP_IPC_LOCK.to_bit_via()
        | Capability::CAP_MKNOD.to_bit_via();
    config::Capabilities {
        permitted: effective,
        effective,
        inheritable: 0,
        bounding,
        ambient: 0,
    }
}

/// Capability set master assumes: only CAP_SETUID/CAP_SETGID effective,
/// needed to install uid/gid maps and supplementary groups.
pub fn master_privileges() -> config::Capabilities {
    let effective = Capability::CAP_SETUID.to_bit_via() | Capability::CAP_SETGID.to_bit_via();
    config::Capabilities {
        permitted: effective,
        effective,
        inheritable: 0,
        bounding: effective,
        ambient: 0,
    }
}

trait ToBitVia {
    fn to_bit_via(&self) -> u64;
}

impl ToBitVia for Capability {
    fn to_bit_via(&self) -> u64 {
        use crate::capabilities::CapabilityExt;
        self.to_bit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn test_apply_privileges_rejects_effective_not_permitted() {
        let syscall = TestHelperSyscall::default();
        let priv_ = Privileges {
            capabilities: config::Capabilities {
                permitted: 0,
                effective: Capability::CAP_SYS_ADMIN.to_bit_via(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = apply_privileges(&priv_, &syscall).unwrap_err();
        assert!(matches!(err, PrivilegeError::EffectiveNotPermitted(_)));
    }

    #[test]
    fn test_apply_privileges_sets_no_new_privs() {
        let syscall = TestHelperSyscall::default();
        let priv_ = Privileges {
            no_new_privs: true,
            ..Default::default()
        };
        assert!(apply_privileges(&priv_, &syscall).is_ok());
        assert!(syscall.get_no_new_privs().unwrap());
    }

    #[test]
    fn test_rpc_server_privileges_bounding_includes_sys_admin() {
        let caps = rpc_server_privileges();
        assert_ne!(caps.bounding & Capability::CAP_SYS_ADMIN.to_bit_via(), 0);
    }
}
