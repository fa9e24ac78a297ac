//! Real syscall implementation for Linux, backed by `nix`, `caps` and `prctl`.
use std::any::Any;
use std::os::fd::RawFd;
use std::path::Path;

use caps::{CapSet, CapsHashSet, Capability};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::Signal;
use nix::unistd::{self, Gid, Uid};

use super::{Syscall, SyscallError};

/// Empty structure to implement the Syscall trait for.
#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unshare(&self, flags: CloneFlags) -> super::Result<()> {
        unshare(flags).map_err(SyscallError::UnshareFailed)
    }

    fn set_ns(&self, rawfd: RawFd, nstype: CloneFlags) -> super::Result<()> {
        nix::sched::setns(rawfd, nstype).map_err(SyscallError::SetNamespaceFailed)
    }

    fn set_resuid(&self, uid: Uid) -> super::Result<()> {
        unistd::setresuid(uid, uid, uid).map_err(|errno| SyscallError::SetResuidFailed { errno, uid })
    }

    fn set_resgid(&self, gid: Gid) -> super::Result<()> {
        unistd::setresgid(gid, gid, gid).map_err(|errno| SyscallError::SetResgidFailed { errno, gid })
    }

    fn set_groups(&self, groups: &[Gid]) -> super::Result<()> {
        unistd::setgroups(groups).map_err(SyscallError::SetGroupsFailed)
    }

    /// `caps::set` cannot set capabilities in the bounding set, so the
    /// bounding set is applied one capability at a time via `capbset_drop`.
    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> super::Result<()> {
        match cset {
            CapSet::Bounding => {
                for c in caps::all().difference(value) {
                    self.capbset_drop(*c)?;
                }
            }
            _ => caps::set(None, cset, value)?,
        }
        Ok(())
    }

    fn capbset_drop(&self, cap: Capability) -> super::Result<()> {
        caps::drop(None, CapSet::Bounding, cap)?;
        Ok(())
    }

    fn capbset_read(&self, cap: Capability) -> super::Result<bool> {
        Ok(caps::has_cap(None, CapSet::Bounding, cap)?)
    }

    fn set_keep_capabilities(&self, keep: bool) -> super::Result<()> {
        prctl::set_keep_capabilities(keep).map_err(|errno| SyscallError::PrctlFailed {
            name: "PR_SET_KEEPCAPS",
            errno,
        })
    }

    fn set_no_new_privs(&self) -> super::Result<()> {
        let res = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if res != 0 {
            return Err(SyscallError::PrctlFailed {
                name: "PR_SET_NO_NEW_PRIVS",
                errno: nix::errno::Errno::last_raw(),
            });
        }
        Ok(())
    }

    fn get_no_new_privs(&self) -> super::Result<bool> {
        let res = unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
        if res < 0 {
            return Err(SyscallError::PrctlFailed {
                name: "PR_GET_NO_NEW_PRIVS",
                errno: nix::errno::Errno::last_raw(),
            });
        }
        Ok(res == 1)
    }

    fn set_dumpable(&self, dumpable: bool) -> super::Result<()> {
        prctl::set_dumpable(dumpable).map_err(|errno| SyscallError::PrctlFailed {
            name: "PR_SET_DUMPABLE",
            errno,
        })
    }

    fn set_parent_death_signal(&self, signal: Signal) -> super::Result<()> {
        let res = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal as i32, 0, 0, 0) };
        if res != 0 {
            return Err(SyscallError::PrctlFailed {
                name: "PR_SET_PDEATHSIG",
                errno: nix::errno::Errno::last_raw(),
            });
        }
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> super::Result<()> {
        mount(source, target, fstype, flags, data).map_err(|errno| SyscallError::MountFailed {
            mount_source: source.map(|p| p.to_owned()),
            mount_target: target.to_owned(),
            fstype: fstype.map(|s| s.to_owned()),
            flags,
            data: data.map(|s| s.to_owned()),
            errno,
        })
    }
}
