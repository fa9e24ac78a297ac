//! An interface trait so that the rest of the crate can call the handful of
//! privileged primitives it needs without worrying about whether it is
//! running as a real process or under a test harness.
use std::any::Any;
use std::os::fd::RawFd;
use std::path::Path;

use caps::{CapSet, CapsHashSet, Capability};
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Uid};

use crate::syscall::linux::LinuxSyscall;
use crate::syscall::test::TestHelperSyscall;
use crate::syscall::Result;

/// Every primitive in [`crate::privilege`], [`crate::namespace`] and
/// [`crate::idmap`] that would otherwise call `nix`/`libc`/`caps`/`prctl`
/// directly goes through this trait, so unit tests can substitute a
/// recording fake instead of mutating real process state.
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn unshare(&self, flags: CloneFlags) -> Result<()>;
    fn set_ns(&self, rawfd: RawFd, nstype: CloneFlags) -> Result<()>;
    fn set_resuid(&self, uid: Uid) -> Result<()>;
    fn set_resgid(&self, gid: Gid) -> Result<()>;
    fn set_groups(&self, groups: &[Gid]) -> Result<()>;
    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<()>;
    fn capbset_drop(&self, cap: Capability) -> Result<()>;
    fn capbset_read(&self, cap: Capability) -> Result<bool>;
    fn set_keep_capabilities(&self, keep: bool) -> Result<()>;
    fn set_no_new_privs(&self) -> Result<()>;
    fn get_no_new_privs(&self) -> Result<bool>;
    fn set_dumpable(&self, dumpable: bool) -> Result<()>;
    fn set_parent_death_signal(&self, signal: Signal) -> Result<()>;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
}

#[derive(Clone, Copy)]
pub enum SyscallType {
    Linux,
    Test,
}

impl Default for SyscallType {
    fn default() -> Self {
        if cfg!(test) {
            SyscallType::Test
        } else {
            SyscallType::Linux
        }
    }
}

impl SyscallType {
    pub fn create_syscall(&self) -> Box<dyn Syscall> {
        match self {
            SyscallType::Linux => Box::new(LinuxSyscall),
            SyscallType::Test => Box::<TestHelperSyscall>::default(),
        }
    }
}

pub fn create_syscall() -> Box<dyn Syscall> {
    SyscallType::default().create_syscall()
}
