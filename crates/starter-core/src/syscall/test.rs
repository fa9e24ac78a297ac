//! Recording fake of [`super::Syscall`], used so unit tests can exercise
//! privilege/namespace logic without being root or mutating real process state.
use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use caps::{CapSet, CapsHashSet, Capability};
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Uid};

use super::Syscall;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

#[derive(Default)]
struct Mock {
    values: Vec<Box<dyn Any>>,
}

#[derive(PartialEq, Eq, Hash, Copy, Clone)]
pub enum ArgName {
    Unshare,
    SetNs,
    Resuid,
    Resgid,
    Groups,
    Capability,
    CapBsetDrop,
    KeepCapabilities,
    NoNewPrivs,
    Dumpable,
    ParentDeathSignal,
    Mount,
}

impl ArgName {
    fn iterator() -> impl Iterator<Item = ArgName> {
        [
            ArgName::Unshare,
            ArgName::SetNs,
            ArgName::Resuid,
            ArgName::Resgid,
            ArgName::Groups,
            ArgName::Capability,
            ArgName::CapBsetDrop,
            ArgName::KeepCapabilities,
            ArgName::NoNewPrivs,
            ArgName::Dumpable,
            ArgName::ParentDeathSignal,
            ArgName::Mount,
        ]
        .iter()
        .copied()
    }
}

struct MockCalls {
    args: HashMap<ArgName, RefCell<Mock>>,
}

impl Default for MockCalls {
    fn default() -> Self {
        let mut m = MockCalls {
            args: HashMap::new(),
        };
        for name in ArgName::iterator() {
            m.args.insert(name, RefCell::new(Mock::default()));
        }
        m
    }
}

impl MockCalls {
    fn act(&self, name: ArgName, value: Box<dyn Any>) -> super::Result<()> {
        self.args.get(&name).unwrap().borrow_mut().values.push(value);
        Ok(())
    }

    fn fetch(&self, name: ArgName) -> Ref<Mock> {
        self.args.get(&name).unwrap().borrow()
    }

    #[allow(dead_code)]
    fn fetch_mut(&self, name: ArgName) -> RefMut<Mock> {
        self.args.get(&name).unwrap().borrow_mut()
    }
}

#[derive(Default)]
pub struct TestHelperSyscall {
    mocks: MockCalls,
    bounding: RefCell<CapsHashSet>,
    no_new_privs: RefCell<bool>,
}

impl Syscall for TestHelperSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unshare(&self, flags: CloneFlags) -> super::Result<()> {
        self.mocks.act(ArgName::Unshare, Box::new(flags))
    }

    fn set_ns(&self, rawfd: RawFd, nstype: CloneFlags) -> super::Result<()> {
        self.mocks.act(ArgName::SetNs, Box::new((rawfd, nstype)))
    }

    fn set_resuid(&self, uid: Uid) -> super::Result<()> {
        self.mocks.act(ArgName::Resuid, Box::new(uid))
    }

    fn set_resgid(&self, gid: Gid) -> super::Result<()> {
        self.mocks.act(ArgName::Resgid, Box::new(gid))
    }

    fn set_groups(&self, groups: &[Gid]) -> super::Result<()> {
        self.mocks.act(ArgName::Groups, Box::new(groups.to_vec()))
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> super::Result<()> {
        if cset == CapSet::Bounding {
            *self.bounding.borrow_mut() = value.clone();
        }
        self.mocks
            .act(ArgName::Capability, Box::new((cset, value.clone())))
    }

    fn capbset_drop(&self, cap: Capability) -> super::Result<()> {
        self.bounding.borrow_mut().remove(&cap);
        self.mocks.act(ArgName::CapBsetDrop, Box::new(cap))
    }

    fn capbset_read(&self, cap: Capability) -> super::Result<bool> {
        Ok(self.bounding.borrow().contains(&cap))
    }

    fn set_keep_capabilities(&self, keep: bool) -> super::Result<()> {
        self.mocks.act(ArgName::KeepCapabilities, Box::new(keep))
    }

    fn set_no_new_privs(&self) -> super::Result<()> {
        *self.no_new_privs.borrow_mut() = true;
        self.mocks.act(ArgName::NoNewPrivs, Box::new(()))
    }

    fn get_no_new_privs(&self) -> super::Result<bool> {
        Ok(*self.no_new_privs.borrow())
    }

    fn set_dumpable(&self, dumpable: bool) -> super::Result<()> {
        self.mocks.act(ArgName::Dumpable, Box::new(dumpable))
    }

    fn set_parent_death_signal(&self, signal: Signal) -> super::Result<()> {
        self.mocks
            .act(ArgName::ParentDeathSignal, Box::new(signal))
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> super::Result<()> {
        self.mocks.act(
            ArgName::Mount,
            Box::new(MountArgs {
                source: source.map(|p| p.to_owned()),
                target: target.to_owned(),
                fstype: fstype.map(|s| s.to_owned()),
                flags,
                data: data.map(|s| s.to_owned()),
            }),
        )
    }
}

impl TestHelperSyscall {
    pub fn get_unshare_args(&self) -> Vec<CloneFlags> {
        self.mocks
            .fetch(ArgName::Unshare)
            .values
            .iter()
            .map(|x| *x.downcast_ref::<CloneFlags>().unwrap())
            .collect()
    }

    pub fn get_setns_args(&self) -> Vec<(RawFd, CloneFlags)> {
        self.mocks
            .fetch(ArgName::SetNs)
            .values
            .iter()
            .map(|x| *x.downcast_ref::<(RawFd, CloneFlags)>().unwrap())
            .collect()
    }

    pub fn get_resuid_args(&self) -> Vec<Uid> {
        self.mocks
            .fetch(ArgName::Resuid)
            .values
            .iter()
            .map(|x| *x.downcast_ref::<Uid>().unwrap())
            .collect()
    }

    pub fn get_resgid_args(&self) -> Vec<Gid> {
        self.mocks
            .fetch(ArgName::Resgid)
            .values
            .iter()
            .map(|x| *x.downcast_ref::<Gid>().unwrap())
            .collect()
    }

    pub fn get_groups_args(&self) -> Vec<Vec<Gid>> {
        self.mocks
            .fetch(ArgName::Groups)
            .values
            .iter()
            .map(|x| x.downcast_ref::<Vec<Gid>>().unwrap().clone())
            .collect()
    }

    pub fn get_set_capability_args(&self) -> Vec<(CapSet, CapsHashSet)> {
        self.mocks
            .fetch(ArgName::Capability)
            .values
            .iter()
            .map(|x| x.downcast_ref::<(CapSet, CapsHashSet)>().unwrap().clone())
            .collect()
    }

    pub fn get_mount_args(&self) -> Vec<MountArgs> {
        self.mocks
            .fetch(ArgName::Mount)
            .values
            .iter()
            .map(|x| x.downcast_ref::<MountArgs>().unwrap().clone())
            .collect()
    }
}
