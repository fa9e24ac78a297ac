//! Conversion between the raw `u64` bitsets carried in [`crate::config::Capabilities`]
//! and `caps::CapsHashSet`, plus the handful of capability operations the
//! privilege primitives in [`crate::privilege`] need.
use caps::{CapSet, Capability, CapsHashSet};

use crate::config;
use crate::syscall::{Syscall, SyscallError};

/// Convert a single `caps::Capability` to its bit position, matching the
/// kernel's own numbering (`CAP_CHOWN == 0`, `CAP_SYS_ADMIN == 21`, ...).
pub trait CapabilityExt {
    fn to_bit(&self) -> u64;
}

impl CapabilityExt for Capability {
    fn to_bit(&self) -> u64 {
        1u64 << (*self as u32)
    }
}

/// Expand a raw bitset into the `CapsHashSet` the `caps` crate expects.
pub fn bits_to_set(bits: u64) -> CapsHashSet {
    caps::all()
        .into_iter()
        .filter(|c| bits & c.to_bit() != 0)
        .collect()
}

/// Collapse a `CapsHashSet` back into a raw bitset.
pub fn set_to_bits(set: &CapsHashSet) -> u64 {
    set.iter().fold(0u64, |acc, c| acc | c.to_bit())
}

/// Reset capabilities of the calling process to its own permitted set.
/// The effective set is what the kernel actually consults for checks; see
/// <https://man7.org/linux/man-pages/man7/capabilities.7.html>.
pub fn reset_effective<S: Syscall + ?Sized>(syscall: &S) -> Result<(), SyscallError> {
    tracing::debug!("reset all caps to permitted");
    let permitted = caps::read(None, CapSet::Permitted)?;
    syscall.set_capability(CapSet::Effective, &permitted)?;
    Ok(())
}

/// Drop every bounding-set capability not present in `caps`. The bounding
/// set can only shrink, one capability at a time, via `PR_CAPBSET_DROP`.
pub fn drop_bounding_to<S: Syscall + ?Sized>(
    caps: &config::Capabilities,
    syscall: &S,
) -> Result<(), SyscallError> {
    let target = bits_to_set(caps.bounding);
    tracing::debug!("dropping bounding capabilities to {:?}", target);
    syscall.set_capability(CapSet::Bounding, &target)?;
    Ok(())
}

/// Bounding-set capabilities `nvidia-container-cli` needs to configure GPU
/// devices inside the container: device node creation, ownership fixups on
/// driver files it bind-mounts in, and re-deriving file capabilities.
pub fn nvidia_cli_capability_bits() -> u64 {
    Capability::CAP_SYS_ADMIN.to_bit()
        | Capability::CAP_MKNOD.to_bit()
        | Capability::CAP_CHOWN.to_bit()
        | Capability::CAP_SETFCAP.to_bit()
}

/// Install permitted/effective/inheritable from the configured bitsets.
/// Ambient capabilities are raised separately (see [`crate::privilege::apply_privileges`])
/// since they cannot be set in bulk the way the other sets can.
pub fn set_final_capabilities<S: Syscall + ?Sized>(
    caps: &config::Capabilities,
    syscall: &S,
) -> Result<(), SyscallError> {
    syscall.set_capability(CapSet::Permitted, &bits_to_set(caps.permitted))?;
    syscall.set_capability(CapSet::Effective, &bits_to_set(caps.effective))?;
    syscall.set_capability(CapSet::Inheritable, &bits_to_set(caps.inheritable))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn test_reset_effective() {
        let test_command = TestHelperSyscall::default();
        let permitted_caps = caps::read(None, CapSet::Permitted).unwrap();
        assert!(reset_effective(&test_command).is_ok());
        let set_capability_args: Vec<_> = test_command
            .get_set_capability_args()
            .into_iter()
            .map(|(_capset, caps)| caps)
            .collect();
        assert_eq!(set_capability_args, vec![permitted_caps]);
    }

    #[test]
    fn test_bits_roundtrip() {
        let bits = Capability::CAP_SYS_ADMIN.to_bit()
            | Capability::CAP_NET_ADMIN.to_bit()
            | Capability::CAP_MKNOD.to_bit();
        let set = bits_to_set(bits);
        assert!(set.contains(&Capability::CAP_SYS_ADMIN));
        assert!(set.contains(&Capability::CAP_NET_ADMIN));
        assert!(set.contains(&Capability::CAP_MKNOD));
        assert_eq!(set_to_bits(&set), bits);
    }

    #[test]
    fn test_nvidia_cli_capability_bits_includes_mknod() {
        let bits = nvidia_cli_capability_bits();
        assert_ne!(bits & Capability::CAP_MKNOD.to_bit(), 0);
    }

    #[test]
    fn test_drop_bounding_to() {
        let test_command = TestHelperSyscall::default();
        let caps = config::Capabilities {
            bounding: Capability::CAP_SYS_ADMIN.to_bit() | Capability::CAP_IPC_LOCK.to_bit(),
            ..Default::default()
        };
        assert!(drop_bounding_to(&caps, &test_command).is_ok());
        let (cset, set) = &test_command.get_set_capability_args()[0];
        assert_eq!(format!("{cset:?}"), format!("{:?}", CapSet::Bounding));
        assert_eq!(set_to_bits(set), caps.bounding);
    }
}
