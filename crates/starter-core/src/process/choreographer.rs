//! The process choreographer: States A (BOOT) through E (terminal) of this
//! crate's process topology, implemented as one function that forks its way
//! through STAGE1, the container-side subtree (STAGE2 plus, unless
//! `join_only`, an RPC_SERVER sibling), and returns control to MASTER (or,
//! for `join_only`, exits directly after supervising STAGE2).
//!
//! Each role's actual workload is an engine-supplied closure in [`Hooks`];
//! this module's job ends at getting each process into the right
//! privilege/namespace/fd state before calling into it.

use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd;

use crate::capabilities;
use crate::config::{NamespaceDisposition, StarterConfig};
use crate::daemon::{self, DaemonError};
use crate::fd::{self, FdTrackerError};
use crate::idmap::{self, IdMapError, ProcMapPaths};
use crate::mount::{self, MountError};
use crate::namespaces::{self, NamespaceError, NsKind};
use crate::privilege::{self, PrivilegeError};
use crate::shared_config::{EngineConfigError, SharedConfig};
use crate::sync::{self, SyncError};
use crate::syscall::syscall::create_syscall;
use crate::syscall::{Syscall, SyscallError};

/// Generous capacity for the shared mapping backing [`StarterConfig`]: the
/// engine blob's worst case is `MAX_ENGINE_CONFIG_SIZE` raw bytes, which
/// `serde_json` expands into a JSON array of decimal numbers (up to ~4
/// bytes of text per input byte).
const SHARED_CONFIG_CAPACITY: usize = crate::shared_config::MAX_ENGINE_CONFIG_SIZE * 4 + 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChoreographyError {
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    #[error(transparent)]
    IdMap(#[from] IdMapError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    FdTracker(#[from] FdTrackerError),
    #[error(transparent)]
    Fork(#[from] super::fork::ForkError),
    #[error(transparent)]
    Syscall(#[from] SyscallError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    EngineConfig(#[from] EngineConfigError),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error("stage1 exited with non-zero status {0}")]
    Stage1Failed(i32),
    #[error("not running as root and binary is not setuid; rerun with --without-suid or as root")]
    InsufficientPrivilege,
    #[error("hybrid workflow required to enter/create a user namespace without setuid")]
    HybridWorkflowRequired,
}

type Result<T> = std::result::Result<T, ChoreographyError>;

/// Engine-supplied entry points. The choreographer calls exactly one of
/// these per process, after that process's privileges/namespaces/fds are
/// in their final state, and treats its return value as the process's
/// exit code.
pub struct Hooks<'a> {
    pub stage1: Box<dyn FnOnce(&mut StarterConfig) -> i32 + 'a>,
    /// Called once master's own privileges/namespaces are final. The second
    /// argument is the pid of the instance-daemon parent still waiting in
    /// `pause()`, present only when `container.is_instance` was set; the
    /// engine should call [`crate::daemon::signal_ready`] with it once fully
    /// initialized.
    pub master: Box<dyn FnOnce(&StarterConfig, Option<unistd::Pid>) -> i32 + 'a>,
    pub rpc_server: Box<dyn FnOnce(&StarterConfig) -> i32 + 'a>,
    pub stage2: Box<dyn FnOnce(&StarterConfig) -> i32 + 'a>,
}

/// Run the full choreography starting from the calling (original) process.
/// Returns the exit code the *original* process should terminate with;
/// every other role this run produces exits on its own via its hook's
/// return value.
pub fn run(config: StarterConfig, hooks: Hooks) -> Result<i32> {
    let syscall = create_syscall();

    // The shared mapping is the one thing every forked stage can see
    // mutations to: STAGE1's namespace decisions, fd registrations, and
    // engine-blob growth are otherwise private to its own copy-on-write
    // fork and would vanish when it exits.
    let shared = SharedConfig::new(SHARED_CONFIG_CAPACITY)?;
    shared.write(&config)?;

    // --- State A: BOOT ---
    let mut config = shared.read()?;
    if config.starter.is_suid {
        privilege::drop(false)?;
    }
    let fd_snapshot = fd::snapshot()?;
    fd::repair_streams()?;

    // --- State B: STAGE1 ---
    match super::fork::fork_process_with_flags(libc::CLONE_FILES as u64)? {
        super::fork::Forked::Child => {
            syscall.set_parent_death_signal(Signal::SIGKILL)?;
            privilege::drop(true)?;
            let mut stage1_config = shared.read()?;
            tracing::debug!(pid = unistd::getpid().as_raw(), "assuming role Stage1");
            let code = (hooks.stage1)(&mut stage1_config);
            shared.write(&stage1_config)?;
            return Ok(code);
        }
        super::fork::Forked::Parent(stage1_pid) => match waitpid(stage1_pid, None)? {
            WaitStatus::Exited(_, 0) => {}
            WaitStatus::Exited(_, code) => return Err(ChoreographyError::Stage1Failed(code)),
            WaitStatus::Signaled(_, sig, _) => {
                return Err(ChoreographyError::Stage1Failed(128 + sig as i32))
            }
            _ => return Err(ChoreographyError::Stage1Failed(255)),
        },
    }

    // STAGE1 already wrote its mutations back into the shared mapping;
    // pick them up before anything else reads `config` again.
    config = shared.read()?;

    if let Some(fd) = config.starter.working_directory_fd.take() {
        unistd::fchdir(fd)?;
        unistd::close(fd)?;
    }
    fd::cleanup_after_stage1(&fd_snapshot, &config.starter.fds)?;

    // --- State C: PRE-FORK PREPARE ---
    let mut parent_to_signal: Option<unistd::Pid> = None;
    if config.container.is_instance {
        match daemon::daemonize()? {
            daemon::DaemonOutcome::ParentShouldExit(code) => return Ok(code),
            daemon::DaemonOutcome::Child(parent_pid) => parent_to_signal = Some(parent_pid),
        }
    }

    let (master_sock_parent, master_sock_child) = sync::new_socketpair()?;
    let rpc_sockets = if !config.container.namespace.join_only {
        Some(sync::new_socketpair()?)
    } else {
        None
    };

    let user_disposition = namespaces::decide(&config.container.namespace, NsKind::User);
    let mut clone_flags = CloneFlags::empty();
    match user_disposition {
        NamespaceDisposition::None => {
            if config.starter.is_suid {
                privilege::escalate(true)?;
            } else if !unistd::getuid().is_root() {
                return Err(ChoreographyError::InsufficientPrivilege);
            }
        }
        NamespaceDisposition::Enter => {
            if config.starter.is_suid && !config.starter.hybrid_workflow {
                return Err(ChoreographyError::HybridWorkflowRequired);
            }
            namespaces::apply(&config.container.namespace, NsKind::User, syscall.as_ref())?;
        }
        NamespaceDisposition::Create => {
            if config.starter.is_suid && !config.starter.hybrid_workflow {
                return Err(ChoreographyError::HybridWorkflowRequired);
            }
            if config.starter.hybrid_workflow {
                // Deferred: CLONE_NEWUSER rides the container-side clone
                // itself instead of an unshare here, so master never enters
                // the new user namespace — the entire point of "hybrid".
                clone_flags |= CloneFlags::CLONE_NEWUSER;
            } else {
                syscall.unshare(CloneFlags::CLONE_NEWUSER)?;
            }
        }
    }

    if namespaces::decide(&config.container.namespace, NsKind::Pid) == NamespaceDisposition::Create
    {
        clone_flags |= CloneFlags::CLONE_NEWPID;
    }

    // --- State D: CONTAINER-SIDE FORK ---
    match super::fork::fork_process_with_flags(clone_flags.bits() as u64)? {
        super::fork::Forked::Child => {
            unistd::close(master_sock_parent)?;
            syscall.set_parent_death_signal(Signal::SIGKILL)?;

            if config.starter.hybrid_workflow
                && matches!(user_disposition, NamespaceDisposition::Create)
            {
                fd::reopen_fuse_descriptors()?;
            }
            if matches!(user_disposition, NamespaceDisposition::Create) {
                sync::wait_event(master_sock_child)?;
            }

            let network_disposition =
                namespaces::apply(&config.container.namespace, NsKind::Network, syscall.as_ref())?;
            if config.container.namespace.bring_loopback_interface
                && matches!(network_disposition, NamespaceDisposition::Create)
            {
                namespaces::bring_up_loopback()?;
            }
            namespaces::apply(&config.container.namespace, NsKind::Uts, syscall.as_ref())?;
            namespaces::apply(&config.container.namespace, NsKind::Ipc, syscall.as_ref())?;
            namespaces::apply(&config.container.namespace, NsKind::Cgroup, syscall.as_ref())?;

            if config.starter.master_propagate_mount {
                syscall.unshare(CloneFlags::CLONE_NEWNS)?;
                mount::make_root_shared(syscall.as_ref())?;
                sync::send_event(master_sock_child)?;
                sync::wait_event(master_sock_child)?;
                syscall.unshare(CloneFlags::CLONE_NEWNS)?;
            } else {
                namespaces::apply(&config.container.namespace, NsKind::Mount, syscall.as_ref())?;
            }

            sync::send_event(master_sock_child)?;

            let code = if !config.container.namespace.join_only {
                let (rpc_parent, rpc_child) =
                    rpc_sockets.expect("rpc sockets allocated whenever join_only is false");
                match super::fork::fork_process_with_flags(libc::CLONE_FS as u64)? {
                    super::fork::Forked::Child => {
                        unistd::close(rpc_parent)?;
                        let mut rpc_priv = config.container.privileges.clone();
                        rpc_priv.capabilities = privilege::rpc_server_privileges();
                        syscall.set_parent_death_signal(Signal::SIGKILL)?;
                        privilege::apply_privileges(&rpc_priv, syscall.as_ref())?;
                        tracing::debug!(pid = unistd::getpid().as_raw(), "assuming role RpcServer");
                        std::process::exit((hooks.rpc_server)(&config));
                    }
                    super::fork::Forked::Parent(rpc_pid) => {
                        unistd::close(rpc_child)?;
                        match waitpid(rpc_pid, None)? {
                            WaitStatus::Exited(_, code) if code != 0 => {
                                tracing::warn!(code, "rpc server exited non-zero");
                            }
                            WaitStatus::Signaled(_, sig, _) => {
                                tracing::warn!(?sig, "rpc server killed by signal");
                            }
                            _ => {}
                        }
                        if config.starter.hybrid_workflow && config.starter.is_suid {
                            syscall.set_dumpable(true)?;
                        }
                    }
                }
                let mut container_priv = config.container.privileges.clone();
                if config.starter.nv_cli_caps {
                    container_priv.capabilities.bounding |= capabilities::nvidia_cli_capability_bits();
                }
                privilege::apply_privileges(&container_priv, syscall.as_ref())?;
                tracing::debug!(pid = unistd::getpid().as_raw(), "assuming role Stage2");
                (hooks.stage2)(&config)
            } else {
                let mut container_priv = config.container.privileges.clone();
                if config.starter.nv_cli_caps {
                    container_priv.capabilities.bounding |= capabilities::nvidia_cli_capability_bits();
                }
                privilege::apply_privileges(&container_priv, syscall.as_ref())?;
                tracing::debug!(pid = unistd::getpid().as_raw(), "assuming role Stage2 (join_only)");
                (hooks.stage2)(&config)
            };
            std::process::exit(code)
        }
        super::fork::Forked::Parent(container_pid) => {
            unistd::close(master_sock_child)?;
            config.container.pid = container_pid.as_raw();
            shared.write(&config)?;
            let saved_cwd = unistd::getcwd().ok();

            if matches!(user_disposition, NamespaceDisposition::Create) {
                if config.starter.hybrid_workflow {
                    idmap::write_maps_via_helpers(container_pid, &config.container.privileges)?;
                    let user_ns_path = format!("/proc/{}/ns/user", container_pid.as_raw());
                    let fd = nix::fcntl::open(
                        user_ns_path.as_str(),
                        nix::fcntl::OFlag::empty(),
                        nix::sys::stat::Mode::empty(),
                    )?;
                    syscall.set_ns(fd, CloneFlags::CLONE_NEWUSER)?;
                    unistd::close(fd)?;
                } else {
                    let paths = ProcMapPaths::default();
                    idmap::write_maps_privileged(&paths, container_pid, &config.container.privileges)?;
                }
                sync::send_event(master_sock_parent)?;
            }

            sync::wait_event(master_sock_parent)?;

            if config.starter.master_propagate_mount
                && !matches!(user_disposition, NamespaceDisposition::Enter)
            {
                let before = mount::root_identity("/")?;
                sync::wait_event(master_sock_parent)?;
                let ns_path = format!("/proc/{}/ns/mnt", container_pid.as_raw());
                let fd = nix::fcntl::open(
                    ns_path.as_str(),
                    nix::fcntl::OFlag::empty(),
                    nix::sys::stat::Mode::empty(),
                )?;
                syscall.set_ns(fd, CloneFlags::CLONE_NEWNS)?;
                unistd::close(fd)?;
                mount::verify_root_unchanged(before, "/")?;
                sync::send_event(master_sock_parent)?;
            }

            if let Some(cwd) = saved_cwd {
                let _ = unistd::chdir(&cwd);
            }

            if config.container.namespace.join_only {
                privilege::drop(true)?;
                return match waitpid(container_pid, None)? {
                    WaitStatus::Exited(_, code) => Ok(code),
                    WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
                    _ => Ok(0),
                };
            }

            let master_priv = crate::config::Privileges {
                capabilities: privilege::master_privileges(),
                ..Default::default()
            };
            privilege::apply_privileges(&master_priv, syscall.as_ref())?;
            tracing::debug!(pid = unistd::getpid().as_raw(), "assuming role Master");
            Ok((hooks.master)(&config, parent_to_signal))
        }
    }
}
