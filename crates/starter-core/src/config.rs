//! Data model shared by every stage of the choreographer.
//!
//! This mirrors the `struct starterConfig` family from the C implementation
//! this crate's namespace/privilege handling is descended from: one
//! `container` section (identity, capabilities, namespaces the container
//! process assumes), one `starter` section (bookkeeping the bootstrap itself
//! needs), and one `engine` section (the opaque blob owned by whatever
//! higher-level runtime embeds this crate).

use std::os::unix::io::RawFd;

use serde::{Deserialize, Serialize};

/// Which of the four roles a process becomes once the choreographer returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Stage1,
    Stage2,
    Master,
    RpcServer,
}

/// The outcome of the create-or-enter decision for a single namespace type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceDisposition {
    None,
    Create,
    Enter,
}

/// The five capability bitsets tracked per-process by the kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub permitted: u64,
    pub effective: u64,
    pub inheritable: u64,
    pub bounding: u64,
    pub ambient: u64,
}

/// Identity and capability state the container process assumes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Privileges {
    pub no_new_privs: bool,
    pub uid_map: String,
    pub gid_map: String,
    pub allow_setgroups: bool,
    pub newuidmap_path: Option<String>,
    pub newgidmap_path: Option<String>,
    pub target_uid: u32,
    pub target_gid: Vec<u32>,
    pub capabilities: Capabilities,
}

/// Namespace membership the container process is asked to end up with.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub flags: u32,
    pub mount_propagation: u64,
    pub join_only: bool,
    pub bring_loopback_interface: bool,
    pub network: Option<String>,
    pub mount: Option<String>,
    pub user: Option<String>,
    pub ipc: Option<String>,
    pub uts: Option<String>,
    pub cgroup: Option<String>,
    pub pid: Option<String>,
}

/// Per-run state of the container being bootstrapped.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Container {
    pub pid: i32,
    pub is_instance: bool,
    pub privileges: Privileges,
    pub namespace: NamespaceConfig,
}

/// Bookkeeping the bootstrap process itself needs, not the container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Starter {
    pub working_directory_fd: Option<RawFd>,
    pub fds: Vec<RawFd>,
    pub is_suid: bool,
    pub master_propagate_mount: bool,
    pub hybrid_workflow: bool,
    pub nv_cli_caps: bool,
}

/// The opaque, engine-owned configuration blob. This crate never parses
/// `config`; it only ferries the bytes between stages.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub size: usize,
    pub map_size: usize,
    pub config: Vec<u8>,
}

/// The full configuration shared across every forked stage via the
/// anonymous mapping allocated in [`crate::shared_config`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StarterConfig {
    pub container: Container,
    pub starter: Starter,
    pub engine: EngineConfig,
}

impl StarterConfig {
    pub fn new() -> Self {
        Self::default()
    }
}
