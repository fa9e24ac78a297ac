//! UID/GID map installation for user namespaces: either a direct write to
//! `/proc/<pid>/{uid_map,gid_map,setgroups}` by a privileged master, or a
//! fallback to the external `newuidmap`/`newgidmap` helpers for the
//! unprivileged/hybrid workflow.
//!
//! Grounded on the `UserNamespaceIDMapper`/`lookup_map_binary`/
//! `write_id_mapping` trio this crate's id-mapping handling is descended
//! from, adapted to the flattened single-string map format this crate's
//! configuration carries instead of a list of structured mappings.

use std::env;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::config::Privileges;

#[derive(Debug, thiserror::Error)]
pub enum IdMapError {
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("newuidmap/newgidmap required but PATH is not set")]
    NoPathEnv,
    #[error("{0} configured path does not exist: {1:?}")]
    HelperNotInstalled(&'static str, PathBuf),
    #[error("failed to invoke {helper:?}: {source}")]
    Execute {
        helper: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{helper:?} exited with status {status}")]
    HelperFailed { helper: PathBuf, status: i32 },
}

type Result<T> = std::result::Result<T, IdMapError>;

/// Dependency-injectable base path so tests can point mapping writes at a
/// temporary directory instead of the real `/proc`.
#[derive(Debug, Clone)]
pub struct ProcMapPaths {
    base: PathBuf,
}

impl Default for ProcMapPaths {
    fn default() -> Self {
        Self {
            base: PathBuf::from("/proc"),
        }
    }
}

impl ProcMapPaths {
    #[cfg(test)]
    pub fn new_test(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn uid_map(&self, pid: Pid) -> PathBuf {
        self.base.join(pid.to_string()).join("uid_map")
    }

    pub fn gid_map(&self, pid: Pid) -> PathBuf {
        self.base.join(pid.to_string()).join("gid_map")
    }

    pub fn setgroups(&self, pid: Pid) -> PathBuf {
        self.base.join(pid.to_string()).join("setgroups")
    }
}

/// Direct write path, used when master still holds CAP_SETUID/CAP_SETGID.
/// `setgroups` must be written before `gid_map` or the kernel refuses the
/// gid_map write for an unprivileged target.
pub fn write_maps_privileged(
    paths: &ProcMapPaths,
    pid: Pid,
    priv_: &Privileges,
) -> Result<()> {
    let setgroups_path = paths.setgroups(pid);
    let value = if priv_.allow_setgroups { "allow" } else { "deny" };
    std::fs::write(&setgroups_path, value).map_err(|source| IdMapError::Write {
        path: setgroups_path,
        source,
    })?;

    let gid_path = paths.gid_map(pid);
    std::fs::write(&gid_path, &priv_.gid_map).map_err(|source| IdMapError::Write {
        path: gid_path,
        source,
    })?;

    let uid_path = paths.uid_map(pid);
    std::fs::write(&uid_path, &priv_.uid_map).map_err(|source| IdMapError::Write {
        path: uid_path,
        source,
    })?;

    Ok(())
}

/// Flatten a map's embedded newlines into spaces, since `newuidmap`/
/// `newgidmap` take the whole mapping as positional arguments rather than
/// a multi-line file.
fn flatten(map: &str) -> String {
    map.trim().replace('\n', " ")
}

fn resolve_helper(configured: &Option<String>, name: &'static str) -> Result<PathBuf> {
    let path = configured
        .as_ref()
        .map(PathBuf::from)
        .ok_or(IdMapError::NoPathEnv)?;
    if !path.exists() {
        return Err(IdMapError::HelperNotInstalled(name, path));
    }
    Ok(path)
}

#[allow(dead_code)]
fn lookup_on_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var("PATH").ok()?;
    paths
        .split_terminator(':')
        .map(|p| Path::new(p).join(binary))
        .find(|p| p.exists())
}

/// External-helper path, used by the unprivileged/hybrid workflow. Invokes
/// `newgidmap` before `newuidmap`, matching the kernel's requirement that
/// gid mappings exist (or setgroups be denied) before uid mappings widen
/// the process's privilege.
pub fn write_maps_via_helpers(pid: Pid, priv_: &Privileges) -> Result<()> {
    let newgidmap = resolve_helper(&priv_.newgidmap_path, "newgidmap")?;
    let newuidmap = resolve_helper(&priv_.newuidmap_path, "newuidmap")?;

    run_helper(&newgidmap, pid, &flatten(&priv_.gid_map))?;
    run_helper(&newuidmap, pid, &flatten(&priv_.uid_map))?;
    Ok(())
}

fn run_helper(helper: &Path, pid: Pid, flattened_map: &str) -> Result<()> {
    let output = std::process::Command::new(helper)
        .arg(pid.to_string())
        .args(flattened_map.split(' ').filter(|s| !s.is_empty()))
        .output()
        .map_err(|source| IdMapError::Execute {
            helper: helper.to_owned(),
            source,
        })?;
    if !output.status.success() {
        return Err(IdMapError::HelperFailed {
            helper: helper.to_owned(),
            status: output.status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_flatten_replaces_newlines_with_spaces() {
        assert_eq!(flatten("0 1000 1\n1 100000 65536\n"), "0 1000 1 1 100000 65536");
    }

    #[test]
    fn test_write_maps_privileged_writes_setgroups_before_gid_map() {
        let tmp = tempfile::tempdir().unwrap();
        let pid = getpid();
        let paths = ProcMapPaths::new_test(tmp.path().to_path_buf());
        std::fs::create_dir_all(tmp.path().join(pid.to_string())).unwrap();

        let priv_ = Privileges {
            uid_map: "1000 1000 1\n".into(),
            gid_map: "1000 1000 1\n".into(),
            allow_setgroups: false,
            ..Default::default()
        };
        write_maps_privileged(&paths, pid, &priv_).unwrap();

        assert_eq!(std::fs::read_to_string(paths.setgroups(pid)).unwrap(), "deny");
        assert_eq!(std::fs::read_to_string(paths.uid_map(pid)).unwrap(), "1000 1000 1\n");
        assert_eq!(std::fs::read_to_string(paths.gid_map(pid)).unwrap(), "1000 1000 1\n");
    }

    #[test]
    fn test_write_maps_via_helpers_rejects_missing_binary() {
        let priv_ = Privileges {
            newuidmap_path: Some("/does/not/exist/newuidmap".into()),
            newgidmap_path: Some("/does/not/exist/newgidmap".into()),
            ..Default::default()
        };
        let err = write_maps_via_helpers(getpid(), &priv_).unwrap_err();
        assert!(matches!(err, IdMapError::HelperNotInstalled(_, _)));
    }
}
