#![cfg_attr(coverage, feature(no_coverage))]
pub mod capabilities;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fd;
pub mod idmap;
pub mod mount;
pub mod namespaces;
pub mod privilege;
pub mod process;
pub mod shared_config;
pub mod sync;
pub mod syscall;
