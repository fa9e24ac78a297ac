//! The process choreographer: fork-based state machine that transitions
//! a single invocation through STAGE1, MASTER, RPC_SERVER and STAGE2.

pub mod choreographer;
pub mod fork;
