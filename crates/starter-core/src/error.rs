//! Top-level error taxonomy. Each module defines its own `thiserror` enum
//! scoped to its own failure modes; `ChoreographError` unions them so the
//! binary's `main` has a single type to print and map to an exit code.

use crate::process::choreographer::ChoreographyError;
use crate::shared_config::EngineConfigError;

/// The single error type `starter-bin`'s `main` needs to match on. Each
/// variant wraps a whole-subsystem error rather than re-exposing every leaf
/// error individually, since [`ChoreographyError`] already unions those.
#[derive(Debug, thiserror::Error)]
pub enum ChoreographError {
    #[error(transparent)]
    Choreography(#[from] ChoreographyError),
    #[error(transparent)]
    EngineConfig(#[from] EngineConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
