//! Analyzer errors.

use hm_core::BusError;
use hm_state::StateError;
use thiserror::Error;

/// Failures that abort a whole tick. Problems with a single entry or index
/// are logged and counted in the tick report instead.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("desired state is not fresh, refusing to act")]
    DesiredStateNotFresh,

    #[error("state store: {0}")]
    Store(#[from] StateError),

    #[error("message bus: {0}")]
    Bus(#[from] BusError),

    #[error("serialization: {0}")]
    Serialize(String),
}

pub type AnalyzerResult<T> = Result<T, AnalyzerError>;
