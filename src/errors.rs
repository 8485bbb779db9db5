//! Crate-wide error taxonomy, grouped the way spec §7 describes the kinds
//! of failure the system can encounter.

use thiserror::Error;

/// Errors that can surface out of configuration loading, dispatch, and
/// decode. Backend preemption, duplicate replies, and trace exhaustion are
/// handled as internal control flow rather than `Result` errors — they are
/// never client-visible on their own.
#[derive(Debug, Error)]
pub enum InferflowError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("transport error on backend {backend}: {source}")]
    Transport {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stripe {sid} could not be reconstructed: {reason}")]
    DecodeFailure { sid: u64, reason: String },

    #[error("dispatcher found no eligible backend for {class:?} query after widening the pool")]
    DispatcherStarvation { class: crate::message::EncodeClass },
}

pub type Result<T> = std::result::Result<T, InferflowError>;
