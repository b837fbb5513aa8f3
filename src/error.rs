//! Error taxonomy for the ambient harness layer.
//!
//! The engines' own contract (`spec.md` §7) is infallible: `insert`,
//! `remove` and `contains` always return a plain `bool`, internal
//! retries never surface, and out-of-memory or a precondition
//! violation (sentinel key, wrong GC class id, dropping a set that's
//! still in use) is either a process abort or undefined behavior, not
//! a `Result`. `BenchError` exists one layer up, for the things that
//! legitimately are recoverable failures at the harness boundary:
//! malformed CLI input and failure to spawn a worker or maintenance
//! thread.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid argument for `{flag}`: {reason}")]
    InvalidArgument { flag: &'static str, reason: String },

    #[error("unknown engine `{0}`")]
    UnknownEngine(String),

    #[error("failed to spawn {kind} thread: {source}")]
    ThreadSpawnFailed {
        kind: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BenchError>;
