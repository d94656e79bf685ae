//! Error types for players, sources, and the output backend.

use thiserror::Error;

/// Errors reported by the library.
///
/// Player-side errors (`Source*`) are terminal for that player only; backend
/// errors (`Backend*`) are terminal for the whole context. All variants carry
/// owned strings so an error can be stored once and cloned out of lock-free
/// probe cells.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("source read failed: {0}")]
    SourceRead(String),

    #[error("source does not support seeking")]
    SourceSeekUnsupported,

    #[error("source seek failed: {0}")]
    SourceSeek(String),

    #[error("audio backend initialization failed: {0}")]
    BackendInit(String),

    #[error("audio backend failure: {0}")]
    BackendRuntime(String),

    #[error("unsupported stream parameters: {0}")]
    FormatUnsupported(String),

    #[error("an audio context already exists in this process")]
    ContextAlreadyExists,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = Error::SourceRead("disk on fire".to_string());
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn errors_are_cloneable_and_comparable() {
        let err = Error::SourceSeekUnsupported;
        assert_eq!(err.clone(), err);
    }
}
