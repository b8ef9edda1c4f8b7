use thiserror::Error;

/// Errors surfaced by the engine's control plane.
///
/// Data-plane paths never raise these; they count failures in the relevant
/// statistics block and continue.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unknown interface: {0}")]
    UnknownInterface(String),

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("feature not available: {0}")]
    FeatureUnavailable(&'static str),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
