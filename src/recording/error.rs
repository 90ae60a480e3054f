//! Control-plane error type. Sample-plane failures are degraded in place
//! (placeholder records, dropped samples) and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("unrecognized or malformed option: {0}")]
    BadArgument(String),

    #[error("recording output file is not specified")]
    MissingOutputFile,

    #[error("could not open recording output file {path}: {source}")]
    OutputFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("a recording is already active")]
    AlreadyRecording,

    #[error("no active recording")]
    NotRecording,
}

pub type Result<T> = std::result::Result<T, RecorderError>;
