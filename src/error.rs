//! Error types for file-level conversion
//!
//! Score-level failures (`MxError`) are wrapped unchanged; everything else
//! is about the paths the caller handed in.

use crate::converters::musicxml::musicxml_to_midi::MxError;
use std::path::PathBuf;
use thiserror::Error;

pub type ConvertResult<T> = Result<T, ConvertError>;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// Source path does not exist
    #[error("MusicXML file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Source path exists but is a directory or other non-file
    #[error("MusicXML path is not a file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Settings file unreadable or values out of range
    #[error("invalid settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Score(#[from] MxError),
}

impl ConvertError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConvertError::Io {
            path: path.into(),
            source,
        }
    }
}
