//! Typed errors for the zip container.

use thiserror::Error;

/// Errors raised while assembling or copying archive entries.
#[derive(Debug, Error)]
pub enum ZipError {
    /// An entry (file or directory) with the same normalized name exists
    #[error("file \"{0}\" already exists")]
    AlreadyExists(String),

    /// Directory headers are created implicitly, never added
    #[error("cannot add a directory directly")]
    DirectoryEntry,

    /// The source archive has no such file entry
    #[error("file \"{0}\" does not exist")]
    NotFound(String),

    #[error("needs a zip writer to add content")]
    MissingWriter,

    #[error("needs a zip reader and zip writer to copy")]
    MissingReader,

    #[error("destination already set")]
    DestinationSet,

    #[error("source already set")]
    SourceSet,

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ZipResult<T> = std::result::Result<T, ZipError>;
