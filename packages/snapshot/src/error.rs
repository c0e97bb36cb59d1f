//! Typed errors for the snapshot library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can tell a
//! fatal extraction failure from a recoverable resource failure.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Fatal errors of an extraction run.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Seed URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Seed URL is not http(s)
    #[error("unsupported URL scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    /// The seed document could not be loaded
    #[error("cannot load resource {url}: {source}")]
    Load {
        url: String,
        #[source]
        source: FetchError,
    },

    /// A processor or the engine stopped the run
    #[error("operation canceled: {reason}")]
    Canceled { reason: String },

    #[error("cannot replace a drop when there are more than one")]
    MultipleDrops,

    /// HTTP client construction failed
    #[error("client error: {0}")]
    Client(#[source] FetchError),
}

/// Transport-level errors of the fetch client.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Destination address matches a denied range
    #[error("ip {ip} is blocked by rule {rule}")]
    Blocked { ip: IpAddr, rule: IpNet },

    /// Host name resolution failed
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("URL has no host: {0}")]
    NoHost(String),

    /// Server answered with a non-2xx status
    #[error("invalid status code ({0})")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors of the image pipeline.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unsupported image type: {0}")]
    Unsupported(String),

    #[error("image error: {0}")]
    Codec(#[from] image::ImageError),
}

/// Errors while loading a page picture.
#[derive(Debug, Error)]
pub enum PictureError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("not an image")]
    NotAnImage,

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("transform task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("transform limiter closed")]
    Closed(#[from] tokio::sync::AcquireError),
}

/// Errors while reading a page's oEmbed resource.
#[derive(Debug, Error)]
pub enum OembedError {
    #[error("invalid oEmbed URL {0}")]
    InvalidUrl(String),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("invalid oEmbed document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors of a resource transform. They never fail an archive run.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("transform task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("transform limiter closed")]
    Closed(#[from] tokio::sync::AcquireError),
}

/// Errors of the archiver.
///
/// Only [`ArchiveError::Rewrite`] is returned from an archive run; the other
/// variants are per-resource failures reported through events.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("skipped URL")]
    SkippedUrl,

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("not an image")]
    NotAnImage,

    #[error("download limiter closed")]
    Closed(#[from] tokio::sync::AcquireError),

    #[error("cannot rewrite document: {0}")]
    Rewrite(String),
}

/// Errors while writing a bookmark archive.
#[derive(Debug, Error)]
pub enum BookmarkError {
    #[error(transparent)]
    Zip(#[from] zipfs::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: {reason}")]
    Invalid { var: String, reason: String },
}

pub type ExtractResult<T> = std::result::Result<T, ExtractError>;
pub type FetchResult<T> = std::result::Result<T, FetchError>;
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;
