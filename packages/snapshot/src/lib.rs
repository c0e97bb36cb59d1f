//! Page Snapshot Library
//!
//! Saves a web page as a self-contained bookmark: its metadata, readable
//! text, lead picture, outgoing links and an HTML document whose images are
//! stored next to it, all packed in one zip archive.
//!
//! # Usage
//!
//! ```rust,ignore
//! use snapshot::{extract_page, Config, ExtractParams};
//!
//! let config = Config::from_env()?;
//! let bookmark = extract_page(&config, ExtractParams {
//!     url: "https://example.net/article".into(),
//!     ..Default::default()
//! })
//! .await;
//! println!("{} ({:?})", bookmark.title, bookmark.state);
//! ```
//!
//! # Modules
//!
//! - [`extract`] - Extraction engine (drops, steps, processors, fetch client)
//! - [`processors`] - Built-in processors of the bookmark chain
//! - [`archiver`] - Resource archiver and document rewriting
//! - [`bookmark`] - Bookmark records and resource naming
//! - [`task`] - The page saving task and archive layout
//! - [`img`] - Image decoding, fitting and re-encoding
//! - [`config`] - Environment configuration
//! - [`testing`] - Fixtures for tests

pub mod archiver;
pub mod bookmark;
pub mod config;
pub mod error;
pub mod extract;
pub mod img;
pub mod processors;
pub mod task;
pub mod testing;

// Re-export core types at crate root
pub use archiver::{ArchiveFlags, Archiver, Event};
pub use bookmark::{Bookmark, BookmarkFile, BookmarkState};
pub use config::Config;
pub use error::{ArchiveError, BookmarkError, ConfigError, ExtractError, FetchError};
pub use extract::{Extractor, ExtractorOptions, Flow, ProcessMessage, Processor, Step};
pub use task::{extract_page, ExtractParams, Resource};
