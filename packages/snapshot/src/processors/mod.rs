//! Built-in processors.
//!
//! Each processor handles one concern at one [`Step`](crate::extract::Step)
//! and lets every other step through. [`bookmark_processors`] is the chain
//! used to save a page.

pub mod links;
pub mod meta;
pub mod oembed;
pub mod original;
pub mod picture;
pub mod text;

pub use links::{ExtractLinks, FetchLinks, Link, Links};
pub use meta::{read_meta, ExtractMeta, PageMeta};
pub use oembed::ExtractOembed;
pub use original::{OriginalLink, ORIGINAL_URL_HEADER};
pub use picture::ExtractPicture;
pub use text::{html_text, ExtractText};

use crate::extract::Processor;

/// Processors of a bookmark extraction, in order.
pub fn bookmark_processors() -> Vec<Box<dyn Processor>> {
    vec![
        Box::new(OriginalLink),
        Box::new(ExtractMeta),
        Box::new(ExtractOembed),
        Box::new(ExtractPicture),
        Box::new(ExtractLinks),
        Box::new(ExtractText),
        Box::new(FetchLinks::default()),
    ]
}
