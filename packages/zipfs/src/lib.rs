//! Zip Container Writer
//!
//! Assembles zip archives entry by entry with the guarantees an archive of a
//! saved page relies on:
//!
//! - no two entries share a normalized name
//! - parent directories are created implicitly, once, before their first file
//! - a directory name can never be reused as a file name (and vice versa)
//! - entries can be copied raw (without recompression) from a source archive
//!
//! # Usage
//!
//! ```rust,ignore
//! use zipfs::{FileHeader, ZipRw};
//!
//! let mut zip = ZipRw::create("bookmark.zip")?;
//! zip.add(FileHeader::new("img/image.jpg"), &jpeg[..])?;
//! zip.add(FileHeader::new("index.html").deflated(), html.as_bytes())?;
//! zip.close()?;
//! ```

pub mod error;
pub mod path;

use std::fs::File;
use std::io::{Read, Seek, Write};

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub use error::{ZipError, ZipResult};

/// Compression method of a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Store,
    /// Deflate at the fastest level
    Deflate,
}

/// Header of a file entry to add.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub name: String,
    pub method: Method,
    /// Modification time, now when unset
    pub modified: Option<DateTime<Utc>>,
}

impl FileHeader {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: Method::Store,
            modified: None,
        }
    }

    pub fn deflated(mut self) -> Self {
        self.method = Method::Deflate;
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }
}

/// A zip writer paired with an optional source archive.
///
/// Every name passing through [`ZipRw::add`] or [`ZipRw::copy`] is cleaned
/// first, so `"img//a.png"` and `"img/./a.png"` are the same entry.
pub struct ZipRw<W: Write + Seek = File, R: Read + Seek = File> {
    writer: Option<ZipWriter<W>>,
    reader: Option<ZipArchive<R>>,
    entries: Vec<String>,
}

impl<W: Write + Seek, R: Read + Seek> Default for ZipRw<W, R> {
    fn default() -> Self {
        Self {
            writer: None,
            reader: None,
            entries: Vec::new(),
        }
    }
}

impl ZipRw<File, File> {
    /// Creates (or truncates) the archive file at `path`.
    pub fn create(path: impl AsRef<std::path::Path>) -> ZipResult<Self> {
        let mut zip = Self::default();
        zip.add_dest_file(path)?;
        Ok(zip)
    }
}

impl<R: Read + Seek> ZipRw<File, R> {
    /// Sets a file as the destination archive.
    pub fn add_dest_file(&mut self, path: impl AsRef<std::path::Path>) -> ZipResult<()> {
        if self.writer.is_some() {
            return Err(ZipError::DestinationSet);
        }
        let file = File::create(path)?;
        self.writer = Some(ZipWriter::new(file));
        Ok(())
    }
}

impl<W: Write + Seek> ZipRw<W, File> {
    /// Sets a file as the source archive for [`ZipRw::copy`].
    pub fn add_source_file(&mut self, path: impl AsRef<std::path::Path>) -> ZipResult<()> {
        if self.reader.is_some() {
            return Err(ZipError::SourceSet);
        }
        let file = File::open(path)?;
        self.reader = Some(ZipArchive::new(file)?);
        Ok(())
    }
}

impl<W: Write + Seek, R: Read + Seek> ZipRw<W, R> {
    /// Wraps an optional destination and an optional source.
    ///
    /// The source, when given, must already be a readable zip archive.
    pub fn new(dst: Option<W>, src: Option<R>) -> ZipResult<Self> {
        let reader = match src {
            Some(src) => Some(ZipArchive::new(src)?),
            None => None,
        };
        Ok(Self {
            writer: dst.map(ZipWriter::new),
            reader,
            entries: Vec::new(),
        })
    }

    /// Names written so far, directories with a trailing slash.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// File (non-directory) entries of the source archive.
    pub fn src_files(&self) -> Vec<String> {
        match &self.reader {
            Some(reader) => reader
                .file_names()
                .filter(|name| !name.ends_with('/'))
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Adds a file entry with the content of `content`.
    pub fn add(&mut self, header: FileHeader, mut content: impl Read) -> ZipResult<()> {
        if header.name.ends_with('/') {
            return Err(ZipError::DirectoryEntry);
        }

        let name = path::clean(&header.name);
        if self.has_entry(&name) {
            return Err(ZipError::AlreadyExists(name));
        }
        if self.writer.is_none() {
            return Err(ZipError::MissingWriter);
        }

        self.make_dirs(&name, header.modified)?;

        let writer = self.writer.as_mut().ok_or(ZipError::MissingWriter)?;
        writer.start_file(name.clone(), file_options(header.method, header.modified))?;
        std::io::copy(&mut content, writer)?;

        debug!(entry = %name, "zip entry added");
        self.entries.push(name);
        Ok(())
    }

    /// Copies a file entry from the source archive without recompressing it.
    pub fn copy(&mut self, name: &str) -> ZipResult<()> {
        if self.reader.is_none() || self.writer.is_none() {
            return Err(ZipError::MissingReader);
        }

        let name = path::clean(name);
        if self.has_entry(&name) {
            return Err(ZipError::AlreadyExists(name));
        }

        let index = self
            .reader
            .as_ref()
            .and_then(|r| r.index_for_name(&name))
            .ok_or_else(|| ZipError::NotFound(name.clone()))?;

        self.make_dirs(&name, None)?;

        let reader = self.reader.as_mut().ok_or(ZipError::MissingReader)?;
        let writer = self.writer.as_mut().ok_or(ZipError::MissingWriter)?;
        let file = reader.by_index_raw(index)?;
        writer.raw_copy_file(file)?;

        debug!(entry = %name, "zip entry copied");
        self.entries.push(name);
        Ok(())
    }

    /// Finalizes the archive and hands back the destination, if any.
    ///
    /// The source is dropped (and thus closed) here as well.
    pub fn close(mut self) -> ZipResult<Option<W>> {
        self.reader.take();
        match self.writer.take() {
            Some(writer) => {
                let mut inner = writer.finish()?;
                inner.flush()?;
                Ok(Some(inner))
            }
            None => Ok(None),
        }
    }

    fn has_entry(&self, name: &str) -> bool {
        let dir = format!("{name}/");
        self.entries.iter().any(|e| e == name || *e == dir)
    }

    /// Creates missing ancestor directories of `name`, outermost first.
    fn make_dirs(&mut self, name: &str, modified: Option<DateTime<Utc>>) -> ZipResult<()> {
        for dir in path::ancestors(name) {
            if self.entries.iter().any(|e| *e == dir) {
                return Err(ZipError::AlreadyExists(dir));
            }

            let entry = format!("{dir}/");
            if self.entries.contains(&entry) {
                continue;
            }

            let writer = self.writer.as_mut().ok_or(ZipError::MissingWriter)?;
            writer.add_directory(entry.clone(), file_options(Method::Store, modified))?;
            self.entries.push(entry);
        }
        Ok(())
    }
}

fn file_options(method: Method, modified: Option<DateTime<Utc>>) -> SimpleFileOptions {
    let options = match method {
        Method::Store => SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
        Method::Deflate => SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(1)),
    };

    match zip_datetime(modified.unwrap_or_else(Utc::now)) {
        Some(dt) => options.last_modified_time(dt),
        None => options,
    }
}

/// Zip timestamps cannot represent years before 1980.
fn zip_datetime(t: DateTime<Utc>) -> Option<zip::DateTime> {
    zip::DateTime::from_date_and_time(
        u16::try_from(t.year()).ok()?,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    )
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    type MemZip = ZipRw<Cursor<Vec<u8>>, Cursor<Vec<u8>>>;

    fn writer() -> MemZip {
        ZipRw::new(Some(Cursor::new(Vec::new())), None).unwrap()
    }

    #[test]
    fn test_creates_directories_once() {
        let mut zip = writer();
        zip.add(FileHeader::new("img/a/1.png"), &b"1"[..]).unwrap();
        zip.add(FileHeader::new("img/a/2.png"), &b"2"[..]).unwrap();
        zip.add(FileHeader::new("img/b.png"), &b"3"[..]).unwrap();

        assert_eq!(
            zip.entries(),
            &["img/", "img/a/", "img/a/1.png", "img/a/2.png", "img/b.png"]
        );
    }

    #[test]
    fn test_rejects_directory_header() {
        let mut zip = writer();
        let err = zip.add(FileHeader::new("img/"), &b""[..]).unwrap_err();
        assert!(matches!(err, ZipError::DirectoryEntry));
    }

    #[test]
    fn test_rejects_duplicate_after_clean() {
        let mut zip = writer();
        zip.add(FileHeader::new("img/a.png"), &b"first"[..]).unwrap();

        let err = zip
            .add(FileHeader::new("img/./a.png"), &b"second"[..])
            .unwrap_err();
        assert!(matches!(err, ZipError::AlreadyExists(ref n) if n == "img/a.png"));
    }

    #[test]
    fn test_rejects_file_over_directory() {
        let mut zip = writer();
        zip.add(FileHeader::new("img/a.png"), &b"x"[..]).unwrap();

        let err = zip.add(FileHeader::new("img"), &b"x"[..]).unwrap_err();
        assert!(matches!(err, ZipError::AlreadyExists(ref n) if n == "img"));
    }

    #[test]
    fn test_rejects_directory_over_file() {
        let mut zip = writer();
        zip.add(FileHeader::new("log"), &b"x"[..]).unwrap();

        let err = zip.add(FileHeader::new("log/a.txt"), &b"x"[..]).unwrap_err();
        assert!(matches!(err, ZipError::AlreadyExists(ref n) if n == "log"));
    }

    #[test]
    fn test_add_needs_writer() {
        let mut zip: MemZip = ZipRw::default();
        let err = zip.add(FileHeader::new("a.txt"), &b"x"[..]).unwrap_err();
        assert!(matches!(err, ZipError::MissingWriter));
    }

    #[test]
    fn test_copy_needs_reader() {
        let mut zip = writer();
        let err = zip.copy("a.txt").unwrap_err();
        assert!(matches!(err, ZipError::MissingReader));
    }

    #[test]
    fn test_zip_datetime_range() {
        let old = DateTime::parse_from_rfc3339("1970-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(zip_datetime(old).is_none());
        assert!(zip_datetime(Utc::now()).is_some());
    }
}
