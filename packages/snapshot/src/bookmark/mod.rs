//! Bookmark records and their archive files.

pub mod archive;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::extract::Extractor;
use crate::processors::{Link, Links};

pub use archive::{new_archive, url_filename, ImageTransform, RESOURCE_DIR_NAME};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkState {
    #[default]
    Loading,
    Loaded,
    Error,
}

/// A file of the bookmark archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkFile {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<[u32; 2]>,
}

impl BookmarkFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A saved page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub uid: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub state: BookmarkState,
    pub url: String,
    pub title: String,
    pub domain: String,
    pub site: String,
    pub site_name: String,
    pub published: Option<DateTime<Utc>>,
    pub authors: Vec<String>,
    pub lang: String,
    pub text_direction: String,
    pub document_type: String,
    pub description: String,
    pub text: String,
    pub word_count: usize,
    /// Media duration in seconds
    pub duration: Option<u32>,
    pub embed: String,
    /// Archive path relative to the data directory, without extension
    pub file_path: String,
    pub files: BTreeMap<String, BookmarkFile>,
    pub errors: Vec<String>,
    pub links: Vec<Link>,
}

impl Bookmark {
    pub fn new(url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uid: bs58::encode(Uuid::new_v4().as_bytes()).into_string(),
            created: now,
            updated: now,
            state: BookmarkState::Loading,
            url: url.into(),
            title: String::new(),
            domain: String::new(),
            site: String::new(),
            site_name: String::new(),
            published: None,
            authors: Vec::new(),
            lang: String::new(),
            text_direction: String::new(),
            document_type: String::new(),
            description: String::new(),
            text: String::new(),
            word_count: 0,
            duration: None,
            embed: String::new(),
            file_path: String::new(),
            files: BTreeMap::new(),
            errors: Vec::new(),
            links: Vec::new(),
        }
    }

    /// `<first two uid characters>/<uid>`
    pub fn base_file_path(&self) -> String {
        let prefix = self.uid.get(..2).unwrap_or(&self.uid);
        format!("{prefix}/{}", self.uid)
    }

    /// Absolute location of the archive, once written.
    pub fn zip_path(&self, data_dir: &Path) -> Option<PathBuf> {
        if self.file_path.is_empty() {
            return None;
        }
        Some(data_dir.join(format!("{}.zip", self.file_path)))
    }

    /// Copies the results of a successful run and marks the bookmark loaded.
    ///
    /// Errors recorded so far by the run are copied too.
    pub fn update_from(&mut self, ex: &Extractor) {
        let drop = ex.first_drop();

        self.updated = Utc::now();
        self.state = BookmarkState::Loaded;
        self.url = drop.unescaped_url();
        self.domain = drop.domain.clone();
        self.site = if drop.site.is_empty() {
            drop.url.host_str().unwrap_or_default().to_string()
        } else {
            drop.site.clone()
        };
        self.site_name = if drop.site_name.is_empty() {
            self.site.clone()
        } else {
            drop.site_name.clone()
        };
        self.authors = drop.authors.clone();
        self.lang = drop.lang.clone();
        self.text_direction = drop.text_direction.clone();
        self.document_type = drop.document_type.clone();
        self.description = drop.description.clone();
        self.text = ex.text.clone();
        self.word_count = self.text.split_whitespace().count();
        self.published = drop.date;

        if self.title.is_empty() {
            self.title = drop.title.clone();
        }
        if drop.is_media() {
            self.embed = drop
                .meta
                .lookup_get(&["oembed.html"])
                .map(str::to_string)
                .unwrap_or_else(|| drop.embed.clone());
            self.duration = drop
                .meta
                .lookup_get(&["graph.video:duration", "graph.music:duration", "html.duration"])
                .and_then(|d| d.trim().parse().ok());
        }

        self.errors.extend(ex.errors().to_vec());
        if let Some(links) = ex.context.get::<Links>() {
            self.links = links.0.clone();
        }
    }

    /// Removes the archive and its directory when it's left empty.
    pub fn remove_files(&self, data_dir: &Path) {
        let Some(path) = self.zip_path(data_dir) else {
            return;
        };

        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "file removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "cannot remove file"),
        }

        if let Some(dir) = path.parent().filter(|d| *d != data_dir) {
            // Fails when other archives share the directory.
            let _ = fs::remove_dir(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractorOptions;
    use crate::testing;

    #[test]
    fn test_new_bookmark() {
        let b = Bookmark::new("https://example.net/");
        assert_eq!(b.state, BookmarkState::Loading);
        assert!(b.uid.len() >= 20);
        assert_ne!(b.uid, Bookmark::new("https://example.net/").uid);

        let path = b.base_file_path();
        assert_eq!(path, format!("{}/{}", &b.uid[..2], b.uid));
        assert_eq!(b.zip_path(Path::new("/data")), None);
    }

    #[test]
    fn test_serialization() {
        let mut b = Bookmark::new("https://example.net/");
        b.files.insert("log".to_string(), BookmarkFile::new("log"));
        b.files.insert(
            "image".to_string(),
            BookmarkFile {
                name: "img/image.png".to_string(),
                content_type: "image/png".to_string(),
                size: Some([800, 600]),
            },
        );

        let value = serde_json::to_value(&b).unwrap();
        assert_eq!(value["state"], "loading");
        assert_eq!(value["files"]["log"], serde_json::json!({ "name": "log" }));
        assert_eq!(
            value["files"]["image"],
            serde_json::json!({ "name": "img/image.png", "type": "image/png", "size": [800, 600] })
        );
    }

    #[tokio::test]
    async fn test_update_from() {
        let mut ex = Extractor::new("https://www.example.co.uk/a%20b", ExtractorOptions::default()).unwrap();
        testing::cache_html(
            ex.client(),
            "https://www.example.co.uk/a%20b",
            &testing::html_page("Title", "<p>one two three</p>"),
        );
        ex.add_processors(crate::processors::bookmark_processors());
        ex.run().await.unwrap();

        let mut b = Bookmark::new(ex.url().as_str());
        b.update_from(&ex);

        assert_eq!(b.state, BookmarkState::Loaded);
        assert_eq!(b.url, "https://www.example.co.uk/a b");
        assert_eq!(b.title, "Title");
        assert_eq!(b.domain, "example.co.uk");
        assert_eq!(b.site, "www.example.co.uk");
        assert_eq!(b.site_name, "www.example.co.uk");
        assert_eq!(b.lang, "en");
        assert_eq!(b.document_type, "article");
        assert_eq!(b.text, "one two three");
        assert_eq!(b.word_count, 3);
        assert!(b.errors.is_empty());
        assert!(b.embed.is_empty());
    }

    #[tokio::test]
    async fn test_video_embed_from_oembed() {
        let mut ex = Extractor::new("https://example.net/watch", ExtractorOptions::default()).unwrap();
        testing::cache_html(
            ex.client(),
            "https://example.net/watch",
            concat!(
                r#"<html><head><meta property="og:type" content="video.other">"#,
                r#"<link type="application/json+oembed" href="/oembed.json"></head>"#,
                r#"<body><p>A clip</p></body></html>"#,
            ),
        );
        ex.add_to_cache(
            "https://example.net/oembed.json",
            [("Content-Type", "application/json")],
            r#"{"type": "video", "html": "<iframe src=\"https://example.net/embed/9\"></iframe>"}"#,
        );
        ex.add_processors(crate::processors::bookmark_processors());
        ex.run().await.unwrap();

        let mut b = Bookmark::new(ex.url().as_str());
        b.update_from(&ex);

        assert_eq!(b.document_type, "video");
        assert_eq!(b.embed, r#"<iframe src="https://example.net/embed/9"></iframe>"#);
    }
}
