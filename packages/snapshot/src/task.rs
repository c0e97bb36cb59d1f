//! Page saving task.
//!
//! [`extract_page`] runs the bookmark extraction chain on a URL, archives
//! the images of the resulting document and writes everything in a single
//! zip file under the configured data directory. It never fails: errors end
//! up in the returned bookmark.
//!
//! # Archive layout
//!
//! ```text
//! img/image.png          lead picture
//! img/thumbnail.jpeg     its thumbnail
//! index.html             extracted document, images rewritten
//! _resources/<name>      archived images
//! log                    run log
//! props.json             properties of the first drop
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::io::Cursor;

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use zipfs::{FileHeader, ZipRw};

use crate::archiver::Asset;
use crate::bookmark::{new_archive, url_filename, Bookmark, BookmarkFile, BookmarkState, RESOURCE_DIR_NAME};
use crate::config::Config;
use crate::error::{ArchiveResult, BookmarkError};
use crate::extract::{Extractor, ExtractorOptions};
use crate::processors::bookmark_processors;

/// A resource provided by the caller, served instead of fetching it.
///
/// In JSON, `data` is the base64 encoded body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub data: Vec<u8>,
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.trim()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractParams {
    pub url: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Saves a page and returns its bookmark.
///
/// The work runs on its own task: a panic there yields a bookmark in the
/// error state instead of unwinding into the caller.
pub async fn extract_page(config: &Config, params: ExtractParams) -> Bookmark {
    let bookmark = Bookmark::new(params.url.clone());
    let fallback = bookmark.clone();
    let config = config.clone();

    guarded(fallback, async move { run(&config, params, bookmark).await }).await
}

/// Runs `work` on its own task and turns a panic into an error on `fallback`.
async fn guarded<F>(fallback: Bookmark, work: F) -> Bookmark
where
    F: Future<Output = Bookmark> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(bookmark) => bookmark,
        Err(err) => {
            let reason = panic_message(err);
            error!(uid = %fallback.uid, error = %reason, "extraction task failed");
            let mut bookmark = fallback;
            bookmark.state = BookmarkState::Error;
            bookmark.errors.push(reason);
            bookmark
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "extraction panicked".to_string()),
        Err(err) => err.to_string(),
    }
}

async fn run(config: &Config, params: ExtractParams, mut bookmark: Bookmark) -> Bookmark {
    let options = ExtractorOptions::default()
        .with_log_field("@id", bookmark.uid.clone())
        .with_denied_ips(config.denied_ips.clone())
        .with_proxies(config.proxies.clone());

    let mut ex = match Extractor::new(&params.url, options) {
        Ok(ex) => ex,
        Err(err) => {
            bookmark.state = BookmarkState::Error;
            bookmark.errors.push(err.to_string());
            return bookmark;
        }
    };

    for res in &params.resources {
        ex.add_to_cache(&res.url, &res.headers, res.data.clone());
    }

    ex.add_processors(bookmark_processors());

    if let Err(err) = ex.run().await {
        bookmark.state = BookmarkState::Error;
        let errors = ex.errors();
        if errors.is_empty() {
            bookmark.errors.push(err.to_string());
        } else {
            bookmark.errors.extend(errors.to_vec());
        }
    } else {
        bookmark.update_from(&ex);
    }

    let mut resources = Vec::new();
    if bookmark.state == BookmarkState::Loaded && !ex.html.is_empty() && ex.first_drop().is_html() {
        match archive(&mut ex, config).await {
            Ok(assets) => resources = assets,
            Err(err) => ex.log().error("archiver error", &[("err", &err)]),
        }
    }

    bookmark.file_path = bookmark.base_file_path();
    if let Err(err) = create_zip_file(config, &ex, &resources, &mut bookmark) {
        ex.log().error("cannot create archive", &[("err", &err)]);
        bookmark.errors.push(err.to_string());
        bookmark.remove_files(&config.data_dir);
        bookmark.file_path.clear();
        bookmark.files.clear();
    } else {
        info!(uid = %bookmark.uid, path = %bookmark.file_path, "bookmark saved");
    }

    bookmark
}

/// Runs the archiver over the extracted HTML and keeps its output.
async fn archive(ex: &mut Extractor, config: &Config) -> ArchiveResult<Vec<(String, Asset)>> {
    let mut arc = new_archive(ex, config)?;
    arc.archive().await?;

    ex.html = arc.result().to_vec();
    let mut assets: Vec<(String, Asset)> = arc.cache().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assets.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(assets)
}

/// Writes the bookmark archive to `<data_dir>/<file_path>.zip`.
pub fn create_zip_file(
    config: &Config,
    ex: &Extractor,
    resources: &[(String, Asset)],
    bookmark: &mut Bookmark,
) -> Result<(), BookmarkError> {
    let Some(path) = bookmark.zip_path(&config.data_dir) else {
        return Ok(());
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut zip = ZipRw::create(&path)?;
    let result = write_entries(&mut zip, ex, resources, bookmark);
    let closed = zip.close();
    result?;
    closed?;
    Ok(())
}

fn write_entries(
    zip: &mut ZipRw<fs::File>,
    ex: &Extractor,
    resources: &[(String, Asset)],
    bookmark: &mut Bookmark,
) -> Result<(), BookmarkError> {
    let drop = ex.first_drop();

    for (key, picture) in &drop.pictures {
        let name = format!("img/{}", picture.name(key));
        zip.add(FileHeader::new(&name), Cursor::new(picture.data.as_ref()))?;
        bookmark.files.insert(
            key.clone(),
            BookmarkFile {
                name,
                content_type: picture.content_type.clone(),
                size: Some(picture.size),
            },
        );
    }

    if !ex.html.is_empty() {
        zip.add(FileHeader::new("index.html").deflated(), Cursor::new(ex.html.as_slice()))?;
        bookmark.files.insert(
            "article".to_string(),
            BookmarkFile {
                name: "index.html".to_string(),
                content_type: "text/html".to_string(),
                size: None,
            },
        );

        for (uri, asset) in resources {
            let name = format!("{RESOURCE_DIR_NAME}/{}", url_filename(uri, &asset.content_type));
            zip.add(FileHeader::new(&name), Cursor::new(asset.data.as_ref()))?;
        }
    }

    let log = ex.logs().join("\n");
    zip.add(FileHeader::new("log").deflated(), Cursor::new(log.as_bytes()))?;
    bookmark.files.insert("log".to_string(), BookmarkFile::new("log"));

    let props = serde_json::to_vec_pretty(drop)?;
    zip.add(FileHeader::new("props.json").deflated(), Cursor::new(props.as_slice()))?;
    bookmark.files.insert("props".to_string(), BookmarkFile::new("props.json"));

    Ok(())
}
