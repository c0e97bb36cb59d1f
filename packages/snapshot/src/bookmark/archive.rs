//! Glue between an extraction run and the resource archiver.
//!
//! Archived resources get a stable name derived from their URL and are
//! stored under [`RESOURCE_DIR_NAME`] next to the rewritten document.

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;
use uuid::Uuid;

use crate::archiver::{ArchiveFlags, Archiver, Event, Request, ResourceTransform, Transformed};
use crate::config::Config;
use crate::error::{ArchiveError, ArchiveResult, TransformError};
use crate::extract::log::Level;
use crate::extract::{Extractor, RunLog};
use crate::img::{self, Compression, Image};

pub const RESOURCE_DIR_NAME: &str = "_resources";

/// Images wider than this are shrunk before they're archived.
const MAX_IMAGE_WIDTH: u32 = 1280;
const IMAGE_QUALITY: u8 = 75;

/// Images the transform re-encodes. SVG is archived as is.
const TRANSFORMABLE: &[&str] = &[
    "image/bmp",
    "image/jpeg",
    "image/png",
    "image/tiff",
    "image/webp",
];

/// File extension for a content type; `.bin` when unknown.
pub fn extension(content_type: &str) -> &'static str {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    match mime {
        "application/javascript" | "text/javascript" => ".js",
        "application/json" => ".json",
        "application/ogg" => ".ogx",
        "application/pdf" => ".pdf",
        "application/rtf" => ".rtf",
        "application/vnd.ms-fontobject" => ".eot",
        "application/xhtml+xml" => ".xhtml",
        "application/xml" => ".xml",
        "audio/aac" => ".aac",
        "audio/midi" | "audio/x-midi" => ".midi",
        "audio/mpeg" => ".mp3",
        "audio/ogg" => ".oga",
        "audio/opus" => ".opus",
        "audio/wav" => ".wav",
        "audio/webm" => ".weba",
        "font/otf" => ".otf",
        "font/ttf" => ".ttf",
        "font/woff" => ".woff",
        "font/woff2" => ".woff2",
        "image/bmp" => ".bmp",
        "image/gif" => ".gif",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/svg+xml" => ".svg",
        "image/tiff" => ".tiff",
        "image/vnd.microsoft.icon" | "image/x-icon" => ".ico",
        "image/webp" => ".webp",
        "text/calendar" => ".ics",
        "text/css" => ".css",
        "text/csv" => ".csv",
        "text/html" => ".html",
        "text/plain" => ".txt",
        "video/mp2t" => ".ts",
        "video/mp4" => ".mp4",
        "video/mpeg" => ".mpeg",
        "video/ogg" => ".ogv",
        "video/webm" => ".webm",
        "video/x-msvideo" => ".avi",
        _ => ".bin",
    }
}

/// Archive file name of a resource: a UUIDv5 of its URL, base58 encoded,
/// plus the extension of its content type.
pub fn url_filename(uri: &str, content_type: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, uri.as_bytes());
    format!("{}{}", bs58::encode(id.as_bytes()).into_string(), extension(content_type))
}

/// New reference of an archived resource in the document.
pub fn url_processor(uri: &str, _content: &[u8], content_type: &str) -> String {
    format!("./{RESOURCE_DIR_NAME}/{}", url_filename(uri, content_type))
}

/// Strips metadata and shrinks raster images before archiving.
pub struct ImageTransform;

#[async_trait]
impl ResourceTransform for ImageTransform {
    async fn transform(
        &self,
        _uri: &Url,
        content_type: &str,
        data: Bytes,
    ) -> Result<Transformed, TransformError> {
        if !TRANSFORMABLE.contains(&content_type) {
            return Ok(Transformed::unchanged(data, content_type));
        }

        let _permit = img::acquire().await?;
        let content_type = content_type.to_string();
        let transformed = tokio::task::spawn_blocking(move || {
            let mut im = Image::decode(&content_type, &data)?;
            // Encoding writes pixels only, which also strips metadata.
            img::pipeline(
                &mut im,
                &[&|im| {
                    im.set_quality(IMAGE_QUALITY);
                    im.set_compression(Compression::Best);
                    im.fit(MAX_IMAGE_WIDTH, 0);
                    Ok(())
                }],
            )?;

            Ok::<_, TransformError>(Transformed {
                data: Bytes::from(im.encode()?),
                content_type: im.content_type().to_string(),
                size: Some((im.width(), im.height())),
                format: Some(im.format_name().to_string()),
            })
        })
        .await??;

        Ok(transformed)
    }
}

/// Forwards archiver events to the run log.
pub fn event_handler(log: RunLog) -> impl Fn(&Event) + Send + Sync + 'static {
    move |evt| {
        let fields = evt.fields();
        let attrs: Vec<(&str, &dyn std::fmt::Display)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v as &dyn std::fmt::Display))
            .collect();

        let (level, msg) = match evt {
            Event::Error { .. } => (Level::Error, "archive error"),
            Event::StartHtml { .. } => (Level::Info, "start archive"),
            Event::FetchUrl { .. } => (Level::Debug, "load archive resource"),
            Event::Info(_) => (Level::Debug, "archiver"),
        };
        log.record(level, msg, &attrs);
    }
}

/// Prepares an archiver for the HTML of an extraction run.
pub fn new_archive(ex: &Extractor, config: &Config) -> ArchiveResult<Archiver> {
    let url = ex.first_drop().url.clone();
    if url.host_str().is_none() {
        return Err(ArchiveError::InvalidUrl {
            url: url.to_string(),
            reason: "no host".to_string(),
        });
    }

    Ok(Archiver::new(Request {
        client: ex.client().clone(),
        input: ex.html.clone(),
        url,
    })
    .with_flags(ArchiveFlags::images_only())
    .with_max_concurrent_downloads(config.max_downloads)
    .with_request_timeout(config.fetch_timeout)
    .with_transform(ImageTransform)
    .with_url_processor(url_processor)
    .with_event_handler(event_handler(ex.log().clone())))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing;

    #[test]
    fn test_url_filename() {
        let name = url_filename("https://example.net/a.png", "image/png");
        assert!(name.ends_with(".png"));
        assert_eq!(name, url_filename("https://example.net/a.png", "image/png"));
        assert_ne!(name, url_filename("https://example.net/b.png", "image/png"));

        assert!(url_filename("https://example.net/x", "text/css; charset=utf-8").ends_with(".css"));
        assert!(url_filename("https://example.net/x", "application/x-unknown").ends_with(".bin"));
        assert!(url_filename("https://example.net/x", "").ends_with(".bin"));
    }

    #[test]
    fn test_url_processor() {
        let local = url_processor("https://example.net/a.jpg", b"", "image/jpeg");
        assert!(local.starts_with("./_resources/"));
        assert!(local.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_image_transform() {
        let url = Url::parse("https://example.net/big.png").unwrap();
        let out = ImageTransform
            .transform(&url, "image/png", Bytes::from(testing::png(2000, 1000)))
            .await
            .unwrap();
        assert_eq!(out.size, Some((1280, 640)));
        assert_eq!(out.content_type, "image/png");
        assert_eq!(out.format.as_deref(), Some("png"));

        let svg = Bytes::from_static(b"<svg xmlns=\"http://www.w3.org/2000/svg\"></svg>");
        let out = ImageTransform.transform(&url, "image/svg+xml", svg.clone()).await.unwrap();
        assert_eq!(out.data, svg);
        assert_eq!(out.size, None);

        let err = ImageTransform
            .transform(&url, "image/jpeg", Bytes::from_static(b"garbage"))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_image_transform_waits_for_a_permit() {
        let first = img::acquire().await.unwrap();
        let second = img::acquire().await.unwrap();
        assert_eq!(img::MAX_TRANSFORMS, 2);

        let mut pending = tokio::spawn(async {
            let url = Url::parse("https://example.net/a.png").unwrap();
            ImageTransform
                .transform(&url, "image/png", Bytes::from(testing::png(64, 32)))
                .await
        });

        let blocked = tokio::time::timeout(Duration::from_millis(200), &mut pending).await;
        assert!(blocked.is_err());

        drop(first);
        let out = tokio::time::timeout(Duration::from_secs(30), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(out.size, Some((64, 32)));
        drop(second);
    }

    #[test]
    fn test_event_handler() {
        let log = RunLog::default();
        let handler = event_handler(log.clone());
        handler(&Event::StartHtml {
            url: "https://example.net/".to_string(),
        });
        handler(&Event::Error {
            err: ArchiveError::NotAnImage,
            uri: "https://example.net/x.png".to_string(),
        });

        let lines = log.lines();
        assert_eq!(lines[0], r#"[INFO] start archive url="https://example.net/""#);
        assert_eq!(
            lines[1],
            r#"[ERRO] archive error err="not an image" uri="https://example.net/x.png""#
        );
        assert_eq!(log.errors().to_vec(), vec!["archive error".to_string()]);
    }
}
