//! Resource Archiver
//!
//! Downloads the resources an HTML document references (images, media,
//! stylesheets), optionally transforms them, and rewrites the document so
//! every archived reference points to a local name.
//!
//! A run works in two passes over the document: the first lists the
//! references, all of them are then fetched concurrently (at most
//! `max_concurrent_downloads` downloads at a time), and the second pass
//! rewrites the references that were archived. A resource that fails is
//! reported through an [`Event::Error`] and left out; it never fails the
//! run.
//!
//! # Usage
//!
//! ```rust,ignore
//! use snapshot::archiver::{Archiver, ArchiveFlags, Request};
//!
//! let mut arc = Archiver::new(Request { client, input: html, url })
//!     .with_flags(ArchiveFlags::images_only())
//!     .with_event_handler(|evt| tracing::debug!(%evt, "archiver"));
//! arc.archive().await?;
//!
//! let html = arc.result();
//! for (uri, asset) in arc.cache() { /* ... */ }
//! ```

pub mod css;
pub mod event;
pub mod html;
pub mod srcset;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::future::join_all;
use reqwest::header::REFERER;
use tokio::sync::Semaphore;
use url::Url;

use crate::error::{ArchiveError, ArchiveResult, FetchError, TransformError};
use crate::extract::drop::parse_content_type;
use crate::extract::{Client, RequestOptions};
use crate::img;

pub use event::Event;
pub use html::{Local, Reference};

pub const DEFAULT_MAX_DOWNLOADS: usize = 4;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// Content types an `<img>` target may have.
const IMG_TYPES: &[&str] = &[
    "image/bmp",
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/svg+xml",
    "image/tiff",
    "image/webp",
    "image/x-icon",
];

/// Reference kinds to archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveFlags {
    pub images: bool,
    pub css: bool,
    pub media: bool,
}

impl ArchiveFlags {
    pub fn all() -> Self {
        Self {
            images: true,
            css: true,
            media: true,
        }
    }

    pub fn images_only() -> Self {
        Self {
            images: true,
            ..Self::default()
        }
    }
}

/// The document to archive.
pub struct Request {
    pub client: Client,
    pub input: Vec<u8>,
    /// Base URL of the document
    pub url: Url,
}

/// An archived resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub data: Bytes,
    pub content_type: String,
}

/// Output of a [`ResourceTransform`].
#[derive(Debug, Clone)]
pub struct Transformed {
    pub data: Bytes,
    pub content_type: String,
    /// Pixel size, when the resource is an image
    pub size: Option<(u32, u32)>,
    /// Encoded format, reported in an info event
    pub format: Option<String>,
}

impl Transformed {
    pub fn unchanged(data: Bytes, content_type: &str) -> Self {
        Self {
            data,
            content_type: content_type.to_string(),
            size: None,
            format: None,
        }
    }
}

/// Transforms downloaded images before they're archived.
#[async_trait]
pub trait ResourceTransform: Send + Sync {
    async fn transform(
        &self,
        uri: &Url,
        content_type: &str,
        data: Bytes,
    ) -> Result<Transformed, TransformError>;
}

/// Keeps images as downloaded.
pub struct PassThrough;

#[async_trait]
impl ResourceTransform for PassThrough {
    async fn transform(
        &self,
        _uri: &Url,
        content_type: &str,
        data: Bytes,
    ) -> Result<Transformed, TransformError> {
        Ok(Transformed::unchanged(data, content_type))
    }
}

/// Builds the new reference of an archived resource from its URL, content
/// and content type.
pub type UrlProcessor = Arc<dyn Fn(&str, &[u8], &str) -> String + Send + Sync>;

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Inlines the resource as a `data:` URL.
pub fn data_url(_uri: &str, content: &[u8], content_type: &str) -> String {
    format!("data:{content_type};base64,{}", STANDARD.encode(content))
}

pub struct Archiver {
    client: Client,
    url: Url,
    input: Vec<u8>,
    max_concurrent_downloads: usize,
    request_timeout: Duration,
    flags: ArchiveFlags,
    transform: Arc<dyn ResourceTransform>,
    url_processor: UrlProcessor,
    event_handler: Option<EventHandler>,
    result: Vec<u8>,
    cache: HashMap<String, Asset>,
}

impl Archiver {
    pub fn new(req: Request) -> Self {
        Self {
            client: req.client,
            url: req.url,
            input: req.input,
            max_concurrent_downloads: DEFAULT_MAX_DOWNLOADS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            flags: ArchiveFlags::all(),
            transform: Arc::new(PassThrough),
            url_processor: Arc::new(data_url),
            event_handler: None,
            result: Vec::new(),
            cache: HashMap::new(),
        }
    }

    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_flags(mut self, flags: ArchiveFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_transform(mut self, transform: impl ResourceTransform + 'static) -> Self {
        self.transform = Arc::new(transform);
        self
    }

    pub fn with_url_processor(
        mut self,
        processor: impl Fn(&str, &[u8], &str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.url_processor = Arc::new(processor);
        self
    }

    pub fn with_event_handler(mut self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    /// The rewritten document, once [`Archiver::archive`] returned.
    pub fn result(&self) -> &[u8] {
        &self.result
    }

    /// Archived resources by absolute URL.
    pub fn cache(&self) -> &HashMap<String, Asset> {
        &self.cache
    }

    pub fn send_event(&self, evt: &Event) {
        if let Some(handler) = &self.event_handler {
            handler(evt);
        }
    }

    /// Archives the document.
    ///
    /// Only a document that cannot be parsed or rewritten is an error;
    /// resource failures are reported as events.
    pub async fn archive(&mut self) -> ArchiveResult<()> {
        let document = String::from_utf8_lossy(&self.input).into_owned();
        self.send_event(&Event::StartHtml {
            url: self.url.to_string(),
        });

        let refs = html::collect(&document, self.flags)
            .map_err(|e| ArchiveError::Rewrite(e.to_string()))?;

        let run = Run {
            client: &self.client,
            flags: self.flags,
            limit: Semaphore::new(self.max_concurrent_downloads.max(1)),
            timeout: self.request_timeout,
            transform: self.transform.as_ref(),
            url_processor: self.url_processor.as_ref(),
            events: self.event_handler.as_deref(),
            assets: Mutex::new(HashMap::new()),
            sizes: Mutex::new(HashMap::new()),
        };

        let targets = run.targets(&self.url, refs);
        let parent = self.url.to_string();
        join_all(targets.iter().map(|(uri, is_img)| run.process(uri, &parent, *is_img))).await;

        let assets = run.assets.into_inner().unwrap_or_else(|e| e.into_inner());
        let sizes = run.sizes.into_inner().unwrap_or_else(|e| e.into_inner());

        let base = &self.url;
        let url_processor = self.url_processor.as_ref();
        let lookup = |raw: &str| -> Option<Local> {
            let uri = resolve(base, raw).ok()?;
            let asset = assets.get(&uri)?;
            Some(Local {
                url: url_processor(&uri, &asset.data, &asset.content_type),
                size: sizes.get(&uri).copied(),
            })
        };
        let output = html::rewrite(&document, self.flags, &lookup)
            .map_err(|e| ArchiveError::Rewrite(e.to_string()))?;

        self.result = output.into_bytes();
        self.cache = assets;
        Ok(())
    }
}

/// Resolves a raw reference against `base`. Empty, `data:` and fragment
/// references are skipped; only http(s) URLs are archived.
pub fn resolve(base: &Url, raw: &str) -> ArchiveResult<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") || raw.starts_with('#') {
        return Err(ArchiveError::SkippedUrl);
    }

    let mut url = base.join(raw).map_err(|e| ArchiveError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ArchiveError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    url.set_fragment(None);
    Ok(url.to_string())
}

/// State of one archive run, shared by the concurrent downloads.
struct Run<'a> {
    client: &'a Client,
    flags: ArchiveFlags,
    limit: Semaphore,
    timeout: Duration,
    transform: &'a dyn ResourceTransform,
    url_processor: &'a (dyn Fn(&str, &[u8], &str) -> String + Send + Sync),
    events: Option<&'a (dyn Fn(&Event) + Send + Sync)>,
    assets: Mutex<HashMap<String, Asset>>,
    sizes: Mutex<HashMap<String, (u32, u32)>>,
}

impl Run<'_> {
    fn send(&self, evt: Event) {
        if let Some(handler) = self.events {
            handler(&evt);
        }
    }

    fn report(&self, uri: &str, err: ArchiveError) {
        self.send(Event::Error {
            err,
            uri: uri.to_string(),
        });
    }

    /// Unique absolute URLs to fetch; a URL any `<img>` points to must be
    /// an image.
    fn targets(&self, base: &Url, refs: Vec<Reference>) -> BTreeMap<String, bool> {
        let mut targets = BTreeMap::new();
        let mut skipped = Vec::new();
        for r in refs {
            match resolve(base, &r.raw) {
                Ok(uri) => {
                    let is_img = targets.entry(uri).or_insert(false);
                    *is_img |= r.is_img;
                }
                Err(err) if !skipped.contains(&r.raw) => {
                    skipped.push(r.raw.clone());
                    self.report(&r.raw, err);
                }
                Err(_) => {}
            }
        }
        targets
    }

    fn cached(&self, uri: &str) -> Option<Asset> {
        self.assets.lock().unwrap_or_else(|e| e.into_inner()).get(uri).cloned()
    }

    fn store(&self, uri: &str, asset: Asset) {
        self.assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uri.to_string(), asset);
    }

    async fn process(&self, uri: &str, parent: &str, is_img: bool) {
        if self.cached(uri).is_some() {
            self.send(Event::FetchUrl {
                uri: uri.to_string(),
                parent: parent.to_string(),
                cached: true,
            });
            return;
        }

        let mut asset = match self.fetch(uri, parent, is_img).await {
            Ok(asset) => asset,
            Err(err) => return self.report(uri, err),
        };

        if self.flags.css && asset.content_type == "text/css" {
            let css = String::from_utf8_lossy(&asset.data).into_owned();
            asset.data = Bytes::from(self.process_css(uri, &css).await);
        }
        self.store(uri, asset);
    }

    /// Archives the resources of a stylesheet and returns it rewritten.
    /// Stylesheet resources are archived as they are, without looking into
    /// nested stylesheets.
    async fn process_css(&self, css_uri: &str, css: &str) -> String {
        let Ok(base) = Url::parse(css_uri) else {
            return css.to_string();
        };

        let refs = css::urls(css)
            .into_iter()
            .map(|raw| Reference { raw, is_img: false })
            .collect();
        let targets = self.targets(&base, refs);

        join_all(targets.keys().map(|uri| async move {
            if self.cached(uri).is_some() {
                return;
            }
            match self.fetch(uri, css_uri, false).await {
                Ok(asset) => self.store(uri, asset),
                Err(err) => self.report(uri, err),
            }
        }))
        .await;

        css::rewrite(css, |raw| {
            let uri = resolve(&base, raw).ok()?;
            let asset = self.cached(&uri)?;
            Some((self.url_processor)(&uri, &asset.data, &asset.content_type))
        })
    }

    /// Downloads one resource and runs images through the transform.
    async fn fetch(&self, uri: &str, parent: &str, is_img: bool) -> ArchiveResult<Asset> {
        self.send(Event::FetchUrl {
            uri: uri.to_string(),
            parent: parent.to_string(),
            cached: false,
        });

        let url = Url::parse(uri).map_err(|e| ArchiveError::InvalidUrl {
            url: uri.to_string(),
            reason: e.to_string(),
        })?;

        let rsp = {
            let _permit = self.limit.acquire().await?;
            let options = RequestOptions::default()
                .with_header(REFERER, parent)
                .with_timeout(self.timeout);
            self.client.send(&url, options).await?
        };
        if !rsp.status.is_success() {
            return Err(FetchError::Status(rsp.status.as_u16()).into());
        }

        let (mut content_type, _) = parse_content_type(rsp.content_type().unwrap_or_default());
        if content_type.is_empty() {
            content_type = "text/plain".to_string();
        }

        let mut data = rsp.body;
        if content_type.starts_with("image/") {
            let transformed = self.transform.transform(&url, &content_type, data).await?;
            if let Some(format) = &transformed.format {
                self.send(Event::Info(BTreeMap::from([
                    ("uri".to_string(), uri.to_string()),
                    ("format".to_string(), format.clone()),
                ])));
            }
            if let Some(size) = transformed.size {
                self.sizes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(uri.to_string(), size);
            }
            data = transformed.data;
            content_type = transformed.content_type;
        }

        if is_img && !img::sniff(&data).is_some_and(|t| IMG_TYPES.contains(&t)) {
            return Err(ArchiveError::NotAnImage);
        }

        Ok(Asset { data, content_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::Mutex as StdMutex;

    fn archiver(client: &Client, html: &str) -> Archiver {
        Archiver::new(Request {
            client: client.clone(),
            input: html.as_bytes().to_vec(),
            url: Url::parse("https://example.net/article/").unwrap(),
        })
    }

    #[test]
    fn test_resolve() {
        let base = Url::parse("https://example.net/a/").unwrap();
        assert_eq!(resolve(&base, " img.png ").unwrap(), "https://example.net/a/img.png");
        assert_eq!(resolve(&base, "//cdn.example.org/x.png#y").unwrap(), "https://cdn.example.org/x.png");
        assert!(matches!(resolve(&base, ""), Err(ArchiveError::SkippedUrl)));
        assert!(matches!(resolve(&base, "#top"), Err(ArchiveError::SkippedUrl)));
        assert!(matches!(resolve(&base, "data:image/png;base64,AA=="), Err(ArchiveError::SkippedUrl)));
        assert!(matches!(resolve(&base, "javascript:void(0)"), Err(ArchiveError::InvalidUrl { .. })));
    }

    #[test]
    fn test_data_url() {
        assert_eq!(data_url("x", b"hi", "text/plain"), "data:text/plain;base64,aGk=");
    }

    #[tokio::test]
    async fn test_archive_inlines_images_by_default() {
        let client = Client::new().unwrap();
        let png = testing::png(3, 2);
        testing::cache_bytes(&client, "https://example.net/article/a.png", "image/png", png.clone());

        let mut arc = archiver(&client, r#"<p><img src="a.png"></p>"#);
        arc.archive().await.unwrap();

        let expected = data_url("", &png, "image/png");
        assert_eq!(
            String::from_utf8_lossy(arc.result()),
            format!(r#"<p><img src="{expected}"></p>"#)
        );
        assert_eq!(arc.cache()["https://example.net/article/a.png"].content_type, "image/png");
    }

    #[tokio::test]
    async fn test_archive_events_and_failures() {
        let client = Client::new().unwrap();
        testing::cache_bytes(&client, "https://example.net/ok.png", "image/png", testing::png(2, 2));
        testing::cache_html(&client, "https://example.net/fake.png", "<p>not an image</p>");

        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let mut arc = archiver(
            &client,
            r#"<img src="/ok.png"><img src="/ok.png"><img src="/fake.png"><img src="data:image/png;base64,AA==">"#,
        )
        .with_event_handler(move |evt| sink.lock().unwrap().push(evt.to_string()));
        arc.archive().await.unwrap();

        let events = events.lock().unwrap();
        assert!(events[0].starts_with("start"));
        assert!(events.iter().any(|e| e.starts_with(r#"error err="not an image" uri="https://example.net/fake.png""#)));
        assert!(events.iter().any(|e| e.starts_with(r#"error err="skipped URL""#)));
        // The same URL is fetched once.
        assert_eq!(
            events
                .iter()
                .filter(|e| e.starts_with(r#"fetch uri="https://example.net/ok.png""#))
                .count(),
            1
        );

        assert_eq!(arc.cache().len(), 1);
        let html = String::from_utf8_lossy(arc.result()).into_owned();
        assert!(html.contains(r#"<img src="/fake.png">"#));
        assert!(html.contains(r#"<img src="data:image/png;base64,AA==">"#));
    }

    #[tokio::test]
    async fn test_archive_stylesheet() {
        let client = Client::builder()
            .denied_ips(vec!["10.0.0.0/8".parse().unwrap()])
            .build()
            .unwrap();
        client.add_to_cache(
            "https://example.net/css/site.css",
            [("Content-Type", "text/css; charset=utf-8")],
            "body { background: url(../bg.png) } .x { background: url(http://10.0.0.1/missing.png) }",
        );
        testing::cache_bytes(&client, "https://example.net/bg.png", "image/png", testing::png(1, 1));

        let mut arc = archiver(&client, r#"<link rel="stylesheet" href="/css/site.css"><p>x</p>"#)
            .with_url_processor(|uri, _, _| format!("local:{}", uri.rsplit('/').next().unwrap_or_default()));
        arc.archive().await.unwrap();

        assert_eq!(
            String::from_utf8_lossy(arc.result()),
            r#"<link rel="stylesheet" href="local:site.css"><p>x</p>"#
        );
        let css = &arc.cache()["https://example.net/css/site.css"];
        assert_eq!(css.content_type, "text/css");
        assert_eq!(
            String::from_utf8_lossy(&css.data),
            r#"body { background: url("local:bg.png") } .x { background: url(http://10.0.0.1/missing.png) }"#
        );
        assert!(arc.cache().contains_key("https://example.net/bg.png"));
    }
}
