//! oEmbed discovery.
//!
//! A page may advertise an oEmbed JSON document with
//! `<link type="application/json+oembed">`. Its properties end up in the
//! drop metadata under `oembed.*`; `oembed.html` is the embed markup of media
//! pages.

use async_trait::async_trait;
use lazy_static::lazy_static;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{FetchError, OembedError};
use crate::extract::{Client, Drop, Extractor, Flow, ProcessMessage, Processor, Step};

lazy_static! {
    static ref OEMBED_LINK: Selector =
        Selector::parse(r#"link[href][type="application/json+oembed"]"#).unwrap();
}

/// oEmbed properties copied to the drop metadata.
const PROPERTIES: &[&str] = &[
    "type",
    "version",
    "title",
    "author_name",
    "author_url",
    "provider_name",
    "provider_url",
    "cache_age",
    "thumbnail_url",
    "thumbnail_width",
    "thumbnail_height",
    "url",
    "width",
    "height",
    "html",
];

/// Reads the oEmbed document of the first drop. Must come after
/// [`ExtractMeta`](super::ExtractMeta).
///
/// Without an oEmbed link, video pages get an embed built from their
/// OpenGraph video properties. Failures only log a warning.
pub struct ExtractOembed;

#[async_trait]
impl Processor for ExtractOembed {
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        if m.step() != Step::Dom || m.position() > 0 {
            return Flow::Continue;
        }
        let Some(href) = m.dom.as_ref().and_then(oembed_href) else {
            set_from_graph(ex.first_drop_mut());
            return Flow::Continue;
        };

        m.log().debug("looking for oembed URL", &[("href", &href)]);
        let base = ex.first_drop().url.clone();
        match fetch(ex.client(), &base, &href).await {
            Ok((url, props)) => {
                m.log().debug("found oembed", &[("url", &url)]);
                let drop = ex.first_drop_mut();
                for name in PROPERTIES {
                    if let Some(value) = props.get(*name).and_then(property) {
                        drop.meta.add(&format!("oembed.{name}"), value);
                    }
                }
            }
            Err(err) => m.log().warn("oembed error", &[("err", &err)]),
        }

        Flow::Continue
    }
}

fn oembed_href(doc: &Html) -> Option<String> {
    doc.select(&OEMBED_LINK)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(str::to_string)
}

async fn fetch(client: &Client, base: &Url, href: &str) -> Result<(Url, Map<String, Value>), OembedError> {
    let url = base
        .join(href)
        .map_err(|_| OembedError::InvalidUrl(href.to_string()))?;

    let rsp = client.get(&url).await?;
    if !rsp.status.is_success() {
        return Err(FetchError::Status(rsp.status.as_u16()).into());
    }

    let props: Map<String, Value> = serde_json::from_slice(&rsp.body)?;
    Ok((url, props))
}

/// Strings as they are, numbers and the like in their JSON form.
fn property(value: &Value) -> Option<String> {
    let value = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        v => v.to_string(),
    };
    (!value.is_empty()).then_some(value)
}

fn set_from_graph(drop: &mut Drop) {
    let is_video = drop
        .meta
        .lookup_get(&["graph.type"])
        .is_some_and(|t| t.starts_with("video"));
    if !is_video {
        return;
    }

    let src = drop
        .meta
        .lookup_get(&["graph.video:secure_url", "graph.video:url"])
        .unwrap_or_default();
    let width = drop.meta.lookup_get(&["graph.video:width"]).unwrap_or_default();
    let height = drop.meta.lookup_get(&["graph.video:height"]).unwrap_or_default();
    if src.is_empty() || width.is_empty() || height.is_empty() {
        return;
    }

    let html = format!(
        r#"<iframe src="{}" width="{}" height="{}" frameborder="0" allowfullscreen></iframe>"#,
        src.replace('"', "&quot;"),
        width.replace('"', "&quot;"),
        height.replace('"', "&quot;"),
    );
    drop.meta.add("oembed.html", html);
}
