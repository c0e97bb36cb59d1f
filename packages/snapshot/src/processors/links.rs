//! Outgoing links of a document and their metadata.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::join_all;
use lazy_static::lazy_static;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use url::Url;

use super::meta::read_meta;
use crate::extract::{Client, Drop, Extractor, Flow, ProcessMessage, Processor, RunLog, Step};

lazy_static! {
    static ref ANCHORS: Selector = Selector::parse("a[href]").unwrap();
}

/// Default number of links loaded at the same time.
pub const LINK_FETCH_CONCURRENCY: usize = 10;

/// A link found in the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    pub domain: String,
    pub title: String,
    pub is_page: bool,
    pub content_type: String,
}

/// Links collected during a run, kept in [`Extractor::context`].
#[derive(Debug, Clone, Default)]
pub struct Links(pub Vec<Link>);

/// Collects http(s) links of every HTML drop.
pub struct ExtractLinks;

#[async_trait]
impl Processor for ExtractLinks {
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        if m.step() != Step::Dom {
            return Flow::Continue;
        }
        let Some(doc) = m.dom.as_ref() else {
            return Flow::Continue;
        };

        let hrefs = anchor_hrefs(doc);
        let Some(base) = ex.drops().get(m.position()).map(|d| d.url.clone()) else {
            return Flow::Continue;
        };

        let mut links = ex.context.remove::<Links>().unwrap_or_default();
        let before = links.0.len();
        let mut seen: HashSet<String> = links.0.iter().map(|l| l.url.clone()).collect();

        for href in hrefs {
            let Ok(mut url) = base.join(&href) else {
                continue;
            };
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            url.set_fragment(None);
            if url == base || !seen.insert(url.to_string()) {
                continue;
            }

            let domain = Drop::new(url.clone()).domain;
            links.0.push(Link {
                url: url.to_string(),
                domain,
                ..Link::default()
            });
        }

        m.log().debug("links extracted", &[("count", &(links.0.len() - before))]);
        ex.context.insert(links);
        Flow::Continue
    }
}

fn anchor_hrefs(doc: &Html) -> Vec<String> {
    doc.select(&ANCHORS)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty())
        .collect()
}

/// Loads every collected link for its content type and title.
///
/// A link that fails to load is logged as a warning and left as is.
pub struct FetchLinks {
    pub concurrency: usize,
}

impl Default for FetchLinks {
    fn default() -> Self {
        Self {
            concurrency: LINK_FETCH_CONCURRENCY,
        }
    }
}

#[async_trait]
impl Processor for FetchLinks {
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        if m.step() != Step::PostProcess {
            return Flow::Continue;
        }
        let Some(mut links) = ex.context.remove::<Links>() else {
            return Flow::Continue;
        };

        let client = ex.client().clone();
        let log = ex.log().clone();
        let limit = Semaphore::new(self.concurrency.max(1));
        let (client, log, limit) = (&client, &log, &limit);

        join_all(links.0.iter_mut().map(|link| async move {
            let Ok(_permit) = limit.acquire().await else {
                return;
            };
            fetch_link(client, log, link).await;
        }))
        .await;

        ex.context.insert(links);
        Flow::Continue
    }
}

async fn fetch_link(client: &Client, log: &RunLog, link: &mut Link) {
    let Ok(url) = Url::parse(&link.url) else {
        return;
    };

    let mut drop = Drop::new(url);
    if let Err(err) = drop.load(client).await {
        log.warn("cannot load link", &[("url", &link.url), ("err", &err)]);
        return;
    }

    link.content_type = drop.content_type.clone();
    link.is_page = drop.is_html();
    if link.is_page {
        if let Some(title) = page_title(&drop.body) {
            link.title = title;
        }
    } else if !drop.title.is_empty() {
        link.title = drop.title;
    }
}

fn page_title(body: &[u8]) -> Option<String> {
    let meta = read_meta(&Html::parse_document(&String::from_utf8_lossy(body)));
    meta.get(&["graph.title", "twitter.title", "html.title"])
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractorOptions;
    use crate::testing;

    #[tokio::test]
    async fn test_extract_and_fetch_links() {
        let options = ExtractorOptions::default().with_denied_ips(vec!["10.0.0.0/8".parse().unwrap()]);
        let mut ex = Extractor::new("https://example.net/article", options).unwrap();
        testing::cache_html(
            ex.client(),
            "https://example.net/article",
            &testing::html_page(
                "Article",
                r##"<a href="/article#top">self</a>
                <a href="/other">other</a>
                <a href="https://example.org/page#x">page</a>
                <a href="https://example.org/page">same page</a>
                <a href="mailto:someone@example.net">mail</a>
                <a href="https://example.org/report.txt">report</a>
                <a href="https://example.org/cat_photo.png">cat</a>
                <a href="http://10.0.0.1/blocked">blocked</a>"##,
            ),
        );
        testing::cache_html(
            ex.client(),
            "https://example.net/other",
            &testing::html_page("Other", r#"<meta property="og:title" content="Other page">"#),
        );
        testing::cache_html(ex.client(), "https://example.org/page", &testing::html_page("Page", ""));
        ex.add_to_cache("https://example.org/report.txt", [("Content-Type", "text/plain")], "report");
        testing::cache_bytes(ex.client(), "https://example.org/cat_photo.png", "image/png", testing::png(4, 4));

        ex.add_processor(ExtractLinks);
        ex.add_processor(FetchLinks::default());
        ex.run().await.unwrap();

        let links = &ex.context.get::<Links>().unwrap().0;
        let urls: Vec<&str> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.net/other",
                "https://example.org/page",
                "https://example.org/report.txt",
                "https://example.org/cat_photo.png",
                "http://10.0.0.1/blocked",
            ]
        );

        assert_eq!(links[0].title, "Other page");
        assert!(links[0].is_page);
        assert_eq!(links[1].title, "Page");
        assert_eq!(links[1].domain, "example.org");
        // Plain text is served as a page.
        assert!(links[2].is_page);
        assert_eq!(links[2].title, "report.txt");
        assert!(!links[3].is_page);
        assert_eq!(links[3].content_type, "image/png");
        assert_eq!(links[3].title, "cat photo.png");
        // The unreachable link is kept, only without metadata.
        assert!(links[4].content_type.is_empty());
        assert!(ex.errors().is_empty());
    }
}
