use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{HeaderMap, LINK};

use crate::extract::{Extractor, Flow, ProcessMessage, Processor, Step};

/// Header carrying the URL of the page a proxy or mirror actually served.
pub const ORIGINAL_URL_HEADER: &str = "x-original-url";

lazy_static! {
    static ref LINK_VALUE: Regex = Regex::new(r"<([^>]*)>\s*((?:;\s*[^,;]*)*)").unwrap();
    static ref REL_ORIGINAL: Regex = Regex::new(r#"(?i);\s*rel\s*=\s*"?([^";]*)"?"#).unwrap();
}

/// Follows a `Link: <...>; rel="original"` response header on the first drop.
///
/// When the link also matches the [`ORIGINAL_URL_HEADER`] value, the page is
/// a stand-in for the original one: the drop is replaced and the run starts
/// over. Otherwise only the drop URL and site are rewritten.
pub struct OriginalLink;

#[async_trait]
impl Processor for OriginalLink {
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        if m.step() != Step::Dom || m.position() > 0 {
            return Flow::Continue;
        }

        let drop = ex.first_drop();
        let Some(link) = original_link(&drop.header) else {
            return Flow::Continue;
        };
        let swap = drop
            .header
            .get(ORIGINAL_URL_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == link);

        let url = match drop.url.join(&link) {
            Ok(url) => url,
            Err(err) => {
                m.log().error("cannot parse URL", &[("url", &link), ("err", &err)]);
                return Flow::Continue;
            }
        };

        if swap {
            m.log().debug("found original page header", &[("url", &url)]);
            if let Err(err) = ex.replace_drop(url) {
                m.log().error("cannot replace page", &[("err", &err)]);
                return Flow::Stop;
            }
            m.reset_position();
            return Flow::Stop;
        }

        m.log().debug("found original link", &[("url", &url)]);
        let drop = ex.first_drop_mut();
        drop.site = url.host_str().unwrap_or_default().to_string();
        drop.set_url(url);
        Flow::Continue
    }
}

/// First `rel="original"` target of the `Link` headers.
fn original_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| LINK_VALUE.captures_iter(v))
        .find(|c| {
            REL_ORIGINAL
                .captures_iter(&c[2])
                .any(|rel| rel[1].split_whitespace().any(|r| r.eq_ignore_ascii_case("original")))
        })
        .map(|c| c[1].trim().to_string())
        .filter(|link| !link.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractorOptions;
    use crate::testing;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_original_link() {
        let mut headers = HeaderMap::new();
        headers.append(
            LINK,
            HeaderValue::from_static(r#"<https://example.net/style.css>; rel=preload, <https://example.org/a>; rel="canonical original""#),
        );
        assert_eq!(original_link(&headers).as_deref(), Some("https://example.org/a"));

        headers.clear();
        headers.append(LINK, HeaderValue::from_static(r#"<https://example.org/a>; rel="canonical""#));
        assert_eq!(original_link(&headers), None);
    }

    #[tokio::test]
    async fn test_rewrites_url() {
        let mut ex = Extractor::new("https://mirror.example.net/a", ExtractorOptions::default()).unwrap();
        ex.add_to_cache(
            "https://mirror.example.net/a",
            [
                ("Content-Type", "text/html"),
                ("Link", r#"<https://example.org/a>; rel="original""#),
            ],
            testing::html_page("a", "<p>a</p>"),
        );

        ex.add_processor(OriginalLink);
        ex.run().await.unwrap();

        let drop = ex.first_drop();
        assert_eq!(drop.url.as_str(), "https://example.org/a");
        assert_eq!(drop.site, "example.org");
        assert_eq!(drop.domain, "example.org");
    }

    #[tokio::test]
    async fn test_swaps_page() {
        let mut ex = Extractor::new("https://mirror.example.net/a", ExtractorOptions::default()).unwrap();
        ex.add_to_cache(
            "https://mirror.example.net/a",
            [
                ("Content-Type", "text/html"),
                ("Link", r#"<https://example.org/a>; rel="original""#),
                ("X-Original-Url", "https://example.org/a"),
            ],
            testing::html_page("mirror", "<p>mirror</p>"),
        );
        testing::cache_html(ex.client(), "https://example.org/a", &testing::html_page("a", "<p>original</p>"));

        ex.add_processor(OriginalLink);
        ex.run().await.unwrap();

        assert_eq!(ex.drops().len(), 1);
        assert_eq!(ex.first_drop().url.as_str(), "https://example.org/a");
        assert_eq!(String::from_utf8_lossy(&ex.html), "<!-- page 1 -->\n<p>original</p>\n");
    }
}
