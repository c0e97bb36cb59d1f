//! Drops: one fetched document and everything learned about it.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, UTF_8};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde::{Serialize, Serializer};
use url::Url;

use super::client::Client;
use super::picture::Picture;
use crate::error::{FetchError, FetchResult};

/// Charset `<meta>` declarations are only looked for in the document head.
const CHARSET_SNIFF_LEN: usize = 3072;

/// Multi-valued document metadata (`graph.title`, `html.lang`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DropMeta(BTreeMap<String, Vec<String>>);

impl DropMeta {
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.0.entry(name.to_string()).or_default().push(value.into());
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Values of the first name with any value.
    pub fn lookup(&self, names: &[&str]) -> &[String] {
        names
            .iter()
            .filter_map(|n| self.0.get(*n))
            .find(|v| !v.is_empty())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of [`DropMeta::lookup`].
    pub fn lookup_get(&self, names: &[&str]) -> Option<&str> {
        self.lookup(names).first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Structured properties (JSON-LD, raw meta lists).
pub type DropProperties = serde_json::Map<String, serde_json::Value>;

/// A fetch target and its extracted metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Drop {
    #[serde(rename = "URL")]
    pub url: Url,
    pub domain: String,
    pub content_type: String,
    pub charset: String,
    pub document_type: String,
    pub title: String,
    pub description: String,
    pub authors: Vec<String>,
    pub site: String,
    pub site_name: String,
    pub lang: String,
    pub text_direction: String,
    pub date: Option<DateTime<Utc>>,
    /// Media embed markup (video players and the like)
    pub embed: String,
    #[serde(serialize_with = "serialize_headers")]
    pub header: HeaderMap,
    pub meta: DropMeta,
    pub properties: DropProperties,
    pub pictures: BTreeMap<String, Picture>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl Drop {
    pub fn new(mut url: Url) -> Self {
        url.set_fragment(None);
        let mut drop = Self {
            url: url.clone(),
            domain: String::new(),
            content_type: String::new(),
            charset: String::new(),
            document_type: String::new(),
            title: String::new(),
            description: String::new(),
            authors: Vec::new(),
            site: String::new(),
            site_name: String::new(),
            lang: String::new(),
            text_direction: String::new(),
            date: None,
            embed: String::new(),
            header: HeaderMap::new(),
            meta: DropMeta::default(),
            properties: DropProperties::new(),
            pictures: BTreeMap::new(),
            errors: Vec::new(),
            body: Vec::new(),
        };
        drop.set_url(url);
        drop
    }

    /// Replaces the URL and recomputes the registrable domain.
    pub fn set_url(&mut self, mut url: Url) {
        url.set_fragment(None);
        let host = url.host_str().unwrap_or_default().to_string();
        self.domain = psl::domain_str(&host).unwrap_or(&host).to_string();
        self.url = url;
    }

    /// The URL with percent-escapes decoded, for display and storage.
    pub fn unescaped_url(&self) -> String {
        String::from_utf8_lossy(&urlencoding::decode_binary(self.url.as_str().as_bytes())).into_owned()
    }

    pub fn is_html(&self) -> bool {
        matches!(
            self.content_type.as_str(),
            "text/html" | "application/xhtml+xml"
        )
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self.document_type.as_str(),
            "photo" | "video" | "audio" | "music"
        )
    }

    /// Adds authors, skipping case-insensitive duplicates and a leading
    /// "by". The list stays sorted.
    pub fn add_authors<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen: HashSet<String> = self.authors.iter().map(|a| a.to_lowercase()).collect();
        for value in values {
            let name = BY_PREFIX.replace(value.as_ref().trim(), "").trim().to_string();
            if name.is_empty() {
                continue;
            }
            if seen.insert(name.to_lowercase()) {
                self.authors.push(name);
            }
        }
        self.authors.sort();
    }

    /// Loads the document, unless a body is already present.
    ///
    /// HTML is converted to UTF-8, plain text is wrapped into an HTML
    /// document and an image turns the drop into a photo.
    pub async fn load(&mut self, client: &Client) -> FetchResult<()> {
        if !self.body.is_empty() {
            self.site = self.url.host_str().unwrap_or_default().to_string();
            self.content_type = "text/html".to_string();
            self.charset = "utf-8".to_string();
            return Ok(());
        }

        let rsp = client.get(&self.url).await?;
        self.header = rsp.headers.clone();
        self.set_url(rsp.url.clone());

        let (media_type, charset) = parse_content_type(rsp.content_type().unwrap_or_default());
        self.content_type = media_type;
        self.site = self.url.host_str().unwrap_or_default().to_string();

        if !rsp.status.is_success() {
            return Err(FetchError::Status(rsp.status.as_u16()));
        }

        if self.is_html() {
            self.load_html(&rsp.body, charset.as_deref());
        } else if self.content_type == "text/plain" {
            self.load_text(&rsp.body, charset.as_deref());
        } else if self.content_type.starts_with("image/") {
            self.load_image();
        }
        Ok(())
    }

    fn load_html(&mut self, body: &[u8], charset: Option<&str>) {
        let (text, encoding) = decode(body, charset);
        self.body = text.into_bytes();
        self.charset = encoding;
    }

    fn load_text(&mut self, body: &[u8], charset: Option<&str>) {
        let (text, _) = decode(body, charset);
        let title = title_from_path(&self.url);
        self.body = format!(
            "<html><head><title>{}</title></head><body><pre>{}</pre></body></html>",
            escape_html(&title),
            escape_html(&text)
        )
        .into_bytes();
        self.title = title;
        self.content_type = "text/html".to_string();
        self.charset = "utf-8".to_string();
    }

    fn load_image(&mut self) {
        self.meta.add("x.picture_url", self.url.as_str());
        self.title = title_from_path(&self.url);
        self.document_type = "photo".to_string();
    }
}

lazy_static! {
    static ref BY_PREFIX: Regex = Regex::new(r"(?i)^by:?\s+").unwrap();

    // <meta charset="x"> and <meta http-equiv="content-type" content="...; charset=x">
    static ref META_CHARSET: Regex = Regex::new(
        r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#
    ).unwrap();

    static ref SEPARATORS: Regex = Regex::new(r"[_-]+").unwrap();
}

/// Splits a Content-Type value into a lowercase media type and an optional
/// charset parameter.
pub fn parse_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let media_type = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let charset = parts.find_map(|p| {
        let (key, value) = p.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    });
    (media_type, charset)
}

/// Decodes `body` from the header charset, a `<meta>` declaration or
/// UTF-8, in that order. A byte order mark wins over all of them.
fn decode(body: &[u8], charset: Option<&str>) -> (String, String) {
    let sniffed;
    let label = match charset {
        Some(label) => Some(label),
        None => {
            let head = String::from_utf8_lossy(&body[..body.len().min(CHARSET_SNIFF_LEN)]);
            sniffed = META_CHARSET
                .captures(&head)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            sniffed.as_deref()
        }
    };

    let encoding = label
        .and_then(|l| Encoding::for_label(l.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, used, _) = encoding.decode(body);
    (text.into_owned(), used.name().to_ascii_lowercase())
}

/// "my_nice-file.txt" gives "my nice file.txt".
fn title_from_path(url: &Url) -> String {
    let name = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .unwrap_or_default();
    let name = urlencoding::decode_binary(name.as_bytes());
    let name = String::from_utf8_lossy(&name);
    SEPARATORS.replace_all(&name, " ").trim().to_string()
}

pub(crate) fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn serialize_headers<S: Serializer>(headers: &HeaderMap, s: S) -> Result<S::Ok, S::Error> {
    let mut map: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str()).or_default().push(value);
        }
    }
    map.serialize(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_new_drop() {
        let drop = Drop::new(url("https://www.example.co.uk/a%20b?x=1#frag"));
        assert_eq!(drop.url.as_str(), "https://www.example.co.uk/a%20b?x=1");
        assert_eq!(drop.domain, "example.co.uk");
        assert_eq!(drop.unescaped_url(), "https://www.example.co.uk/a b?x=1");
    }

    #[test]
    fn test_add_authors() {
        let mut drop = Drop::new(url("https://example.net/"));
        drop.add_authors(["By John Doe", "alice", "john doe", " ", "by: Bob"]);
        drop.add_authors(["ALICE"]);
        assert_eq!(drop.authors, vec!["Bob", "John Doe", "alice"]);
    }

    #[test]
    fn test_meta_lookup() {
        let mut meta = DropMeta::default();
        meta.add("html.title", "HTML title");
        meta.add("graph.title", "Graph title");
        meta.add("graph.title", "Other");

        assert_eq!(meta.lookup(&["twitter.title", "graph.title"]), &["Graph title", "Other"]);
        assert_eq!(meta.lookup_get(&["html.title", "graph.title"]), Some("HTML title"));
        assert_eq!(meta.lookup_get(&["nope"]), None);
    }

    #[test]
    fn test_parse_content_type() {
        assert_eq!(
            parse_content_type("Text/HTML; charset=\"ISO-8859-1\""),
            ("text/html".to_string(), Some("ISO-8859-1".to_string()))
        );
        assert_eq!(parse_content_type(""), (String::new(), None));
    }

    #[test]
    fn test_decode_meta_charset() {
        let body = b"<html><head><meta charset=\"windows-1252\"></head><body>caf\xe9</body></html>";
        let (text, charset) = decode(body, None);
        assert!(text.contains("café"));
        assert_eq!(charset, "windows-1252");

        let (text, charset) = decode("déjà".as_bytes(), None);
        assert_eq!(text, "déjà");
        assert_eq!(charset, "utf-8");
    }

    #[tokio::test]
    async fn test_load_html_from_header_charset() {
        let client = Client::new().unwrap();
        client.add_to_cache(
            "https://example.net/latin",
            [("Content-Type", "text/html; charset=iso-8859-1")],
            &b"<p>na\xefve</p>"[..],
        );

        let mut drop = Drop::new(url("https://example.net/latin"));
        drop.load(&client).await.unwrap();
        assert!(drop.is_html());
        assert_eq!(drop.charset, "windows-1252");
        assert_eq!(String::from_utf8(drop.body).unwrap(), "<p>naïve</p>");
        assert_eq!(drop.site, "example.net");
    }

    #[tokio::test]
    async fn test_load_text_plain() {
        let client = Client::new().unwrap();
        client.add_to_cache(
            "https://example.net/files/release_notes-v2.txt",
            [("Content-Type", "text/plain")],
            "a < b",
        );

        let mut drop = Drop::new(url("https://example.net/files/release_notes-v2.txt"));
        drop.load(&client).await.unwrap();
        assert_eq!(drop.content_type, "text/html");
        assert_eq!(drop.title, "release notes v2.txt");
        assert_eq!(
            String::from_utf8(drop.body).unwrap(),
            "<html><head><title>release notes v2.txt</title></head><body><pre>a &lt; b</pre></body></html>"
        );
    }

    #[tokio::test]
    async fn test_load_image() {
        let client = Client::new().unwrap();
        testing::cache_bytes(&client, "https://example.net/cat.png", "image/png", testing::png(2, 2));

        let mut drop = Drop::new(url("https://example.net/cat.png"));
        drop.load(&client).await.unwrap();
        assert!(drop.is_media());
        assert!(!drop.is_html());
        assert_eq!(drop.meta.lookup_get(&["x.picture_url"]), Some("https://example.net/cat.png"));
        assert!(drop.body.is_empty());
    }

    #[tokio::test]
    async fn test_prefilled_body_skips_fetch() {
        let client = Client::new().unwrap();
        let mut drop = Drop::new(url("https://example.net/inline"));
        drop.body = b"<p>inline</p>".to_vec();

        drop.load(&client).await.unwrap();
        assert_eq!(drop.content_type, "text/html");
        assert_eq!(drop.site, "example.net");
    }

    #[test]
    fn test_props_serialization() {
        let mut drop = Drop::new(url("https://example.net/"));
        drop.title = "Title".to_string();
        drop.meta.add("html.lang", "en");

        let json = serde_json::to_value(&drop).unwrap();
        assert_eq!(json["URL"], "https://example.net/");
        assert_eq!(json["Title"], "Title");
        assert_eq!(json["Meta"]["html.lang"][0], "en");
        assert!(json.get("Body").is_none());
    }
}
