//! Document metadata: `<title>`, `<meta>` pairs, JSON-LD.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use scraper::{Html, Selector};
use serde_json::{json, Value};

use crate::extract::{Drop, Extractor, Flow, ProcessMessage, Processor, Step};

lazy_static! {
    static ref HTML: Selector = Selector::parse("html").unwrap();
    static ref TITLE: Selector = Selector::parse("head title, title").unwrap();
    static ref META: Selector = Selector::parse("meta[content]").unwrap();
    static ref JSON_LD: Selector = Selector::parse(r#"script[type="application/ld+json"]"#).unwrap();
}

/// Metadata read from a parsed document.
#[derive(Debug, Default)]
pub struct PageMeta {
    /// `(key, value)` pairs, keys prefixed by origin (`html.`, `graph.`, ...)
    pub entries: Vec<(String, String)>,
    pub json_ld: Vec<Value>,
}

impl PageMeta {
    pub fn get(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| {
            self.entries
                .iter()
                .find(|(k, v)| k == name && !v.is_empty())
                .map(|(_, v)| v.as_str())
        })
    }
}

/// Reads `<html lang|dir>`, `<title>`, every `<meta>` with content and
/// JSON-LD scripts.
pub fn read_meta(doc: &Html) -> PageMeta {
    let mut meta = PageMeta::default();

    if let Some(html) = doc.select(&HTML).next() {
        for attr in ["lang", "dir"] {
            if let Some(value) = html.value().attr(attr) {
                meta.entries.push((format!("html.{attr}"), value.trim().to_string()));
            }
        }
    }

    if let Some(title) = doc.select(&TITLE).next() {
        let text = title.text().collect::<String>();
        meta.entries.push(("html.title".to_string(), text.trim().to_string()));
    }

    for el in doc.select(&META) {
        let el = el.value();
        let Some(content) = el.attr("content") else {
            continue;
        };
        let Some(name) = el.attr("property").or_else(|| el.attr("name")) else {
            continue;
        };

        let name = name.trim().to_ascii_lowercase();
        let key = if let Some(rest) = name.strip_prefix("og:") {
            format!("graph.{rest}")
        } else if let Some(rest) = name.strip_prefix("twitter:") {
            format!("twitter.{rest}")
        } else if let Some(rest) = name.strip_prefix("article:") {
            format!("article.{rest}")
        } else {
            format!("html.{name}")
        };
        meta.entries.push((key, content.trim().to_string()));
    }

    for script in doc.select(&JSON_LD) {
        let text = script.text().collect::<String>();
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => meta.json_ld.extend(items),
            Ok(value) => meta.json_ld.push(value),
            Err(_) => {}
        }
    }

    meta
}

/// Fills the first drop's metadata from its document.
pub struct ExtractMeta;

#[async_trait]
impl Processor for ExtractMeta {
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        if m.step() != Step::Dom || m.position() > 0 {
            return Flow::Continue;
        }
        let Some(doc) = m.dom.as_ref() else {
            return Flow::Continue;
        };

        let meta = read_meta(doc);
        let count = meta.entries.len();
        apply_meta(ex.first_drop_mut(), meta);

        m.log().debug("metadata extracted", &[("count", &count)]);
        Flow::Continue
    }
}

fn apply_meta(drop: &mut Drop, meta: PageMeta) {
    for (key, value) in &meta.entries {
        drop.meta.add(key, value.clone());
    }

    if drop.title.is_empty() {
        if let Some(title) = meta.get(&["graph.title", "twitter.title", "html.title"]) {
            drop.title = title.to_string();
        }
    }
    if drop.description.is_empty() {
        if let Some(desc) = meta.get(&["graph.description", "twitter.description", "html.description"]) {
            drop.description = desc.to_string();
        }
    }
    if let Some(site_name) = meta.get(&["graph.site_name", "html.application-name"]) {
        drop.site_name = site_name.to_string();
    }
    if let Some(lang) = meta.get(&["html.lang", "graph.locale"]) {
        drop.lang = lang
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
    }
    if let Some(dir) = meta.get(&["html.dir"]) {
        let dir = dir.to_ascii_lowercase();
        if dir == "rtl" || dir == "ltr" {
            drop.text_direction = dir;
        }
    }

    if drop.document_type.is_empty() {
        let og_type = meta.get(&["graph.type"]).unwrap_or_default();
        drop.document_type = document_type(og_type).to_string();
    }
    if drop.document_type == "video" && drop.embed.is_empty() {
        if let Some(player) = meta.get(&["twitter.player", "graph.video:secure_url"]) {
            drop.embed = format!(
                r#"<iframe src="{}" allowfullscreen></iframe>"#,
                player.replace('"', "&quot;")
            );
        }
    }

    let mut authors: Vec<String> = meta
        .entries
        .iter()
        .filter(|(k, _)| k == "html.author" || k == "article.author")
        .filter(|(_, v)| !v.starts_with("http"))
        .map(|(_, v)| v.clone())
        .collect();
    authors.extend(meta.json_ld.iter().flat_map(json_ld_authors));
    drop.add_authors(authors);

    if drop.date.is_none() {
        let published = meta
            .get(&["article.published_time", "html.date", "html.dc.date"])
            .map(str::to_string)
            .or_else(|| {
                meta.json_ld
                    .iter()
                    .find_map(|v| v.get("datePublished")?.as_str().map(str::to_string))
            });
        drop.date = published.as_deref().and_then(parse_date);
    }

    if !meta.json_ld.is_empty() {
        drop.properties.insert("json-ld".to_string(), Value::Array(meta.json_ld));
    }
    let pairs: Vec<Value> = meta
        .entries
        .iter()
        .map(|(k, v)| json!({ "name": k, "content": v }))
        .collect();
    drop.properties.insert("meta".to_string(), Value::Array(pairs));
}

fn document_type(og_type: &str) -> &'static str {
    let og_type = og_type.to_ascii_lowercase();
    if og_type.starts_with("video") {
        "video"
    } else if og_type.starts_with("music") {
        "music"
    } else if og_type == "photo" || og_type == "image" {
        "photo"
    } else {
        "article"
    }
}

fn json_ld_authors(value: &Value) -> Vec<String> {
    match value.get("author") {
        Some(Value::String(name)) => vec![name.clone()],
        Some(Value::Object(author)) => author
            .get("name")
            .and_then(Value::as_str)
            .map(|n| vec![n.to_string()])
            .unwrap_or_default(),
        Some(Value::Array(authors)) => authors
            .iter()
            .filter_map(|a| match a {
                Value::String(name) => Some(name.clone()),
                a => a.get("name")?.as_str().map(str::to_string),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    let day = value.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}
