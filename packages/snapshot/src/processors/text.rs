use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html};

use crate::extract::{Extractor, Flow, ProcessMessage, Processor, Step};

const BLOCKS: &[&str] = &[
    "address", "article", "aside", "blockquote", "dd", "div", "dl", "dt", "figcaption", "figure",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol", "p",
    "pre", "section", "table", "td", "th", "tr", "ul",
];

const SKIPPED: &[&str] = &["script", "style", "noscript", "template", "head"];

lazy_static! {
    static ref SPACES: Regex = Regex::new(r"[ \t\r\f\u{a0}]+").unwrap();
    static ref NEWLINES: Regex = Regex::new(r"\n{3,}").unwrap();
}

/// Sets [`Extractor::text`] from the final HTML.
pub struct ExtractText;

#[async_trait]
impl Processor for ExtractText {
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        if m.step() != Step::PostProcess || !ex.first_drop().is_html() || ex.html.is_empty() {
            return Flow::Continue;
        }

        ex.text = html_text(&String::from_utf8_lossy(&ex.html));
        m.log().debug("text extracted", &[("length", &ex.text.len())]);
        Flow::Continue
    }
}

/// Plain text of an HTML fragment, one paragraph per block element.
pub fn html_text(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut out = String::new();
    walk(doc.root_element(), &mut out);

    let lines: Vec<String> = SPACES
        .replace_all(&out, " ")
        .lines()
        .map(|l| l.trim().to_string())
        .collect();
    NEWLINES.replace_all(&lines.join("\n"), "\n\n").trim().to_string()
}

fn walk(el: ElementRef, out: &mut String) {
    let name = el.value().name();
    if SKIPPED.contains(&name) {
        return;
    }
    if name == "br" {
        out.push('\n');
        return;
    }

    let block = BLOCKS.contains(&name);
    if block {
        out.push_str("\n\n");
    }
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(&text.replace('\n', " "));
        } else if let Some(child) = ElementRef::wrap(child) {
            walk(child, out);
        }
    }
    if block {
        out.push_str("\n\n");
    }
}
