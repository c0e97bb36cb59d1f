//! `url()` references in stylesheets and `style` attributes.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref CSS_URL: Regex =
        Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#).unwrap();
}

fn value<'a>(c: &'a Captures) -> &'a str {
    c.get(1)
        .or_else(|| c.get(2))
        .or_else(|| c.get(3))
        .map_or("", |m| m.as_str())
}

/// Every `url()` value, in order of appearance.
pub fn urls(css: &str) -> Vec<String> {
    CSS_URL
        .captures_iter(css)
        .map(|c| value(&c).trim().to_string())
        .filter(|u| !u.is_empty())
        .collect()
}

/// Replaces each `url()` value for which `replace` returns a new URL.
pub fn rewrite(css: &str, replace: impl Fn(&str) -> Option<String>) -> String {
    CSS_URL
        .replace_all(css, |c: &Captures| match replace(value(c).trim()) {
            Some(url) => format!("url(\"{}\")", url.replace('"', "%22")),
            None => c[0].to_string(),
        })
        .into_owned()
}
