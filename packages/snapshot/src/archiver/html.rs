//! Finds and rewrites resource references in an HTML document.
//!
//! Both passes share the same table of references so that every value the
//! collector reports is a value the rewriter can replace.

use std::cell::RefCell;

use lol_html::html_content::ContentType;
use lol_html::errors::RewritingError;
use lol_html::{element, rewrite_str, text, RewriteStrSettings};

use super::{css, srcset, ArchiveFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Images,
    Media,
    Css,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
    Url,
    Srcset,
    Style,
}

struct Rule {
    selector: &'static str,
    attr: &'static str,
    value: Value,
    group: Group,
}

const RULES: &[Rule] = &[
    Rule { selector: "img[src]", attr: "src", value: Value::Url, group: Group::Images },
    Rule { selector: "img[srcset]", attr: "srcset", value: Value::Srcset, group: Group::Images },
    Rule { selector: "picture source[srcset]", attr: "srcset", value: Value::Srcset, group: Group::Images },
    Rule { selector: "video[poster]", attr: "poster", value: Value::Url, group: Group::Images },
    Rule { selector: "link[rel~=icon][href]", attr: "href", value: Value::Url, group: Group::Images },
    Rule { selector: "video[src]", attr: "src", value: Value::Url, group: Group::Media },
    Rule { selector: "audio[src]", attr: "src", value: Value::Url, group: Group::Media },
    Rule { selector: "video source[src]", attr: "src", value: Value::Url, group: Group::Media },
    Rule { selector: "audio source[src]", attr: "src", value: Value::Url, group: Group::Media },
    Rule { selector: "link[rel~=stylesheet][href]", attr: "href", value: Value::Url, group: Group::Css },
    Rule { selector: "[style]", attr: "style", value: Value::Style, group: Group::Css },
];

impl Rule {
    fn enabled(&self, flags: ArchiveFlags) -> bool {
        match self.group {
            Group::Images => flags.images,
            Group::Media => flags.media,
            Group::Css => flags.css,
        }
    }

    /// `<img src>` targets must be images and get their final size.
    fn is_img(&self) -> bool {
        self.selector == "img[src]"
    }
}

/// A raw reference, as written in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub raw: String,
    pub is_img: bool,
}

/// What a reference turns into once archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    pub url: String,
    pub size: Option<(u32, u32)>,
}

fn raw_values(value: Value, attr: &str) -> Vec<String> {
    match value {
        Value::Url => vec![attr.trim().to_string()],
        Value::Srcset => srcset::parse(attr).into_iter().map(|c| c.url).collect(),
        Value::Style => css::urls(attr),
    }
}

/// Lists the references of every enabled kind.
pub fn collect(html: &str, flags: ArchiveFlags) -> Result<Vec<Reference>, RewritingError> {
    let refs = RefCell::new(Vec::new());
    let style = RefCell::new(String::new());
    let mut handlers = Vec::new();

    for rule in RULES.iter().filter(|r| r.enabled(flags)) {
        let refs = &refs;
        handlers.push(element!(rule.selector, move |el| {
            if let Some(value) = el.get_attribute(rule.attr) {
                refs.borrow_mut().extend(raw_values(rule.value, &value).into_iter().map(|raw| Reference {
                    raw,
                    is_img: rule.is_img(),
                }));
            }
            Ok(())
        }));
    }

    if flags.css {
        handlers.push(text!("style", |t| {
            style.borrow_mut().push_str(t.as_str());
            if t.last_in_text_node() {
                let text = std::mem::take(&mut *style.borrow_mut());
                refs.borrow_mut()
                    .extend(css::urls(&text).into_iter().map(|raw| Reference { raw, is_img: false }));
            }
            Ok(())
        }));
    }

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )?;

    Ok(refs.into_inner())
}

/// Replaces every reference `lookup` knows about. Unknown references are
/// left as they are.
pub fn rewrite(
    html: &str,
    flags: ArchiveFlags,
    lookup: &dyn Fn(&str) -> Option<Local>,
) -> Result<String, RewritingError> {
    let style = RefCell::new(String::new());
    let mut handlers = Vec::new();

    for rule in RULES.iter().filter(|r| r.enabled(flags)) {
        handlers.push(element!(rule.selector, move |el| {
            let Some(value) = el.get_attribute(rule.attr) else {
                return Ok(());
            };

            match rule.value {
                Value::Url => {
                    if let Some(local) = lookup(value.trim()) {
                        el.set_attribute(rule.attr, &local.url)?;
                        if let (true, Some((w, h))) = (rule.is_img(), local.size) {
                            el.set_attribute("width", &w.to_string())?;
                            el.set_attribute("height", &h.to_string())?;
                        }
                    }
                }
                Value::Srcset => {
                    let mut candidates = srcset::parse(&value);
                    for c in candidates.iter_mut() {
                        if let Some(local) = lookup(&c.url) {
                            c.url = local.url;
                        }
                    }
                    el.set_attribute(rule.attr, &srcset::render(&candidates))?;
                }
                Value::Style => {
                    let css = css::rewrite(&value, |raw| lookup(raw).map(|l| l.url));
                    el.set_attribute(rule.attr, &css)?;
                }
            }
            Ok(())
        }));
    }

    if flags.css {
        handlers.push(text!("style", |t| {
            style.borrow_mut().push_str(t.as_str());
            if t.last_in_text_node() {
                let text = std::mem::take(&mut *style.borrow_mut());
                let css = css::rewrite(&text, |raw| lookup(raw).map(|l| l.url));
                t.replace(&css, ContentType::Html);
            } else {
                t.remove();
            }
            Ok(())
        }));
    }

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<p><img src=" /a.png " srcset="/a.png 1x, /a@2x.png 2x"></p>
<picture><source srcset="/b.webp"><img src="/b.jpg"></picture>
<video poster="/poster.jpg" src="/clip.mp4"><source src="/clip.webm"></video>
<div style="background: url('/bg.png')"></div>
<style>.x { background: url(/x.png) }</style>"#;

    fn raws(flags: ArchiveFlags) -> Vec<String> {
        collect(PAGE, flags).unwrap().into_iter().map(|r| r.raw).collect()
    }

    #[test]
    fn test_collect_by_flags() {
        assert_eq!(
            raws(ArchiveFlags::images_only()),
            vec!["/a.png", "/a.png", "/a@2x.png", "/b.webp", "/b.jpg", "/poster.jpg"]
        );

        let all = raws(ArchiveFlags::all());
        for raw in ["/clip.mp4", "/clip.webm", "/bg.png", "/x.png"] {
            assert!(all.contains(&raw.to_string()), "missing {raw}");
        }

        let refs = collect(PAGE, ArchiveFlags::images_only()).unwrap();
        assert!(refs[0].is_img);
        assert!(!refs[1].is_img);
    }

    #[test]
    fn test_rewrite() {
        let lookup = |raw: &str| match raw {
            "/a.png" => Some(Local {
                url: "./_resources/a.png".to_string(),
                size: Some((10, 5)),
            }),
            "/bg.png" | "/x.png" => Some(Local {
                url: format!("./_resources{raw}"),
                size: None,
            }),
            _ => None,
        };
        let out = rewrite(PAGE, ArchiveFlags::all(), &lookup).unwrap();

        assert!(out.contains(
            r#"<img src="./_resources/a.png" srcset="./_resources/a.png 1x, /a@2x.png 2x" width="10" height="5">"#
        ));
        assert!(out.contains(r#"<img src="/b.jpg">"#));
        assert!(out.contains("./_resources/bg.png"));
        assert!(out.contains(r#"<style>.x { background: url("./_resources/x.png") }</style>"#));
    }

    #[test]
    fn test_rewrite_leaves_disabled_kinds() {
        let out = rewrite(PAGE, ArchiveFlags::images_only(), &|_| {
            Some(Local {
                url: "local".to_string(),
                size: None,
            })
        })
        .unwrap();
        assert!(out.contains(r#"src="/clip.mp4""#));
        assert!(out.contains("url(/x.png)"));
        assert!(out.contains(r#"poster="local""#));
    }
}
