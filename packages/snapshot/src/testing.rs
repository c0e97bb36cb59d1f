//! Fixtures for tests: generated images, HTML documents and cache seeding.
//!
//! Tests never touch the network; pages and resources are served from the
//! client cache.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::extract::Client;

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    if img.write_to(&mut buf, format).is_err() {
        return Vec::new();
    }
    buf.into_inner()
}

/// A PNG image of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Png)
}

/// A JPEG image of the given size.
pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Jpeg)
}

/// A complete HTML document.
pub fn html_page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\"><head><meta charset=\"utf-8\"><title>{title}</title></head>\n<body>{body}</body></html>"
    )
}

/// Serves `html` as `text/html` for `url`.
pub fn cache_html(client: &Client, url: &str, html: &str) {
    client.add_to_cache(
        url,
        [("Content-Type", "text/html; charset=utf-8")],
        html.to_string(),
    );
}

/// Serves `data` with `content_type` for `url`.
pub fn cache_bytes(client: &Client, url: &str, content_type: &str, data: Vec<u8>) {
    client.add_to_cache(url, [("Content-Type", content_type)], data);
}
