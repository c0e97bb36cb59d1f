//! Page pictures (lead image and thumbnail).

use bytes::Bytes;
use reqwest::header;
use serde::Serialize;
use url::Url;

use super::client::{Client, RequestOptions};
use crate::error::{FetchError, PictureError};
use crate::img::{self, Image};

const ACCEPT_IMAGES: &str = "image/webp,image/svg+xml,image/*,*/*;q=0.8";

/// A remote picture, fitted and re-encoded once loaded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Picture {
    pub href: Url,
    #[serde(rename = "Type")]
    pub content_type: String,
    pub size: [u32; 2],
    /// Encoded format name, used as file extension
    pub format: String,
    #[serde(skip)]
    pub data: Bytes,
}

impl Picture {
    pub fn new(href: Url) -> Self {
        Self {
            href,
            content_type: String::new(),
            size: [0, 0],
            format: String::new(),
            data: Bytes::new(),
        }
    }

    /// File name of the picture inside an archive.
    pub fn name(&self, base: &str) -> String {
        format!("{base}.{}", self.format)
    }

    /// Fetches the picture and fits it into a `size` square.
    ///
    /// `to_format` forces an output format (`jpeg`, `png`, `webp`).
    pub async fn load(
        &mut self,
        client: &Client,
        size: u32,
        to_format: Option<&str>,
    ) -> Result<(), PictureError> {
        let options = RequestOptions::default().with_header(header::ACCEPT, ACCEPT_IMAGES);
        let rsp = client.send(&self.href, options).await?;
        if !rsp.status.is_success() {
            return Err(FetchError::Status(rsp.status.as_u16()).into());
        }

        let content_type = img::sniff(&rsp.body).ok_or(PictureError::NotAnImage)?;
        let format = to_format.map(str::to_string);

        let _permit = img::acquire().await?;
        let body = rsp.body;
        let fitted = tokio::task::spawn_blocking(move || {
            resize(content_type, &body, size, format.as_deref())
        })
        .await??;

        self.apply(fitted);
        Ok(())
    }

    /// Returns a smaller copy of a loaded picture.
    pub fn copy(&self, size: u32, to_format: Option<&str>) -> Result<Picture, PictureError> {
        let mut picture = Picture::new(self.href.clone());
        picture.apply(resize(&self.content_type, &self.data, size, to_format)?);
        Ok(picture)
    }

    fn apply(&mut self, fitted: Fitted) {
        self.content_type = fitted.content_type.to_string();
        self.format = fitted.format.to_string();
        self.size = fitted.size;
        self.data = Bytes::from(fitted.data);
    }
}

struct Fitted {
    data: Vec<u8>,
    content_type: &'static str,
    format: &'static str,
    size: [u32; 2],
}

fn resize(
    content_type: &str,
    data: &[u8],
    size: u32,
    to_format: Option<&str>,
) -> Result<Fitted, PictureError> {
    let mut im = Image::decode(content_type, data)?;
    img::pipeline(
        &mut im,
        &[&|im| {
            im.fit(size, size);
            if let Some(format) = to_format {
                im.set_format(format);
            }
            Ok(())
        }],
    )?;

    Ok(Fitted {
        data: im.encode()?,
        content_type: im.content_type(),
        format: im.format_name(),
        size: [im.width(), im.height()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn test_load_and_copy() {
        let client = Client::new().unwrap();
        testing::cache_bytes(&client, "https://example.net/lead.png", "image/png", testing::png(1600, 800));

        let mut picture = Picture::new(Url::parse("https://example.net/lead.png").unwrap());
        picture.load(&client, 800, None).await.unwrap();
        assert_eq!(picture.size, [800, 400]);
        assert_eq!(picture.content_type, "image/png");
        assert_eq!(picture.name("image"), "image.png");

        let thumbnail = picture.copy(380, Some("jpeg")).unwrap();
        assert_eq!(thumbnail.size, [380, 190]);
        assert_eq!(thumbnail.name("thumbnail"), "thumbnail.jpeg");
        assert_eq!(img::sniff(&thumbnail.data), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_load_rejects_non_image() {
        let client = Client::new().unwrap();
        testing::cache_html(&client, "https://example.net/lead.png", "<p>nope</p>");

        let mut picture = Picture::new(Url::parse("https://example.net/lead.png").unwrap());
        assert!(matches!(
            picture.load(&client, 800, None).await,
            Err(PictureError::NotAnImage)
        ));
    }
}
