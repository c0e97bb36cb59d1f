use async_trait::async_trait;

use crate::extract::{Extractor, Flow, Picture, ProcessMessage, Processor, Step};

const PICTURE_SIZE: u32 = 800;
const PHOTO_SIZE: u32 = 1280;
const THUMBNAIL_SIZE: u32 = 380;

/// Loads the lead picture of the first drop and makes a thumbnail of it.
///
/// A missing or broken picture only logs a warning.
pub struct ExtractPicture;

#[async_trait]
impl Processor for ExtractPicture {
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        if m.step() != Step::Finish || m.position() > 0 || m.is_rewound() {
            return Flow::Continue;
        }

        let drop = ex.first_drop();
        let Some(href) = drop
            .meta
            .lookup_get(&["x.picture_url", "graph.image", "twitter.image", "oembed.thumbnail_url"])
            .and_then(|href| drop.url.join(href).ok())
        else {
            return Flow::Continue;
        };
        let size = if drop.document_type == "photo" {
            PHOTO_SIZE
        } else {
            PICTURE_SIZE
        };

        let mut picture = Picture::new(href);
        if let Err(err) = picture.load(ex.client(), size, None).await {
            m.log().warn("cannot load picture", &[("url", &picture.href), ("err", &err)]);
            return Flow::Continue;
        }

        let thumbnail = picture.copy(THUMBNAIL_SIZE, None);
        let drop = ex.first_drop_mut();
        drop.pictures.insert("image".to_string(), picture);
        match thumbnail {
            Ok(thumbnail) => {
                drop.pictures.insert("thumbnail".to_string(), thumbnail);
            }
            Err(err) => m.log().warn("cannot create thumbnail", &[("err", &err)]),
        }

        m.log().debug("picture loaded", &[("size", &size)]);
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractorOptions;
    use crate::processors::ExtractMeta;
    use crate::testing;

    #[tokio::test]
    async fn test_picture_from_graph_image() {
        let mut ex = Extractor::new("https://example.net/post", ExtractorOptions::default()).unwrap();
        testing::cache_html(
            ex.client(),
            "https://example.net/post",
            r#"<html><head><meta property="og:image" content="/img/lead.jpg"></head><body><p>x</p></body></html>"#,
        );
        testing::cache_bytes(ex.client(), "https://example.net/img/lead.jpg", "image/jpeg", testing::jpeg(1000, 500));

        ex.add_processor(ExtractMeta);
        ex.add_processor(ExtractPicture);
        ex.run().await.unwrap();

        let pictures = &ex.first_drop().pictures;
        assert_eq!(pictures["image"].size, [800, 400]);
        assert_eq!(pictures["image"].format, "jpeg");
        assert_eq!(pictures["thumbnail"].size, [380, 190]);
    }

    #[tokio::test]
    async fn test_photo_drop_is_its_own_picture() {
        let mut ex = Extractor::new("https://example.net/photo.png", ExtractorOptions::default()).unwrap();
        testing::cache_bytes(ex.client(), "https://example.net/photo.png", "image/png", testing::png(2000, 1000));

        ex.add_processor(ExtractPicture);
        ex.run().await.unwrap();

        let drop = ex.first_drop();
        assert_eq!(drop.document_type, "photo");
        assert_eq!(drop.pictures["image"].size, [1280, 640]);
        assert_eq!(drop.pictures["thumbnail"].size, [380, 190]);
    }

    #[tokio::test]
    async fn test_broken_picture_is_a_warning() {
        let mut ex = Extractor::new("https://example.net/post", ExtractorOptions::default()).unwrap();
        testing::cache_html(
            ex.client(),
            "https://example.net/post",
            r#"<html><head><meta property="og:image" content="https://example.net/lead.png"></head><body></body></html>"#,
        );
        testing::cache_bytes(ex.client(), "https://example.net/lead.png", "image/png", b"not an image".to_vec());

        ex.add_processor(ExtractMeta);
        ex.add_processor(ExtractPicture);
        ex.run().await.unwrap();

        assert!(ex.first_drop().pictures.is_empty());
        assert!(ex.errors().is_empty());
        assert!(ex.logs().iter().any(|l| l.starts_with("[WARN] cannot load picture")));
    }
}
