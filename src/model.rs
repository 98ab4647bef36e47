use chrono::{DateTime, FixedOffset};

pub type PostId = i64;
pub type ImageId = i64;

/// A blog post as recorded in the store. The URL is the natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub url: String,
    pub title: String,
    pub published: Option<DateTime<FixedOffset>>,
    pub modified: Option<DateTime<FixedOffset>>,
    pub tags: Vec<String>,
}

/// Everything extracted from one post page.
#[derive(Debug, Clone, PartialEq)]
pub struct PostDocument {
    pub post: Post,
    pub images: Vec<String>,
}

/// Decoded image metadata. EXIF-derived fields stay `None` when the decoder
/// cannot provide them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub camera_model: Option<String>,
    pub focal_length: Option<f64>,
    pub exposure_time: Option<f64>,
    pub date_time: Option<DateTime<FixedOffset>>,
    pub aperture_value: Option<f64>,
    pub iso: Option<u32>,
}

/// An image row. `(post_id, url)` is the natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub post_id: PostId,
    pub url: String,
    pub meta: ImageMeta,
}
