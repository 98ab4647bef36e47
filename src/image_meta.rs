use image::ImageReader;
use std::io::Cursor;

use crate::model::ImageMeta;
use crate::{Error, Result};

/// Turns downloaded image bytes into metadata.
pub trait ImageDecoder {
    fn decode(&self, url: &str, bytes: &[u8]) -> Result<ImageMeta>;
}

/// Reads dimensions from the image header and the byte size. EXIF fields are
/// left empty; plug in a richer decoder to fill them.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicImageDecoder;

impl ImageDecoder for BasicImageDecoder {
    fn decode(&self, url: &str, bytes: &[u8]) -> Result<ImageMeta> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| Error::Decode(format!("{url}: {e}")))?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| Error::Decode(format!("{url}: {e}")))?;

        Ok(ImageMeta {
            width,
            height,
            file_size: bytes.len() as u64,
            ..ImageMeta::default()
        })
    }
}
