//! Frame payload codec.
//!
//! Viewers send frames as base64 images, optionally wrapped in a `data:` URL.
//! Frames are decoded once into RGB and handed to the detection collaborators;
//! annotated results go back as JPEG data URLs.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// Upper bound on the base64 text of one frame.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;
/// Frames larger than this on either side are refused.
pub const MAX_DIMENSION: u32 = 4096;
pub const RESULT_JPEG_QUALITY: u8 = 60;

/// A decoded RGB frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn from_rgb(image: RgbImage) -> Self {
        Self { image }
    }

    /// Black frame, mostly useful for tests and the demo.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::from_rgb(RgbImage::new(width, height))
    }

    /// Decode a base64 payload or `data:image/...;base64,` URL.
    pub fn decode(payload: &str) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(anyhow!(
                "frame payload too large ({} bytes, limit {})",
                payload.len(),
                MAX_PAYLOAD_BYTES
            ));
        }
        let encoded = strip_data_url(payload)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("frame payload is not valid base64")?;
        Self::from_encoded(&bytes)
    }

    /// Decode raw JPEG/PNG bytes.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("failed to decode frame image")?;
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("frame has zero size"));
        }
        if image.width() > MAX_DIMENSION || image.height() > MAX_DIMENSION {
            return Err(anyhow!(
                "frame {}x{} exceeds {}px limit",
                image.width(),
                image.height(),
                MAX_DIMENSION
            ));
        }
        Ok(Self::from_rgb(image.to_rgb8()))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

/// Accepts `data:<mime>;base64,<data>` or bare base64 and returns the base64 part.
pub fn strip_data_url(payload: &str) -> Result<&str> {
    match payload.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest
                .split_once(',')
                .ok_or_else(|| anyhow!("data url without payload"))?;
            if !meta.ends_with(";base64") {
                return Err(anyhow!("data url must be base64 encoded"));
            }
            Ok(data)
        }
        None => Ok(payload),
    }
}

/// Encode as a JPEG `data:` URL.
pub fn encode_jpeg_data_url(image: &RgbImage, quality: u8) -> Result<String> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .context("failed to encode jpeg")?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&buf)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn png_base64(w: u32, h: u32) -> String {
        let img = RgbImage::from_pixel(w, h, Rgb([10, 200, 30]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        base64::engine::general_purpose::STANDARD.encode(buf.into_inner())
    }

    #[test]
    fn decodes_bare_and_data_url_payloads() {
        let b64 = png_base64(8, 6);
        let bare = Frame::decode(&b64).unwrap();
        assert_eq!((bare.width(), bare.height()), (8, 6));
        let url = format!("data:image/png;base64,{}", b64);
        let framed = Frame::decode(&url).unwrap();
        assert_eq!(framed.image().get_pixel(0, 0), &Rgb([10, 200, 30]));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Frame::decode("not base64 at all!").is_err());
        assert!(Frame::decode("aGVsbG8=").is_err());
        assert!(Frame::decode("data:image/png,abc").is_err());
        assert!(Frame::decode("data:image/png;base64").is_err());
    }

    #[test]
    fn jpeg_round_trip_keeps_size() {
        let frame = Frame::blank(40, 30);
        let url = encode_jpeg_data_url(frame.image(), RESULT_JPEG_QUALITY).unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
        let back = Frame::decode(&url).unwrap();
        assert_eq!((back.width(), back.height()), (40, 30));
    }
}
