//! JPEG encoding shared by the forwarders.

use super::ConsumerError;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// Encode an RGB8 image as JPEG at the given quality (clamped to 1-100)
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ConsumerError> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| ConsumerError::Encode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_is_jpeg() {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([200, 30, 30]));
        let bytes = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_quality_is_clamped() {
        let image = RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]));
        assert!(encode_jpeg(&image, 0).is_ok());
        assert!(encode_jpeg(&image, 255).is_ok());
    }
}
