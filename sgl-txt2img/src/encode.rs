use std::io::Cursor;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use image::{ImageFormat, RgbImage};

#[derive(Debug, thiserror::Error)]
#[error("PNG encoding failed: {0}")]
pub struct EncodeError(#[from] image::ImageError);

/// PNG-encode `image` and return it as standard base64 with padding.
pub fn png_base64(image: &RgbImage) -> Result<String, EncodeError> {
    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(png.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_png_base64_decodes_to_same_pixels() {
        let image = RgbImage::from_fn(16, 8, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 7]));
        let encoded = png_base64(&image).unwrap();

        let bytes = BASE64_STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
            .unwrap()
            .to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 8));
        assert_eq!(decoded, image);
    }

    #[test]
    fn test_png_base64_is_deterministic() {
        let image = RgbImage::from_pixel(32, 32, Rgb([12, 34, 56]));
        assert_eq!(png_base64(&image).unwrap(), png_base64(&image).unwrap());
    }
}
