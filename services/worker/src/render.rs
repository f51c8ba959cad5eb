//! Mask overlay rendering and PNG encoding.

use crate::mask::Mask;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::Rng;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// A random overlay colour
pub fn random_color(rng: &mut impl Rng) -> Rgb<u8> {
    Rgb([rng.gen(), rng.gen(), rng.gen()])
}

/// Composite each mask onto a copy of `image` at 50% opacity, one colour per mask.
///
/// Later masks are blended over earlier ones where they overlap. Masks that
/// do not match the image are resampled first.
pub fn overlay_masks(image: &RgbImage, masks: &[Mask], rng: &mut impl Rng) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut out = image.clone();
    for mask in masks {
        let resized;
        let mask = if mask.dimensions() == (w, h) {
            mask
        } else {
            resized = mask.resize_nearest(w, h);
            &resized
        };

        let color = random_color(rng);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            if mask.get(x as i64, y as i64) {
                for c in 0..3 {
                    let blended = color.0[c] as f64 * 0.5 + pixel.0[c] as f64 * 0.5;
                    pixel.0[c] = blended.round() as u8;
                }
            }
        }
    }
    out
}

/// Encode an RGB image as PNG bytes
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, RenderError> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone()).write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_overlay_blends_only_masked_pixels() {
        let image = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        let mask = Mask::from_fn(4, 4, |x, _| x < 2);
        let mut rng = StdRng::seed_from_u64(7);
        let color = random_color(&mut StdRng::seed_from_u64(7));

        let out = overlay_masks(&image, &[mask], &mut rng);
        let expected = |c: u8| ((c as f64 + 100.0) * 0.5).round() as u8;
        assert_eq!(
            out.get_pixel(0, 0).0,
            [expected(color.0[0]), expected(color.0[1]), expected(color.0[2])]
        );
        assert_eq!(out.get_pixel(3, 3).0, [100, 100, 100]);
    }

    #[test]
    fn test_overlay_resizes_small_masks() {
        let image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        // Left half at quarter resolution
        let mask = Mask::from_fn(2, 2, |x, _| x == 0);
        let out = overlay_masks(&image, &[mask], &mut StdRng::seed_from_u64(1));
        let color = random_color(&mut StdRng::seed_from_u64(1));
        let tinted = |c: u8| (c as f64 * 0.5).round() as u8;
        assert_eq!(out.get_pixel(3, 7).0[0], tinted(color.0[0]));
        assert_eq!(out.get_pixel(4, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_png_decodes_back() {
        let image = RgbImage::from_fn(5, 3, |x, y| Rgb([x as u8 * 40, y as u8 * 80, 7]));
        let png = encode_png(&image).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let decoded = image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(decoded, image);
    }
}
