//! Reference-object calibration.
//!
//! Finds a circular object of known hue (red by default) and reports its
//! pixel radius. A miss is a normal outcome: the measurement then stays in
//! pixel units.

use crate::geometry::{arc_length, circularity, contour_area, external_contours, min_enclosing_circle};
use crate::mask::Mask;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Detector tunables. Hue uses the half-degree 0..=180 scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Upper edge of the low red band `[0, low_hue_max]`
    #[serde(default = "default_low_hue_max")]
    pub low_hue_max: u8,
    /// Lower edge of the high red band `[high_hue_min, 180]`
    #[serde(default = "default_high_hue_min")]
    pub high_hue_min: u8,
    #[serde(default = "default_min_saturation")]
    pub min_saturation: u8,
    #[serde(default = "default_min_value")]
    pub min_value: u8,
    /// Side of the square structuring element
    #[serde(default = "default_kernel_size")]
    pub kernel_size: u32,
    /// Minimum contour area, px²
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    #[serde(default = "default_min_circularity")]
    pub min_circularity: f64,
}

fn default_low_hue_max() -> u8 {
    10
}

fn default_high_hue_min() -> u8 {
    170
}

fn default_min_saturation() -> u8 {
    120
}

fn default_min_value() -> u8 {
    70
}

fn default_kernel_size() -> u32 {
    5
}

fn default_min_area() -> f64 {
    100.0
}

fn default_min_circularity() -> f64 {
    0.7
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            low_hue_max: default_low_hue_max(),
            high_hue_min: default_high_hue_min(),
            min_saturation: default_min_saturation(),
            min_value: default_min_value(),
            kernel_size: default_kernel_size(),
            min_area: default_min_area(),
            min_circularity: default_min_circularity(),
        }
    }
}

/// Result of one detection pass; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationReading {
    pub found: bool,
    pub center: (f64, f64),
    pub pixel_radius: f64,
}

impl CalibrationReading {
    pub fn not_found() -> Self {
        Self {
            found: false,
            center: (0.0, 0.0),
            pixel_radius: 0.0,
        }
    }

    /// Linear pixel → physical factor, when a reference was found and a
    /// physical radius is known
    pub fn scale_factor(&self, real_radius: Option<f64>) -> Option<f64> {
        let real = real_radius?;
        (self.found && self.pixel_radius > 0.0 && real > 0.0).then(|| real / self.pixel_radius)
    }
}

/// 8-bit HSV with hue in 0..=180
pub(crate) fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f64, g as f64, b as f64);
    let v = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let diff = v - min;

    let s = if v > 0.0 { diff / v * 255.0 } else { 0.0 };
    let h = if diff == 0.0 {
        0.0
    } else if v == rf {
        60.0 * (gf - bf) / diff
    } else if v == gf {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    ((h / 2.0).round() as u8, s.round() as u8, v as u8)
}

fn erode(mask: &Mask, kernel: u32) -> Mask {
    morph(mask, kernel, true)
}

fn dilate(mask: &Mask, kernel: u32) -> Mask {
    morph(mask, kernel, false)
}

/// Separable rectangular erosion/dilation; pixels past the border are ignored
fn morph(mask: &Mask, kernel: u32, erode: bool) -> Mask {
    let r = (kernel / 2) as i64;
    let (w, h) = mask.dimensions();
    let window = |center: i64, len: u32, sample: &dyn Fn(i64) -> bool| {
        let lo = (center - r).max(0);
        let hi = (center + r).min(len as i64 - 1);
        if erode {
            (lo..=hi).all(sample)
        } else {
            (lo..=hi).any(sample)
        }
    };

    let horizontal = Mask::from_fn(w, h, |x, y| {
        window(x as i64, w, &|sx| mask.get(sx, y as i64))
    });
    Mask::from_fn(w, h, |x, y| {
        window(y as i64, h, &|sy| horizontal.get(x as i64, sy))
    })
}

/// Detects the calibration object
pub struct Calibrator {
    config: CalibrationConfig,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Binary mask of pixels inside either red hue band
    pub fn hue_mask(&self, image: &RgbImage) -> Mask {
        let (w, h) = image.dimensions();
        Mask::from_fn(w, h, |x, y| {
            let [r, g, b] = image.get_pixel(x, y).0;
            let (hue, sat, val) = rgb_to_hsv(r, g, b);
            let in_band = hue <= self.config.low_hue_max || hue >= self.config.high_hue_min;
            in_band && sat >= self.config.min_saturation && val >= self.config.min_value
        })
    }

    pub fn detect(&self, image: &RgbImage) -> CalibrationReading {
        let k = self.config.kernel_size;
        let raw = self.hue_mask(image);
        let opened = dilate(&erode(&raw, k), k);
        let cleaned = erode(&dilate(&opened, k), k);

        let mut best: Option<CalibrationReading> = None;
        for contour in external_contours(&cleaned) {
            let area = contour_area(&contour);
            let perimeter = arc_length(&contour);
            if area < self.config.min_area || perimeter == 0.0 {
                continue;
            }

            let roundness = circularity(area, perimeter);
            if roundness <= self.config.min_circularity {
                debug!(area, roundness, "Rejected non-circular reference candidate");
                continue;
            }

            let Some(circle) = min_enclosing_circle(&contour) else {
                continue;
            };
            if best.map_or(true, |b| circle.radius > b.pixel_radius) {
                best = Some(CalibrationReading {
                    found: true,
                    center: circle.center,
                    pixel_radius: circle.radius,
                });
            }
        }

        best.unwrap_or_else(CalibrationReading::not_found)
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn with_shapes(draw: impl Fn(u32, u32) -> Option<Rgb<u8>>) -> RgbImage {
        RgbImage::from_fn(160, 120, |x, y| draw(x, y).unwrap_or(Rgb([200, 200, 200])))
    }

    fn in_disk(x: u32, y: u32, cx: f64, cy: f64, r: f64) -> bool {
        (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2) <= r * r
    }

    #[test]
    fn test_hsv_conversion() {
        assert_eq!(rgb_to_hsv(255, 0, 0), (0, 255, 255));
        assert_eq!(rgb_to_hsv(0, 255, 0), (60, 255, 255));
        assert_eq!(rgb_to_hsv(0, 0, 255), (120, 255, 255));
        // Magenta-leaning red wraps into the high band
        let (h, _, _) = rgb_to_hsv(230, 20, 40);
        assert!(h >= 170);
        assert_eq!(rgb_to_hsv(0, 0, 0), (0, 0, 0));
    }

    #[test]
    fn test_detects_red_disk() {
        let image = with_shapes(|x, y| in_disk(x, y, 60.0, 50.0, 15.0).then_some(Rgb([220, 30, 30])));
        let reading = Calibrator::default().detect(&image);
        assert!(reading.found);
        assert!((reading.pixel_radius - 15.0).abs() < 1.0, "radius {}", reading.pixel_radius);
        assert!((reading.center.0 - 60.0).abs() < 1.0);
        assert!((reading.center.1 - 50.0).abs() < 1.0);
    }

    #[test]
    fn test_largest_circle_wins() {
        let image = with_shapes(|x, y| {
            (in_disk(x, y, 40.0, 40.0, 10.0) || in_disk(x, y, 110.0, 70.0, 20.0))
                .then_some(Rgb([200, 10, 20]))
        });
        let reading = Calibrator::default().detect(&image);
        assert!(reading.found);
        assert!((reading.center.0 - 110.0).abs() < 1.0);
        assert!((reading.pixel_radius - 20.0).abs() < 1.0);
    }

    #[test]
    fn test_rejects_elongated_red_bar() {
        let image = with_shapes(|x, y| {
            ((10..150).contains(&x) && (50..62).contains(&y)).then_some(Rgb([220, 30, 30]))
        });
        assert!(!Calibrator::default().detect(&image).found);
    }

    #[test]
    fn test_ignores_non_red_and_speckle() {
        let image = with_shapes(|x, y| {
            if in_disk(x, y, 60.0, 50.0, 15.0) {
                Some(Rgb([30, 30, 220]))
            } else if x % 17 == 0 && y % 13 == 0 {
                Some(Rgb([255, 0, 0]))
            } else {
                None
            }
        });
        assert_eq!(Calibrator::default().detect(&image), CalibrationReading::not_found());
    }

    #[test]
    fn test_scale_factor() {
        let reading = CalibrationReading {
            found: true,
            center: (0.0, 0.0),
            pixel_radius: 5.0,
        };
        assert_eq!(reading.scale_factor(Some(10.0)), Some(2.0));
        assert_eq!(reading.scale_factor(Some(5.0)), Some(1.0));
        assert_eq!(reading.scale_factor(None), None);
        assert_eq!(CalibrationReading::not_found().scale_factor(Some(10.0)), None);
    }
}
