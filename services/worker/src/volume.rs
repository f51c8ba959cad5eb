//! Per-mask volume estimation from the largest external contour.
//!
//! Three models are blended with weights chosen by circularity: a sphere with
//! the contour's equivalent diameter, a prolate spheroid from the fitted
//! ellipse, and an empirical `area^1.5` correction.

use crate::geometry::{arc_length, circularity, contour_area, external_contours, fit_ellipse};
use crate::mask::Mask;
use std::f64::consts::PI;

/// Blend weights for one circularity tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeWeights {
    pub sphere: f64,
    pub ellipsoid: f64,
    pub empirical: f64,
}

impl VolumeWeights {
    pub fn for_circularity(circularity: f64) -> Self {
        if circularity > 0.8 {
            Self {
                sphere: 0.6,
                ellipsoid: 0.2,
                empirical: 0.2,
            }
        } else if circularity > 0.5 {
            Self {
                sphere: 0.3,
                ellipsoid: 0.4,
                empirical: 0.3,
            }
        } else {
            Self {
                sphere: 0.1,
                ellipsoid: 0.5,
                empirical: 0.4,
            }
        }
    }
}

/// Volume when no ellipse can be fitted
pub fn fallback_volume(area: f64) -> f64 {
    area.powf(1.5) * 0.8
}

/// Blend the three models for a contour with the given shape descriptors
pub fn blended_volume(area: f64, perimeter: f64, major_axis: f64, minor_axis: f64) -> f64 {
    let roundness = circularity(area, perimeter);
    let diameter = (4.0 * area / PI).sqrt();

    let sphere = 4.0 / 3.0 * PI * (diameter / 2.0).powi(3);
    let ellipsoid = 4.0 / 3.0 * PI * (major_axis / 2.0) * (minor_axis / 2.0).powi(2);
    let empirical = area.powf(1.5) * (0.8 + 0.4 * roundness);

    let w = VolumeWeights::for_circularity(roundness);
    w.sphere * sphere + w.ellipsoid * ellipsoid + w.empirical * empirical
}

/// Estimate one mask's volume in cubic pixels.
///
/// A mask with no contour or a zero-area contour has volume zero.
pub fn estimate_volume(mask: &Mask) -> f64 {
    let Some(contour) = external_contours(mask)
        .into_iter()
        .max_by(|a, b| contour_area(a).total_cmp(&contour_area(b)))
    else {
        return 0.0;
    };

    let area = contour_area(&contour);
    if area == 0.0 {
        return 0.0;
    }

    match fit_ellipse(&contour) {
        Some(ellipse) => blended_volume(
            area,
            arc_length(&contour),
            ellipse.major_axis,
            ellipse.minor_axis,
        ),
        None => fallback_volume(area),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_tiers() {
        assert_eq!(VolumeWeights::for_circularity(0.9).sphere, 0.6);
        // Boundaries fall into the lower tier
        assert_eq!(VolumeWeights::for_circularity(0.8).ellipsoid, 0.4);
        assert_eq!(VolumeWeights::for_circularity(0.5).empirical, 0.4);
        for c in [0.1, 0.6, 0.95] {
            let w = VolumeWeights::for_circularity(c);
            assert!((w.sphere + w.ellipsoid + w.empirical - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_blend_for_perfect_circle() {
        let r: f64 = 10.0;
        let area = PI * r * r;
        let perimeter = 2.0 * PI * r;
        let v = blended_volume(area, perimeter, 2.0 * r, 2.0 * r);

        let sphere = 4.0 / 3.0 * PI * r.powi(3);
        let empirical = area.powf(1.5) * 1.2;
        let expected = 0.6 * sphere + 0.2 * sphere + 0.2 * empirical;
        assert!((v - expected).abs() < 1e-6 * expected);
    }

    #[test]
    fn test_empty_mask_has_zero_volume() {
        assert_eq!(estimate_volume(&Mask::new(8, 8)), 0.0);
        let dot = Mask::from_fn(8, 8, |x, y| x == 3 && y == 3);
        assert_eq!(estimate_volume(&dot), 0.0);
    }

    #[test]
    fn test_rectangle_uses_fallback() {
        // Four compressed vertices cannot carry an ellipse fit
        let mask = Mask::from_fn(20, 20, |x, y| (2..=12).contains(&x) && (5..=9).contains(&y));
        assert_eq!(estimate_volume(&mask), fallback_volume(40.0));
    }

    #[test]
    fn test_disk_volume_near_sphere() {
        let mask = Mask::from_fn(64, 64, |x, y| {
            (x as f64 - 32.0).powi(2) + (y as f64 - 32.0).powi(2) <= 400.0
        });
        let v = estimate_volume(&mask);
        let sphere = 4.0 / 3.0 * PI * 20.0f64.powi(3);
        assert!(v > 0.5 * sphere && v < 1.5 * sphere, "volume {v}");
    }

    #[test]
    fn test_largest_contour_is_used() {
        let mask = Mask::from_fn(40, 20, |x, y| {
            ((2..=6).contains(&x) && (2..=4).contains(&y)) || ((10..=30).contains(&x) && (5..=15).contains(&y))
        });
        assert_eq!(estimate_volume(&mask), fallback_volume(200.0));
    }
}
