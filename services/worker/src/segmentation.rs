//! Instance segmentation capability.
//!
//! The engine only depends on [`Segmenter`]. [`ThresholdSegmenter`] is a
//! classical baseline that needs no model weights; a learned model plugs in by
//! implementing the same trait.

use crate::geometry::connected_components;
use crate::mask::Mask;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("Image has no pixels")]
    EmptyImage,

    #[error("Segmentation model failed: {0}")]
    Model(String),
}

/// Given an image and thresholds, produce one boolean mask per detected instance.
///
/// Masks should match the image dimensions; the engine resizes any that do not.
pub trait Segmenter: Send + Sync {
    fn segment(&self, image: &RgbImage, conf: f64, iou: f64) -> Result<Vec<Mask>, SegmentationError>;
}

/// Baseline segmenter tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Components smaller than this many pixels are noise
    #[serde(default = "default_min_component_area")]
    pub min_component_area: usize,
    /// Upper bound on returned instances
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
}

fn default_min_component_area() -> usize {
    64
}

fn default_max_instances() -> usize {
    300
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_component_area: default_min_component_area(),
            max_instances: default_max_instances(),
        }
    }
}

/// Otsu-threshold segmenter over luma.
///
/// The minority side of the threshold is foreground. Each 8-connected
/// foreground component is an instance scored by its contrast against the
/// background; instances below `conf` are dropped, and of two instances whose
/// bounding boxes overlap beyond `iou` only the larger survives.
pub struct ThresholdSegmenter {
    config: SegmenterConfig,
}

impl ThresholdSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }
}

impl Default for ThresholdSegmenter {
    fn default() -> Self {
        Self::new(SegmenterConfig::default())
    }
}

/// Threshold maximising between-class variance; `None` for a flat histogram
fn otsu_threshold(hist: &[u64; 256]) -> Option<u8> {
    let total: u64 = hist.iter().sum();
    let weighted: f64 = hist
        .iter()
        .enumerate()
        .map(|(level, &count)| level as f64 * count as f64)
        .sum();

    let mut best: Option<(u8, f64)> = None;
    let mut below_count = 0u64;
    let mut below_sum = 0.0;
    for level in 0..255usize {
        below_count += hist[level];
        below_sum += level as f64 * hist[level] as f64;
        let above_count = total - below_count;
        if below_count == 0 || above_count == 0 {
            continue;
        }

        let mean_below = below_sum / below_count as f64;
        let mean_above = (weighted - below_sum) / above_count as f64;
        let variance =
            below_count as f64 * above_count as f64 * (mean_below - mean_above).powi(2);
        if best.map_or(true, |(_, v)| variance > v) {
            best = Some((level as u8, variance));
        }
    }
    best.map(|(level, _)| level)
}

impl Segmenter for ThresholdSegmenter {
    fn segment(&self, image: &RgbImage, conf: f64, iou: f64) -> Result<Vec<Mask>, SegmentationError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(SegmentationError::EmptyImage);
        }

        let luma: GrayImage = image::imageops::grayscale(image);
        let mut hist = [0u64; 256];
        for pixel in luma.pixels() {
            hist[pixel.0[0] as usize] += 1;
        }
        let Some(threshold) = otsu_threshold(&hist) else {
            return Ok(Vec::new());
        };

        let above: usize = hist[threshold as usize + 1..].iter().sum::<u64>() as usize;
        let total = width as usize * height as usize;
        let bright_foreground = above * 2 <= total;
        let foreground = Mask::from_fn(width, height, |x, y| {
            let v = luma.get_pixel(x, y).0[0];
            (v > threshold) == bright_foreground
        });

        let (bg_sum, bg_count) = luma
            .pixels()
            .zip(foreground.data())
            .filter(|(_, fg)| !**fg)
            .fold((0.0, 0usize), |(s, c), (p, _)| (s + p.0[0] as f64, c + 1));
        let background_mean = if bg_count > 0 { bg_sum / bg_count as f64 } else { 0.0 };

        let mut candidates: Vec<_> = connected_components(&foreground)
            .into_iter()
            .filter(|c| c.area() >= self.config.min_component_area)
            .filter_map(|c| {
                let sum: f64 = c
                    .pixels
                    .iter()
                    .map(|&(x, y)| luma.get_pixel(x, y).0[0] as f64)
                    .sum();
                let score = ((sum / c.area() as f64) - background_mean).abs() / 255.0;
                (score >= conf).then_some((c, score))
            })
            .collect();

        candidates.sort_by(|a, b| b.0.area().cmp(&a.0.area()));

        let mut kept: Vec<crate::geometry::Component> = Vec::new();
        for (candidate, score) in candidates {
            if kept.len() >= self.config.max_instances {
                break;
            }
            if kept.iter().any(|k| k.bbox.iou(&candidate.bbox) > iou) {
                debug!(area = candidate.area(), score, "Suppressed overlapping instance");
                continue;
            }
            kept.push(candidate);
        }

        Ok(kept
            .iter()
            .map(|component| component.to_mask(width, height))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn scene(disks: &[(f64, f64, f64, u8)]) -> RgbImage {
        RgbImage::from_fn(120, 80, |x, y| {
            for &(cx, cy, r, v) in disks {
                if (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2) <= r * r {
                    return Rgb([v, v, v]);
                }
            }
            Rgb([20, 20, 20])
        })
    }

    #[test]
    fn test_otsu_splits_bimodal_histogram() {
        let mut hist = [0u64; 256];
        hist[30] = 500;
        hist[200] = 100;
        let t = otsu_threshold(&hist).unwrap();
        assert!((30..200).contains(&t));

        let mut flat = [0u64; 256];
        flat[80] = 10;
        assert_eq!(otsu_threshold(&flat), None);
    }

    #[test]
    fn test_detects_bright_disks() {
        let image = scene(&[(25.0, 25.0, 10.0, 220), (80.0, 40.0, 15.0, 220)]);
        let masks = ThresholdSegmenter::default().segment(&image, 0.5, 0.5).unwrap();
        assert_eq!(masks.len(), 2);
        // Larger instance first
        assert!(masks[0].area() > masks[1].area());
        assert!(masks[0].get(80, 40));
        assert_eq!(masks[0].dimensions(), (120, 80));
    }

    #[test]
    fn test_conf_filters_low_contrast() {
        // Contrast scores are 200/255 and 180/255
        let image = scene(&[(25.0, 25.0, 10.0, 220), (80.0, 40.0, 15.0, 200)]);
        let segmenter = ThresholdSegmenter::default();
        assert_eq!(segmenter.segment(&image, 0.5, 0.5).unwrap().len(), 2);

        let strict = segmenter.segment(&image, 0.75, 0.5).unwrap();
        assert_eq!(strict.len(), 1);
        assert!(strict[0].get(25, 25));
    }

    #[test]
    fn test_flat_image_has_no_detections() {
        let image = RgbImage::from_pixel(32, 32, Rgb([128, 128, 128]));
        let masks = ThresholdSegmenter::default().segment(&image, 0.1, 0.5).unwrap();
        assert!(masks.is_empty());
    }

    #[test]
    fn test_small_components_ignored() {
        let image = scene(&[(25.0, 25.0, 2.0, 220), (80.0, 40.0, 12.0, 220)]);
        let masks = ThresholdSegmenter::default().segment(&image, 0.5, 0.5).unwrap();
        assert_eq!(masks.len(), 1);
    }
}
