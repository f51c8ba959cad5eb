//! Per-object measurements and their metric artifact encoding.

use crate::calibration::CalibrationReading;
use crate::mask::Mask;
use crate::stats::{equivalent_diameter, summarize, SummaryStats};
use crate::volume::estimate_volume;
use measure_storage::{Array, ArrayData, CodecError};
use serde::{Deserialize, Serialize};

/// Columns per metric artifact row: mask index, diameter, volume
pub const METRIC_COLUMNS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeasurement {
    /// Position of the source mask in the mask artifact
    pub mask_index: usize,
    pub diameter: f64,
    pub volume: f64,
}

/// Measure every mask in pixel units, sorted by ascending diameter
pub fn measure_masks(masks: &[Mask]) -> Vec<ObjectMeasurement> {
    let mut objects: Vec<_> = masks
        .iter()
        .enumerate()
        .map(|(mask_index, mask)| ObjectMeasurement {
            mask_index,
            diameter: equivalent_diameter(mask.area() as f64),
            volume: estimate_volume(mask),
        })
        .collect();
    objects.sort_by(|a, b| a.diameter.total_cmp(&b.diameter));
    objects
}

/// Measurements of one image in their final unit
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Ascending by diameter
    pub objects: Vec<ObjectMeasurement>,
    pub stats: SummaryStats,
    pub is_calibrated: bool,
    pub unit: String,
}

impl Measurement {
    /// Apply calibration to pixel-unit measurements.
    ///
    /// Diameters scale linearly by `real / pixel` radius and volumes by its
    /// cube. Without a found reference and a target radius the values stay in
    /// pixels and the unit is forced to `pixel_unit`. Returns `None` for an
    /// empty object list.
    pub fn calibrate(
        mut objects: Vec<ObjectMeasurement>,
        reading: &CalibrationReading,
        target_radius: Option<f64>,
        requested_unit: Option<&str>,
        pixel_unit: &str,
    ) -> Option<Self> {
        let (is_calibrated, unit) = match reading.scale_factor(target_radius) {
            Some(factor) => {
                for object in &mut objects {
                    object.diameter *= factor;
                    object.volume *= factor.powi(3);
                }
                (true, requested_unit.unwrap_or(pixel_unit).to_string())
            }
            None => (false, pixel_unit.to_string()),
        };
        Self::from_objects(objects, is_calibrated, unit)
    }

    fn from_objects(objects: Vec<ObjectMeasurement>, is_calibrated: bool, unit: String) -> Option<Self> {
        let diameters: Vec<f64> = objects.iter().map(|o| o.diameter).collect();
        let stats = summarize(&diameters)?;
        Some(Self {
            objects,
            stats,
            is_calibrated,
            unit,
        })
    }

    pub fn diameters(&self) -> Vec<f64> {
        self.objects.iter().map(|o| o.diameter).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.objects.iter().map(|o| o.volume).collect()
    }

    /// Encode as an `f64[N,3]` artifact
    pub fn to_array(&self) -> Result<Array, CodecError> {
        let data = self
            .objects
            .iter()
            .flat_map(|o| [o.mask_index as f64, o.diameter, o.volume])
            .collect();
        Array::new(
            vec![self.objects.len(), METRIC_COLUMNS],
            ArrayData::F64(data),
        )
    }

    /// Rebuild from a metric artifact plus the flags recorded on the
    /// prediction row. `None` when the array is not a non-empty `f64[N,3]`.
    pub fn from_array(array: &Array, is_calibrated: bool, unit: &str) -> Option<Self> {
        let ArrayData::F64(data) = &array.data else {
            return None;
        };
        if array.shape.len() != 2 || array.shape[1] != METRIC_COLUMNS {
            return None;
        }
        let objects = data
            .chunks_exact(METRIC_COLUMNS)
            .map(|row| ObjectMeasurement {
                mask_index: row[0] as usize,
                diameter: row[1],
                volume: row[2],
            })
            .collect();
        Self::from_objects(objects, is_calibrated, unit.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects(diameters: &[f64]) -> Vec<ObjectMeasurement> {
        diameters
            .iter()
            .enumerate()
            .map(|(i, &d)| ObjectMeasurement {
                mask_index: i,
                diameter: d,
                volume: d * 100.0,
            })
            .collect()
    }

    fn found(pixel_radius: f64) -> CalibrationReading {
        CalibrationReading {
            found: true,
            center: (50.0, 50.0),
            pixel_radius,
        }
    }

    #[test]
    fn test_reference_scales_diameters_linearly() {
        let m = Measurement::calibrate(
            objects(&[10.0, 20.0, 30.0]),
            &found(5.0),
            Some(10.0),
            Some("mm"),
            "pixels",
        )
        .unwrap();
        assert_eq!(m.diameters(), vec![20.0, 40.0, 60.0]);
        assert_eq!(m.volumes(), vec![8000.0, 16000.0, 24000.0]);
        assert!(m.is_calibrated);
        assert_eq!(m.unit, "mm");
        assert_eq!(m.stats.p50, 40.0);
    }

    #[test]
    fn test_equal_radii_is_identity() {
        let m = Measurement::calibrate(objects(&[3.5, 7.25]), &found(12.0), Some(12.0), Some("mm"), "pixels")
            .unwrap();
        assert_eq!(m.diameters(), vec![3.5, 7.25]);
        assert_eq!(m.volumes(), vec![350.0, 725.0]);
        assert!(m.is_calibrated);
    }

    #[test]
    fn test_missing_reference_forces_pixel_unit() {
        let cases = [
            (CalibrationReading::not_found(), Some(10.0)),
            (found(5.0), None),
        ];
        for (reading, target) in cases {
            let m = Measurement::calibrate(objects(&[10.0]), &reading, target, Some("mm"), "pixels").unwrap();
            assert!(!m.is_calibrated);
            assert_eq!(m.unit, "pixels");
            assert_eq!(m.diameters(), vec![10.0]);
        }
    }

    #[test]
    fn test_empty_objects_have_no_measurement() {
        assert!(Measurement::calibrate(Vec::new(), &found(5.0), Some(1.0), None, "pixels").is_none());
    }

    #[test]
    fn test_measure_masks_sorted_by_area() {
        let masks = vec![
            Mask::from_fn(20, 20, |x, y| x < 10 && y < 10),
            Mask::from_fn(20, 20, |x, y| x < 3 && y < 3),
            Mask::from_fn(20, 20, |x, y| x < 6 && y < 6),
        ];
        let measured = measure_masks(&masks);
        let order: Vec<_> = measured.iter().map(|o| o.mask_index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(measured.windows(2).all(|w| w[0].diameter < w[1].diameter));
    }

    #[test]
    fn test_metric_array_restores_measurement() {
        let m = Measurement::calibrate(objects(&[1.5, 2.0]), &found(2.0), Some(1.0), Some("cm"), "pixels")
            .unwrap();
        let array = Array::decode(&m.to_array().unwrap().encode()).unwrap();
        assert_eq!(array.shape, vec![2, 3]);

        let restored = Measurement::from_array(&array, true, "cm").unwrap();
        assert_eq!(restored, m);
    }
}
