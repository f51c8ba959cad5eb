//! Binary instance masks and their artifact encoding.

use measure_storage::{Array, ArrayData, CodecError};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MaskError {
    #[error("Mask data length {len} does not match {width}x{height}")]
    SizeMismatch { width: u32, height: u32, len: usize },

    #[error("Masks in one set must share dimensions")]
    MixedDimensions,

    #[error("Expected a bool[N,H,W] array, got {0}")]
    BadArray(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Row-major boolean mask over an image plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<bool>,
}

impl Mask {
    /// An empty mask
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; width as usize * height as usize],
        }
    }

    pub fn from_vec(width: u32, height: u32, data: Vec<bool>) -> Result<Self, MaskError> {
        if data.len() != width as usize * height as usize {
            return Err(MaskError::SizeMismatch {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a mask by evaluating `f` at every pixel
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[bool] {
        &self.data
    }

    /// Pixel lookup; out-of-bounds reads are background
    pub fn get(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return false;
        }
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.width && y < self.height {
            let idx = y as usize * self.width as usize + x as usize;
            self.data[idx] = value;
        }
    }

    /// Foreground pixel count
    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    /// Nearest-neighbour resample to the given dimensions
    pub fn resize_nearest(&self, width: u32, height: u32) -> Mask {
        if (width, height) == (self.width, self.height) {
            return self.clone();
        }
        if self.width == 0 || self.height == 0 {
            return Mask::new(width, height);
        }

        let sx = self.width as f64 / width as f64;
        let sy = self.height as f64 / height as f64;
        Mask::from_fn(width, height, |x, y| {
            let src_x = ((x as f64 * sx) as u32).min(self.width - 1);
            let src_y = ((y as f64 * sy) as u32).min(self.height - 1);
            self.data[src_y as usize * self.width as usize + src_x as usize]
        })
    }
}

/// Pack a mask set into a `bool[N,H,W]` array
pub fn masks_to_array(masks: &[Mask]) -> Result<Array, MaskError> {
    let (width, height) = masks.first().map_or((0, 0), Mask::dimensions);
    if masks.iter().any(|m| m.dimensions() != (width, height)) {
        return Err(MaskError::MixedDimensions);
    }

    let mut data = Vec::with_capacity(masks.len() * width as usize * height as usize);
    for mask in masks {
        data.extend_from_slice(&mask.data);
    }
    Ok(Array::new(
        vec![masks.len(), height as usize, width as usize],
        ArrayData::Bool(data),
    )?)
}

/// Unpack a `bool[N,H,W]` array into masks
pub fn masks_from_array(array: &Array) -> Result<Vec<Mask>, MaskError> {
    let ArrayData::Bool(data) = &array.data else {
        return Err(MaskError::BadArray(format!("{:?} data", array.dtype())));
    };
    let [count, height, width] = array.shape[..] else {
        return Err(MaskError::BadArray(format!("shape {:?}", array.shape)));
    };
    let (Ok(w), Ok(h)) = (u32::try_from(width), u32::try_from(height)) else {
        return Err(MaskError::BadArray(format!("shape {:?}", array.shape)));
    };

    let plane = width * height;
    if plane == 0 {
        return Ok((0..count).map(|_| Mask::new(w, h)).collect());
    }
    data.chunks_exact(plane)
        .map(|chunk| Mask::from_vec(w, h, chunk.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_counts_foreground() {
        let mask = Mask::from_fn(4, 3, |x, y| x < 2 && y < 2);
        assert_eq!(mask.area(), 4);
        assert!(mask.get(1, 1));
        assert!(!mask.get(-1, 0));
        assert!(!mask.get(4, 0));
    }

    #[test]
    fn test_from_vec_checks_length() {
        assert!(matches!(
            Mask::from_vec(2, 2, vec![true; 3]),
            Err(MaskError::SizeMismatch { len: 3, .. })
        ));
    }

    #[test]
    fn test_resize_nearest_upscale() {
        let mask = Mask::from_vec(2, 1, vec![true, false]).unwrap();
        let resized = mask.resize_nearest(4, 2);
        assert_eq!(resized.dimensions(), (4, 2));
        assert_eq!(
            resized.data(),
            &[true, true, false, false, true, true, false, false]
        );
    }

    #[test]
    fn test_array_roundtrip_preserves_masks() {
        let masks = vec![
            Mask::from_fn(5, 3, |x, _| x % 2 == 0),
            Mask::from_fn(5, 3, |_, y| y == 1),
        ];
        let array = masks_to_array(&masks).unwrap();
        assert_eq!(array.shape, vec![2, 3, 5]);

        let decoded = Array::decode(&array.encode()).unwrap();
        assert_eq!(masks_from_array(&decoded).unwrap(), masks);
    }

    #[test]
    fn test_mixed_dimensions_rejected() {
        let masks = vec![Mask::new(2, 2), Mask::new(3, 2)];
        assert_eq!(masks_to_array(&masks), Err(MaskError::MixedDimensions));
    }
}
