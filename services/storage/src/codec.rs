//! Versioned binary encoding for numeric artifacts.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! offset  size        field
//! 0       4           magic  "MSAR"
//! 4       1           version (1)
//! 5       1           dtype   (0 = bool, 1 = f64)
//! 6       1           ndim
//! 7       1           reserved (0)
//! 8       8 * ndim    dims (u64)
//! ..      payload     bool: ceil(n / 8) bytes, LSB-first bits
//!                     f64:  n * 8 bytes, IEEE-754 bits
//! ```
//!
//! The encoding carries its own shape, so artifacts decode without any
//! knowledge of the producing process.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"MSAR";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 8;

/// Errors that can occur while encoding or decoding an artifact
#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("Not an array artifact (bad magic)")]
    BadMagic,

    #[error("Unsupported artifact version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown dtype tag {0}")]
    UnknownDType(u8),

    #[error("Too many dimensions: {0}")]
    TooManyDims(usize),

    #[error("Shape {shape:?} does not match {len} elements")]
    ShapeMismatch { shape: Vec<usize>, len: usize },

    #[error("Shape overflows addressable size")]
    ShapeOverflow,

    #[error("Truncated artifact: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("Trailing bytes after payload: {0}")]
    TrailingBytes(usize),
}

/// Element type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Bool,
    F64,
}

impl DType {
    fn tag(self) -> u8 {
        match self {
            DType::Bool => 0,
            DType::F64 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(DType::Bool),
            1 => Ok(DType::F64),
            other => Err(CodecError::UnknownDType(other)),
        }
    }

    fn payload_len(self, elements: usize) -> Result<usize, CodecError> {
        match self {
            DType::Bool => Ok(elements.div_ceil(8)),
            DType::F64 => elements.checked_mul(8).ok_or(CodecError::ShapeOverflow),
        }
    }
}

/// Flat element storage
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Bool(Vec<bool>),
    F64(Vec<f64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Bool(v) => v.len(),
            ArrayData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::Bool(_) => DType::Bool,
            ArrayData::F64(_) => DType::F64,
        }
    }
}

/// N-dimensional array in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub shape: Vec<usize>,
    pub data: ArrayData,
}

fn element_count(shape: &[usize]) -> Result<usize, CodecError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or(CodecError::ShapeOverflow)
}

impl Array {
    /// Build an array, checking that the shape covers the data exactly
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self, CodecError> {
        if shape.len() > u8::MAX as usize {
            return Err(CodecError::TooManyDims(shape.len()));
        }
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(CodecError::ShapeMismatch {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Encode into the versioned binary layout
    pub fn encode(&self) -> Bytes {
        let payload_len = self.dtype().payload_len(self.data.len()).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.shape.len() * 8 + payload_len);

        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.dtype().tag());
        buf.put_u8(self.shape.len() as u8);
        buf.put_u8(0);
        for &dim in &self.shape {
            buf.put_u64_le(dim as u64);
        }

        match &self.data {
            ArrayData::Bool(values) => {
                for chunk in values.chunks(8) {
                    let byte = chunk
                        .iter()
                        .enumerate()
                        .fold(0u8, |acc, (bit, &set)| acc | ((set as u8) << bit));
                    buf.put_u8(byte);
                }
            }
            ArrayData::F64(values) => {
                for &value in values {
                    buf.put_u64_le(value.to_bits());
                }
            }
        }

        buf.freeze()
    }

    /// Decode from the versioned binary layout
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                expected: HEADER_LEN,
                found: bytes.len(),
            });
        }
        let mut buf = bytes;

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(CodecError::BadMagic);
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let dtype = DType::from_tag(buf.get_u8())?;
        let ndim = buf.get_u8() as usize;
        let _reserved = buf.get_u8();

        if buf.remaining() < ndim * 8 {
            return Err(CodecError::Truncated {
                expected: HEADER_LEN + ndim * 8,
                found: bytes.len(),
            });
        }
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            let dim = usize::try_from(buf.get_u64_le()).map_err(|_| CodecError::ShapeOverflow)?;
            shape.push(dim);
        }

        let elements = element_count(&shape)?;
        let payload_len = dtype.payload_len(elements)?;
        let header_len = HEADER_LEN + ndim * 8;
        if buf.remaining() < payload_len {
            return Err(CodecError::Truncated {
                expected: header_len + payload_len,
                found: bytes.len(),
            });
        }
        if buf.remaining() > payload_len {
            return Err(CodecError::TrailingBytes(buf.remaining() - payload_len));
        }

        let data = match dtype {
            DType::Bool => {
                let packed = &buf[..payload_len];
                let values = (0..elements)
                    .map(|i| packed[i / 8] & (1 << (i % 8)) != 0)
                    .collect();
                ArrayData::Bool(values)
            }
            DType::F64 => {
                let values = (0..elements)
                    .map(|_| f64::from_bits(buf.get_u64_le()))
                    .collect();
                ArrayData::F64(values)
            }
        };

        Ok(Self { shape, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_mask_roundtrip_is_bitwise() {
        // 2 masks of 3x5, odd element count so the final byte is partial
        let values: Vec<bool> = (0..30).map(|i| i % 3 == 0 || i % 7 == 0).collect();
        let array = Array::new(vec![2, 3, 5], ArrayData::Bool(values.clone())).unwrap();

        let encoded = array.encode();
        assert_eq!(&encoded[..4], b"MSAR");
        assert_eq!(encoded.len(), 8 + 3 * 8 + 4);

        let decoded = Array::decode(&encoded).unwrap();
        assert_eq!(decoded.shape, vec![2, 3, 5]);
        assert_eq!(decoded.data, ArrayData::Bool(values));
    }

    #[test]
    fn test_f64_roundtrip_preserves_bits() {
        let values = vec![
            0.0,
            -0.0,
            1.0 / 3.0,
            f64::MIN_POSITIVE / 2.0,
            f64::MAX,
            f64::NAN,
        ];
        let array = Array::new(vec![3, 2], ArrayData::F64(values.clone())).unwrap();
        let decoded = Array::decode(&array.encode()).unwrap();

        assert_eq!(decoded.shape, vec![3, 2]);
        let ArrayData::F64(out) = decoded.data else {
            panic!("expected f64 data");
        };
        let in_bits: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        let out_bits: Vec<u64> = out.iter().map(|v| v.to_bits()).collect();
        assert_eq!(in_bits, out_bits);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let err = Array::new(vec![2, 2], ArrayData::F64(vec![1.0, 2.0, 3.0])).unwrap_err();
        assert!(matches!(err, CodecError::ShapeMismatch { len: 3, .. }));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert_eq!(Array::decode(b"MSA").unwrap_err(), CodecError::Truncated {
            expected: 8,
            found: 3
        });
        assert_eq!(
            Array::decode(b"NOPE\x01\x00\x00\x00").unwrap_err(),
            CodecError::BadMagic
        );
        assert_eq!(
            Array::decode(b"MSAR\x09\x00\x00\x00").unwrap_err(),
            CodecError::UnsupportedVersion(9)
        );
        assert_eq!(
            Array::decode(b"MSAR\x01\x07\x00\x00").unwrap_err(),
            CodecError::UnknownDType(7)
        );

        let mut encoded = Array::new(vec![2], ArrayData::F64(vec![1.0, 2.0]))
            .unwrap()
            .encode()
            .to_vec();
        encoded.pop();
        assert!(matches!(
            Array::decode(&encoded).unwrap_err(),
            CodecError::Truncated { .. }
        ));
        encoded.extend_from_slice(&[0, 0]);
        assert_eq!(
            Array::decode(&encoded).unwrap_err(),
            CodecError::TrailingBytes(1)
        );
    }

    #[test]
    fn test_empty_array() {
        let array = Array::new(vec![0, 3], ArrayData::F64(vec![])).unwrap();
        let decoded = Array::decode(&array.encode()).unwrap();
        assert_eq!(decoded.shape, vec![0, 3]);
        assert!(decoded.data.is_empty());
    }
}
