//! Typed n-dimensional array payloads

use std::ops::Range;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

/// Array contents as little-endian bytes with shape and element type.
///
/// Slicing along the first axis shares the underlying buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayData {
    shape: Vec<usize>,
    dtype: DType,
    bytes: Bytes,
}

macro_rules! typed_access {
    ($from:ident, $to:ident, $ty:ty, $dtype:expr) => {
        pub fn $from(shape: Vec<usize>, values: &[$ty]) -> CoordinationResult<Self> {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            Self::new(shape, $dtype, Bytes::from(bytes))
        }

        pub fn $to(&self) -> CoordinationResult<Vec<$ty>> {
            if self.dtype != $dtype {
                return Err(CoordinationError::InvalidArray(format!(
                    "array holds {:?}, not {:?}",
                    self.dtype, $dtype
                )));
            }
            Ok(self
                .bytes
                .chunks_exact(std::mem::size_of::<$ty>())
                .map(|chunk| {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(chunk);
                    <$ty>::from_le_bytes(raw)
                })
                .collect())
        }
    };
}

impl ArrayData {
    pub fn new(shape: Vec<usize>, dtype: DType, bytes: Bytes) -> CoordinationResult<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if bytes.len() != expected {
            return Err(CoordinationError::InvalidArray(format!(
                "shape {:?} of {:?} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                bytes.len()
            )));
        }
        Ok(Self {
            shape,
            dtype,
            bytes,
        })
    }

    typed_access!(from_u8, to_u8_vec, u8, DType::U8);
    typed_access!(from_i32, to_i32_vec, i32, DType::I32);
    typed_access!(from_i64, to_i64_vec, i64, DType::I64);
    typed_access!(from_f32, to_f32_vec, f32, DType::F32);
    typed_access!(from_f64, to_f64_vec, f64, DType::F64);

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes occupied by one entry along the first axis
    pub fn row_bytes(&self) -> usize {
        self.shape.iter().skip(1).product::<usize>() * self.dtype.size()
    }

    /// Byte range of `rows` within this array
    pub fn row_byte_range(&self, rows: &Range<usize>) -> CoordinationResult<Range<usize>> {
        let length = self.shape.first().copied().unwrap_or(0);
        if rows.start > rows.end || rows.end > length {
            return Err(CoordinationError::InvalidArray(format!(
                "rows {:?} out of bounds for length {}",
                rows, length
            )));
        }
        let row_bytes = self.row_bytes();
        Ok(rows.start * row_bytes..rows.end * row_bytes)
    }

    /// Rows `rows` of the first axis, sharing this array's buffer
    pub fn slice_rows(&self, rows: Range<usize>) -> CoordinationResult<ArrayData> {
        let byte_range = self.row_byte_range(&rows)?;
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = rows.end - rows.start;
        }
        Ok(ArrayData {
            shape,
            dtype: self.dtype,
            bytes: self.bytes.slice(byte_range),
        })
    }
}

/// Location of an array inside a named shared segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedArrayHandle {
    pub segment: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Byte offset of the first element within the segment
    pub offset: usize,
}

impl SharedArrayHandle {
    /// Bytes covered by the array
    pub fn byte_len(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size()
    }
}
