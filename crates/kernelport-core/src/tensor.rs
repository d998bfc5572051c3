use anyhow::{ensure, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    U8,
    I8,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::F16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    /// Element count; `None` if it does not fit in `usize`.
    pub fn numel(&self) -> Option<usize> {
        if self.0.contains(&0) {
            return Some(0);
        }
        self.0.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorDesc {
    /// Bytes a dense buffer of this description needs; `None` on overflow.
    pub fn byte_size(&self) -> Option<usize> {
        self.shape.numel()?.checked_mul(self.dtype.size())
    }
}

/// A fully materialized host tensor.
///
/// Cloning is cheap: the payload is a reference-counted [`Bytes`], so handing
/// the same tensor to several consumers never copies the buffer.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub data: Bytes,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        Self {
            desc: TensorDesc { dtype, shape },
            data: bytes,
        }
    }

    /// Panics like any oversized allocation if the shape's byte size overflows.
    pub fn zeros(dtype: DType, shape: Shape) -> Self {
        let desc = TensorDesc { dtype, shape };
        let len = desc.byte_size().unwrap_or(usize::MAX);
        Self {
            data: Bytes::from(vec![0u8; len]),
            desc,
        }
    }

    pub fn from_f32(shape: Shape, values: &[f32]) -> Self {
        let mut buf = Vec::with_capacity(values.len() * 4);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_cpu_bytes(DType::F32, shape, Bytes::from(buf))
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        ensure!(
            self.desc.dtype == DType::F32,
            "expected f32 tensor, got {:?}",
            self.desc.dtype
        );
        ensure!(
            self.data.len() % 4 == 0,
            "f32 tensor has invalid byte length {}",
            self.data.len()
        );
        Ok(self
            .data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}
