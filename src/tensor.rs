//! Flat row-major host tensors
//!
//! Audio batches and model parameters are moved around as a flat buffer plus
//! an explicit shape, the same representation checkpoints serialize.

use half::bf16;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("shape {shape:?} needs {expected} elements, buffer has {actual}")]
    ElementCount {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("cannot stack an empty list of tensors")]
    EmptyStack,

    #[error("cannot stack tensors of differing shape or dtype: {0} vs {1}")]
    StackMismatch(String, String),

    #[error("leading dimension {len} is not divisible into {parts} equal parts")]
    UnevenChunks { len: usize, parts: usize },

    #[error("tensor has no leading dimension")]
    Scalar,
}

/// Element type of a [`Tensor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    Bf16,
    I64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::Bf16 => "bf16",
            DType::I64 => "i64",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::Bf16(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::Bf16(_) => DType::Bf16,
            TensorData::I64(_) => DType::I64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    shape: Vec<usize>,
}

impl Tensor {
    pub fn new(data: TensorData, shape: Vec<usize>) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, shape })
    }

    pub fn from_f32(values: Vec<f32>, shape: Vec<usize>) -> Result<Self, TensorError> {
        Self::new(TensorData::F32(values), shape)
    }

    pub fn from_i64(values: Vec<i64>, shape: Vec<usize>) -> Result<Self, TensorError> {
        Self::new(TensorData::I64(values), shape)
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            data: TensorData::F32(vec![0.0; len]),
            shape,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(0)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    /// Borrow the buffer when it is already `f32`.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Widen to `f32` regardless of the stored precision.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::Bf16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TensorData::I64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn to_f32(&self) -> Tensor {
        match &self.data {
            TensorData::F32(_) => self.clone(),
            _ => Tensor {
                data: TensorData::F32(self.to_f32_vec()),
                shape: self.shape.clone(),
            },
        }
    }

    /// Cast to bf16. Shape is untouched, so callers must reshape first.
    pub fn narrow_to_bf16(self) -> Tensor {
        let data = match self.data {
            TensorData::F32(v) => TensorData::Bf16(v.into_iter().map(bf16::from_f32).collect()),
            TensorData::I64(v) => {
                TensorData::Bf16(v.into_iter().map(|x| bf16::from_f32(x as f32)).collect())
            }
            bf @ TensorData::Bf16(_) => bf,
        };
        Tensor {
            data,
            shape: self.shape,
        }
    }

    /// Index of the first NaN or infinite element, if any.
    pub fn first_non_finite(&self) -> Option<usize> {
        match &self.data {
            TensorData::F32(v) => v.iter().position(|x| !x.is_finite()),
            TensorData::Bf16(v) => v.iter().position(|x| !x.is_finite()),
            TensorData::I64(_) => None,
        }
    }

    /// Counts of (NaN, infinite) elements.
    pub fn non_finite_counts(&self) -> (usize, usize) {
        match &self.data {
            TensorData::F32(v) => (
                v.iter().filter(|x| x.is_nan()).count(),
                v.iter().filter(|x| x.is_infinite()).count(),
            ),
            TensorData::Bf16(v) => (
                v.iter().filter(|x| x.is_nan()).count(),
                v.iter().filter(|x| x.is_infinite()).count(),
            ),
            TensorData::I64(_) => (0, 0),
        }
    }

    /// Stack equally shaped tensors along a new leading axis.
    pub fn stack(items: &[&Tensor]) -> Result<Tensor, TensorError> {
        let first = items.first().ok_or(TensorError::EmptyStack)?;
        for item in items.iter().skip(1) {
            if item.shape != first.shape || item.dtype() != first.dtype() {
                return Err(TensorError::StackMismatch(
                    format!("{}{:?}", first.dtype(), first.shape),
                    format!("{}{:?}", item.dtype(), item.shape),
                ));
            }
        }

        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(items.len());
        shape.extend_from_slice(&first.shape);

        let total = first.len() * items.len();
        let data = match &first.data {
            TensorData::F32(_) => {
                let mut out = Vec::with_capacity(total);
                for item in items {
                    if let TensorData::F32(v) = &item.data {
                        out.extend_from_slice(v);
                    }
                }
                TensorData::F32(out)
            }
            TensorData::Bf16(_) => {
                let mut out = Vec::with_capacity(total);
                for item in items {
                    if let TensorData::Bf16(v) = &item.data {
                        out.extend_from_slice(v);
                    }
                }
                TensorData::Bf16(out)
            }
            TensorData::I64(_) => {
                let mut out = Vec::with_capacity(total);
                for item in items {
                    if let TensorData::I64(v) = &item.data {
                        out.extend_from_slice(v);
                    }
                }
                TensorData::I64(out)
            }
        };

        Tensor::new(data, shape)
    }

    /// Split along the leading axis into `parts` equally sized tensors.
    pub fn chunk_leading(&self, parts: usize) -> Result<Vec<Tensor>, TensorError> {
        let len = *self.shape.first().ok_or(TensorError::Scalar)?;
        if parts == 0 || len % parts != 0 {
            return Err(TensorError::UnevenChunks { len, parts });
        }
        let rows = len / parts;
        let row_elems: usize = self.shape[1..].iter().product();
        let step = rows * row_elems;

        let mut shape = self.shape.clone();
        shape[0] = rows;

        let chunks = (0..parts)
            .map(|i| {
                let range = i * step..(i + 1) * step;
                let data = match &self.data {
                    TensorData::F32(v) => TensorData::F32(v[range].to_vec()),
                    TensorData::Bf16(v) => TensorData::Bf16(v[range].to_vec()),
                    TensorData::I64(v) => TensorData::I64(v[range].to_vec()),
                };
                Tensor {
                    data,
                    shape: shape.clone(),
                }
            })
            .collect();
        Ok(chunks)
    }
}
