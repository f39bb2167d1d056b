//! Core types for tensor element types, shapes and descriptors.

use crate::{Error, Result};
use std::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    I32,
    I64,
    U32,
    U8,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F16 => 2,
            DataType::I64 => 8,
            DataType::U8 | DataType::Bool => 1,
        }
    }

    /// WGSL scalar type used for storage bindings of this element type.
    ///
    /// Returns `None` for element types that have no direct storage
    /// representation (kernels must reject those as a precondition).
    pub fn wgsl_type(&self) -> Option<&'static str> {
        match self {
            DataType::F32 => Some("f32"),
            DataType::I32 => Some("i32"),
            DataType::U32 => Some("u32"),
            DataType::F16 | DataType::I64 | DataType::U8 | DataType::Bool => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U32 => "u32",
            DataType::U8 => "u8",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Declared shape of a value slot.
///
/// Dynamic dimensions are only known once a run binds concrete inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorShape {
    /// All dimensions are known at load time.
    Static(Vec<usize>),

    /// Known rank, some dimensions unknown until runtime.
    Dynamic(Vec<Option<usize>>),

    /// Neither rank nor dimensions are declared.
    Unknown,
}

impl TensorShape {
    /// Get static dimensions if available.
    pub fn as_static(&self) -> Option<&[usize]> {
        match self {
            TensorShape::Static(dims) => Some(dims),
            _ => None,
        }
    }

    /// Number of dimensions, if known.
    pub fn rank(&self) -> Option<usize> {
        match self {
            TensorShape::Static(dims) => Some(dims.len()),
            TensorShape::Dynamic(dims) => Some(dims.len()),
            TensorShape::Unknown => None,
        }
    }

    /// Check whether a concrete shape satisfies this declaration.
    pub fn accepts(&self, dims: &[usize]) -> bool {
        match self {
            TensorShape::Static(declared) => declared.as_slice() == dims,
            TensorShape::Dynamic(declared) => {
                declared.len() == dims.len()
                    && declared
                        .iter()
                        .zip(dims)
                        .all(|(d, &actual)| d.map_or(true, |d| d == actual))
            }
            TensorShape::Unknown => true,
        }
    }
}

/// Concrete element type and shape of a tensor at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub dtype: DataType,
    pub shape: Vec<usize>,
}

impl TensorDesc {
    pub fn new(dtype: DataType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
        }
    }

    /// Total number of elements (1 for a scalar, 0 if any dimension is 0).
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Logical size in bytes.
    pub fn byte_len(&self) -> usize {
        self.num_elements() * self.dtype.size()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_elements() == 0
    }

    /// Return the same data under a different shape with equal element count.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let count: usize = shape.iter().product();
        if count != self.num_elements() {
            return Err(Error::Shape(format!(
                "cannot reshape {:?} ({} elements) to {:?} ({} elements)",
                self.shape,
                self.num_elements(),
                shape,
                count
            )));
        }
        Ok(Self::new(self.dtype, shape))
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}
