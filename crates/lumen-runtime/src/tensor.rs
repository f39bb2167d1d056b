//! User-facing tensor type for host/device data interchange.

use crate::error::{Result, RuntimeError};
use crate::memory::BufferId;
use bytemuck::Pod;
use lumen_core::{DataType, TensorDesc};

/// Host element types with a fixed [`DataType`].
pub trait Element: Pod {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

impl Element for u32 {
    const DTYPE: DataType = DataType::U32;
}

impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}

impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}

/// Where a tensor's data lives.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// Host bytes, uploaded by the backend on use.
    Host(Vec<u8>),
    /// An external buffer registered with the backend.
    Device(BufferId),
}

/// User-facing tensor for input/output data.
///
/// # Example
/// ```
/// # use lumen_runtime::Tensor;
/// let tensor = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    shape: Vec<usize>,
    dtype: DataType,
}

impl Tensor {
    /// Create a host tensor from a vector with a given shape.
    ///
    /// # Errors
    /// Returns an error if the data length doesn't match the shape.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(RuntimeError::TensorError(format!(
                "Data length {} doesn't match shape {shape:?} (expected {expected})",
                data.len()
            )));
        }
        Ok(Self {
            data: TensorData::Host(bytemuck::cast_slice(&data).to_vec()),
            shape: shape.to_vec(),
            dtype: T::DTYPE,
        })
    }

    /// Create a tensor from raw bytes.
    pub fn from_raw(data: Vec<u8>, shape: &[usize], dtype: DataType) -> Self {
        Self {
            data: TensorData::Host(data),
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Refer to a registered external buffer holding data of `shape`.
    pub fn from_device(buffer: BufferId, shape: &[usize], dtype: DataType) -> Self {
        Self {
            data: TensorData::Device(buffer),
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Same data under another shape with equal element count.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let desc = self.desc().reshape(shape)?;
        Ok(Self {
            data: self.data.clone(),
            shape: desc.shape,
            dtype: self.dtype,
        })
    }

    /// Get a slice view of host data.
    ///
    /// # Errors
    /// Returns an error if the element type doesn't match or the data lives
    /// on the device.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::TensorError(format!(
                "Tensor holds {} but {} was requested",
                self.dtype,
                T::DTYPE
            )));
        }
        let bytes = self.as_bytes()?;
        bytemuck::try_cast_slice(bytes)
            .map_err(|e| RuntimeError::TensorError(format!("Cannot view tensor data: {e}")))
    }

    /// Convert tensor to a Vec.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        // Copies, so host bytes need no particular alignment
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::TensorError(format!(
                "Tensor holds {} but {} was requested",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(self.as_bytes()?))
    }

    /// Raw host bytes.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match &self.data {
            TensorData::Host(bytes) => Ok(bytes),
            TensorData::Device(id) => Err(RuntimeError::TensorError(format!(
                "Tensor data lives in device buffer {id}"
            ))),
        }
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Get the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the data type of the tensor.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.dtype, &self.shape)
    }

    /// Check that host data holds exactly the bytes its shape needs.
    ///
    /// Device tensors always pass; their buffers are checked when bound.
    pub(crate) fn check_host_len(&self, name: &str) -> Result<()> {
        let desc = self.desc();
        match &self.data {
            TensorData::Host(bytes) if bytes.len() != desc.byte_len() => {
                Err(RuntimeError::InvalidInputOutput(format!(
                    "Input '{name}' has {} bytes, {desc} needs {}",
                    bytes.len(),
                    desc.byte_len()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Get the total number of elements in the tensor.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
