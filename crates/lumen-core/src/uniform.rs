//! Uniform block declaration, layout and packing.
//!
//! A kernel declares its uniforms while generating shader source; the same
//! declarations produce the WGSL struct and the byte layout used to pack the
//! values supplied at dispatch time. Layout follows WGSL's uniform address
//! space rules: scalars align to 4 bytes, `vec2` to 8, `vec3`/`vec4` to 16,
//! and anything longer than four elements is an `array<vec4<T>, N>` with a
//! 16-byte stride.

use crate::{Error, Result};
use std::fmt;

/// Scalar type of a uniform member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    U32,
    I32,
    F32,
}

impl UniformType {
    pub fn wgsl(&self) -> &'static str {
        match self {
            UniformType::U32 => "u32",
            UniformType::I32 => "i32",
            UniformType::F32 => "f32",
        }
    }
}

impl fmt::Display for UniformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wgsl())
    }
}

/// A uniform member declared by a kernel's shader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniformDecl {
    pub name: String,
    pub ty: UniformType,
    /// Number of scalar elements (1 for a plain scalar).
    pub len: usize,
}

impl UniformDecl {
    pub fn new(name: &str, ty: UniformType, len: usize) -> Self {
        Self {
            name: name.to_string(),
            ty,
            len: len.max(1),
        }
    }

    /// WGSL type of the struct member.
    pub fn wgsl_type(&self) -> String {
        let scalar = self.ty.wgsl();
        match self.len {
            1 => scalar.to_string(),
            2..=4 => format!("vec{}<{scalar}>", self.len),
            n => format!("array<vec4<{scalar}>, {}>", n.div_ceil(4)),
        }
    }

    /// WGSL expression reading element `index` of this member.
    ///
    /// `index` is a WGSL `u32` expression; it is ignored for scalars.
    pub fn access(&self, index: &str) -> String {
        match self.len {
            1 => format!("uniforms.{}", self.name),
            2..=4 => format!("uniforms.{}[{index}]", self.name),
            _ => format!("uniforms.{}[({index}) / 4u][({index}) % 4u]", self.name),
        }
    }

    /// (alignment, size) in bytes under uniform address space rules.
    fn align_and_size(&self) -> (usize, usize) {
        match self.len {
            1 => (4, 4),
            2 => (8, 8),
            3 => (16, 12),
            4 => (16, 16),
            n => (16, 16 * n.div_ceil(4)),
        }
    }
}

/// Values supplied for one uniform member at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl UniformValue {
    pub fn ty(&self) -> UniformType {
        match self {
            UniformValue::U32(_) => UniformType::U32,
            UniformValue::I32(_) => UniformType::I32,
            UniformValue::F32(_) => UniformType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UniformValue::U32(v) => v.len(),
            UniformValue::I32(v) => v.len(),
            UniformValue::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte view of the elements, in order.
    fn as_bytes(&self) -> &[u8] {
        match self {
            UniformValue::U32(v) => bytemuck::cast_slice(v),
            UniformValue::I32(v) => bytemuck::cast_slice(v),
            UniformValue::F32(v) => bytemuck::cast_slice(v),
        }
    }
}

impl From<u32> for UniformValue {
    fn from(value: u32) -> Self {
        UniformValue::U32(vec![value])
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::F32(vec![value])
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::I32(vec![value])
    }
}

/// Byte layout of a program's uniform block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UniformLayout {
    members: Vec<(UniformDecl, usize)>,
    size: usize,
}

impl UniformLayout {
    /// Compute member offsets for the given declarations, in order.
    pub fn new(decls: &[UniformDecl]) -> Self {
        let mut members = Vec::with_capacity(decls.len());
        let mut offset = 0usize;
        for decl in decls {
            let (align, size) = decl.align_and_size();
            offset = offset.next_multiple_of(align);
            members.push((decl.clone(), offset));
            offset += size;
        }
        Self {
            members,
            size: offset.next_multiple_of(16),
        }
    }

    /// Size of the packed block in bytes (0 when there are no uniforms).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Declarations paired with their byte offsets.
    pub fn members(&self) -> impl Iterator<Item = (&UniformDecl, usize)> {
        self.members.iter().map(|(decl, offset)| (decl, *offset))
    }

    /// Pack values into the block.
    ///
    /// The values must match the declarations one-to-one in count, type and
    /// length; anything else is an error rather than a silently shifted block.
    pub fn pack(&self, values: &[UniformValue]) -> Result<Vec<u8>> {
        if values.len() != self.members.len() {
            return Err(Error::Uniform(format!(
                "expected {} uniform values, got {}",
                self.members.len(),
                values.len()
            )));
        }

        let mut bytes = vec![0u8; self.size];
        for ((decl, offset), value) in self.members.iter().zip(values) {
            if value.ty() != decl.ty {
                return Err(Error::Uniform(format!(
                    "uniform '{}' is declared {} but was given {}",
                    decl.name,
                    decl.ty,
                    value.ty()
                )));
            }
            if value.len() != decl.len {
                return Err(Error::Uniform(format!(
                    "uniform '{}' is declared with {} elements but was given {}",
                    decl.name,
                    decl.len,
                    value.len()
                )));
            }
            // Arrays pack four elements per 16-byte vec4 slot, which is
            // contiguous; scalars and vectors are contiguous as well.
            let data = value.as_bytes();
            bytes[*offset..*offset + data.len()].copy_from_slice(data);
        }
        Ok(bytes)
    }
}
