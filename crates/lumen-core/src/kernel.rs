//! Kernel contract: what every operator implementation provides.

use crate::shader::ShaderHelper;
use crate::types::TensorDesc;
use crate::uniform::UniformValue;
use crate::Result;

/// How much of an input's metadata the generated shader depends on.
///
/// Chosen per input by the kernel author; it controls how finely programs are
/// specialized (and therefore how often the cache misses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputDependency {
    /// Generated code does not depend on this input's metadata.
    None,
    /// Depends on the element type only.
    Type,
    /// Depends on element type and rank.
    Rank,
    /// Depends on element type and every dimension.
    Shape,
}

/// Amount of work one dispatch must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSize {
    /// One invocation per element. The program manager derives the grid from
    /// the workgroup size the shader was generated with.
    Elements(usize),
    /// An explicit workgroup grid.
    Workgroups([u32; 3]),
}

impl DispatchSize {
    /// Workgroup grid for shaders generated with `workgroup_size` invocations
    /// per group, or `None` if the count does not fit a `u32`.
    pub fn workgroups(&self, workgroup_size: u32) -> Option<[u32; 3]> {
        match *self {
            DispatchSize::Elements(n) => {
                let groups = n.div_ceil(workgroup_size.max(1) as usize);
                u32::try_from(groups).ok().map(|g| [g, 1, 1])
            }
            DispatchSize::Workgroups(grid) => Some(grid),
        }
    }
}

impl From<[u32; 3]> for DispatchSize {
    fn from(grid: [u32; 3]) -> Self {
        DispatchSize::Workgroups(grid)
    }
}

/// Everything a kernel computes from concrete inputs before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RunData {
    /// Exact element type and shape of every output.
    pub outputs: Vec<TensorDesc>,

    /// Work covered by the dispatch.
    pub dispatch: DispatchSize,

    /// Uniform values in declaration order.
    pub uniforms: Vec<UniformValue>,
}

/// GPU implementation of one operator for one node.
///
/// Kernels must be referentially transparent: the same attributes and
/// input descriptors must yield the same run data and shader source, which
/// is what makes caching programs by key correct. Kernels never see or
/// mutate input data.
pub trait Kernel: Send + Sync {
    /// Operator name used in program keys and diagnostics.
    fn name(&self) -> &str;

    /// Attribute-derived part of the program key.
    ///
    /// Must capture every attribute that changes the generated source.
    fn cache_hint(&self) -> String {
        String::new()
    }

    /// Specialization granularity for input `index`.
    fn input_dependency(&self, _index: usize) -> InputDependency {
        InputDependency::Shape
    }

    /// Validate inputs and describe outputs, dispatch size and uniforms.
    ///
    /// Validation failures must be reported as [`crate::Error::Precondition`].
    fn run_data(&self, inputs: &[TensorDesc]) -> Result<RunData>;

    /// Generate the WGSL source, declaring bindings and uniforms on `helper`.
    fn shader_source(&self, helper: &mut ShaderHelper, inputs: &[TensorDesc]) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elements_round_up_to_whole_workgroups() {
        assert_eq!(DispatchSize::Elements(0).workgroups(64), Some([0, 1, 1]));
        assert_eq!(DispatchSize::Elements(64).workgroups(64), Some([1, 1, 1]));
        assert_eq!(DispatchSize::Elements(65).workgroups(64), Some([2, 1, 1]));
        assert_eq!(DispatchSize::Elements(100).workgroups(256), Some([1, 1, 1]));
    }

    #[test]
    fn test_explicit_grid_is_kept() {
        assert_eq!(DispatchSize::from([4, 2, 1]).workgroups(64), Some([4, 2, 1]));
    }
}
