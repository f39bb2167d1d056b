//! WGSL generation helpers shared by every kernel.
//!
//! A kernel describes its bindings and uniforms through [`ShaderHelper`]
//! while generating source. The helper emits the declarations, the entry
//! point preamble and records the [`ProgramLayout`] the program manager uses
//! to build bind groups and pack uniforms, so binding order and uniform
//! offsets can never drift away from the generated code.

use crate::types::DataType;
use crate::uniform::{UniformDecl, UniformLayout, UniformType};
use crate::{Error, Result};
use std::fmt::Write;

/// Entry point name of every generated compute shader.
pub const ENTRY_POINT: &str = "main";

/// Default number of invocations per workgroup.
pub const DEFAULT_WORKGROUP_SIZE: u32 = 64;

/// A shared WGSL module that kernels may `#import`.
#[derive(Debug, Clone, Copy)]
pub struct HelperModule {
    /// naga_oil import path (matches the module's `#define_import_path`).
    pub import_path: &'static str,

    /// WGSL source.
    pub source: &'static str,
}

/// Elementwise activation routines.
pub const ACTIVATIONS: HelperModule = HelperModule {
    import_path: "lumen::activations",
    source: r#"
#define_import_path lumen::activations

fn relu(x: f32) -> f32 {
    return max(x, 0.0);
}

fn sigmoid(x: f32) -> f32 {
    return 1.0 / (1.0 + exp(-x));
}
"#,
};

/// Arithmetic routines with defined behaviour for edge inputs.
pub const NUMERIC: HelperModule = HelperModule {
    import_path: "lumen::numeric",
    source: r#"
#define_import_path lumen::numeric

fn safe_div_i32(a: i32, b: i32) -> i32 {
    if (b == 0) {
        return 0;
    }
    return a / b;
}

fn safe_div_u32(a: u32, b: u32) -> u32 {
    if (b == 0u) {
        return 0u;
    }
    return a / b;
}
"#,
};

/// All helper modules available to kernels.
pub const HELPER_MODULES: &[HelperModule] = &[ACTIVATIONS, NUMERIC];

/// Kind of a single bind group entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Kernel input (`var<storage, read>`).
    ReadOnlyStorage,
    /// Kernel output (`var<storage, read_write>`).
    Storage,
    /// Packed uniform block (`var<uniform>`).
    Uniform,
}

/// Binding order and uniform layout of a compiled program.
///
/// Inputs occupy bindings `0..inputs`, outputs follow, and the uniform block
/// (if any) is always the last binding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgramLayout {
    pub inputs: usize,
    pub outputs: usize,
    pub uniforms: UniformLayout,
}

impl ProgramLayout {
    /// Bind group entries in binding order.
    pub fn bindings(&self) -> Vec<BindingKind> {
        let mut kinds = vec![BindingKind::ReadOnlyStorage; self.inputs];
        kinds.extend(std::iter::repeat(BindingKind::Storage).take(self.outputs));
        if !self.uniforms.is_empty() {
            kinds.push(BindingKind::Uniform);
        }
        kinds
    }
}

/// Builder for the boilerplate half of a kernel's WGSL source.
#[derive(Debug, Clone)]
pub struct ShaderHelper {
    workgroup_size: u32,
    inputs: Vec<(String, &'static str)>,
    outputs: Vec<(String, &'static str)>,
    uniforms: Vec<UniformDecl>,
    imports: Vec<String>,
}

impl ShaderHelper {
    pub fn new(workgroup_size: u32) -> Self {
        Self {
            workgroup_size,
            inputs: Vec::new(),
            outputs: Vec::new(),
            uniforms: Vec::new(),
            imports: Vec::new(),
        }
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    /// Declare a read-only storage input.
    pub fn input(&mut self, name: &str, dtype: DataType) -> Result<&mut Self> {
        let ty = storage_type(name, dtype)?;
        self.inputs.push((name.to_string(), ty));
        Ok(self)
    }

    /// Declare a writable storage output.
    pub fn output(&mut self, name: &str, dtype: DataType) -> Result<&mut Self> {
        let ty = storage_type(name, dtype)?;
        self.outputs.push((name.to_string(), ty));
        Ok(self)
    }

    /// Declare a uniform member, returning its declaration for index access.
    pub fn uniform(&mut self, name: &str, ty: UniformType, len: usize) -> UniformDecl {
        let decl = UniformDecl::new(name, ty, len);
        self.uniforms.push(decl.clone());
        decl
    }

    /// Import items from a shared helper module.
    pub fn import(&mut self, module: &HelperModule, items: &[&str]) -> &mut Self {
        self.imports
            .push(format!("#import {}::{{{}}}", module.import_path, items.join(", ")));
        self
    }

    /// Import directives and binding declarations.
    pub fn declarations(&self) -> String {
        let mut out = String::new();
        for import in &self.imports {
            let _ = writeln!(out, "{import}");
        }
        out.push('\n');

        let mut binding = 0;
        for (name, ty) in &self.inputs {
            let _ = writeln!(
                out,
                "@group(0) @binding({binding}) var<storage, read> {name}: array<{ty}>;"
            );
            binding += 1;
        }
        for (name, ty) in &self.outputs {
            let _ = writeln!(
                out,
                "@group(0) @binding({binding}) var<storage, read_write> {name}: array<{ty}>;"
            );
            binding += 1;
        }

        if !self.uniforms.is_empty() {
            out.push_str("\nstruct Uniforms {\n");
            for decl in &self.uniforms {
                let _ = writeln!(out, "    {}: {},", decl.name, decl.wgsl_type());
            }
            out.push_str("};\n\n");
            let _ = writeln!(
                out,
                "@group(0) @binding({binding}) var<uniform> uniforms: Uniforms;"
            );
        }
        out
    }

    /// Entry point signature plus the flattened `global_idx`.
    ///
    /// The workgroup id is flattened over all three grid dimensions, so the
    /// program manager may reshape an oversized 1D dispatch into 2D or 3D.
    pub fn main_start(&self) -> String {
        format!(
            "@compute @workgroup_size({size}, 1, 1)
fn {ENTRY_POINT}(
    @builtin(workgroup_id) workgroup_id: vec3<u32>,
    @builtin(num_workgroups) num_workgroups: vec3<u32>,
    @builtin(local_invocation_index) local_idx: u32,
) {{
    let workgroup_index = workgroup_id.z * num_workgroups.x * num_workgroups.y
        + workgroup_id.y * num_workgroups.x
        + workgroup_id.x;
    let global_idx = workgroup_index * {size}u + local_idx;
",
            size = self.workgroup_size
        )
    }

    /// Early return for invocations past `size_expr` elements.
    pub fn guard(&self, size_expr: &str) -> String {
        format!("    if (global_idx >= {size_expr}) {{\n        return;\n    }}\n")
    }

    /// Layout described by the declarations made so far.
    pub fn layout(&self) -> ProgramLayout {
        ProgramLayout {
            inputs: self.inputs.len(),
            outputs: self.outputs.len(),
            uniforms: UniformLayout::new(&self.uniforms),
        }
    }
}

impl Default for ShaderHelper {
    fn default() -> Self {
        Self::new(DEFAULT_WORKGROUP_SIZE)
    }
}

fn storage_type(name: &str, dtype: DataType) -> Result<&'static str> {
    dtype.wgsl_type().ok_or_else(|| {
        Error::Unsupported(format!("binding '{name}' has no WGSL storage type for {dtype}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declarations_order_bindings() {
        let mut helper = ShaderHelper::new(64);
        helper.output("y", DataType::F32).unwrap();
        helper.input("x", DataType::F32).unwrap();
        helper.uniform("size", UniformType::U32, 1);

        let decls = helper.declarations();
        assert!(decls.contains("@group(0) @binding(0) var<storage, read> x: array<f32>;"));
        assert!(decls.contains("@group(0) @binding(1) var<storage, read_write> y: array<f32>;"));
        assert!(decls.contains("@group(0) @binding(2) var<uniform> uniforms: Uniforms;"));
        assert!(decls.contains("size: u32,"));

        let layout = helper.layout();
        assert_eq!(
            layout.bindings(),
            vec![
                BindingKind::ReadOnlyStorage,
                BindingKind::Storage,
                BindingKind::Uniform
            ]
        );
        assert_eq!(layout.uniforms.size(), 16);
    }

    #[test]
    fn test_no_uniform_block_without_uniforms() {
        let mut helper = ShaderHelper::default();
        helper.input("x", DataType::I32).unwrap();
        helper.output("y", DataType::I32).unwrap();

        assert!(!helper.declarations().contains("Uniforms"));
        assert_eq!(helper.layout().bindings().len(), 2);
    }

    #[test]
    fn test_unsupported_storage_type() {
        let mut helper = ShaderHelper::default();
        assert!(helper.input("x", DataType::I64).is_err());
    }

    #[test]
    fn test_import_directive() {
        let mut helper = ShaderHelper::default();
        helper.import(&ACTIVATIONS, &["relu", "sigmoid"]);
        assert!(helper
            .declarations()
            .starts_with("#import lumen::activations::{relu, sigmoid}"));
    }
}
