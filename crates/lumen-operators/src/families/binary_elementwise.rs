//! Binary elementwise operator family.
//!
//! Covers: Add, Sub, Mul, Div

use crate::broadcast::{broadcast_shape, broadcast_strides, is_suffix_broadcast};
use lumen_core::shader::NUMERIC;
use lumen_core::{
    DataType, DispatchSize, Error, InputDependency, Kernel, KernelCtx, Operator, Result, RunData,
    ShaderHelper, TensorDesc, UniformType, UniformValue,
};

/// Arithmetic performed by a binary kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
            BinaryOp::Div => "Div",
        }
    }

    /// WGSL expression combining `a` and `b`.
    fn expr(&self, dtype: DataType, a: &str, b: &str) -> String {
        match (self, dtype) {
            (BinaryOp::Add, _) => format!("{a} + {b}"),
            (BinaryOp::Sub, _) => format!("{a} - {b}"),
            (BinaryOp::Mul, _) => format!("{a} * {b}"),
            // Integer division by zero yields 0 instead of an undefined value
            (BinaryOp::Div, DataType::I32) => format!("safe_div_i32({a}, {b})"),
            (BinaryOp::Div, DataType::U32) => format!("safe_div_u32({a}, {b})"),
            (BinaryOp::Div, _) => format!("{a} / {b}"),
        }
    }

    fn import(&self, dtype: DataType) -> Option<&'static str> {
        match (self, dtype) {
            (BinaryOp::Div, DataType::I32) => Some("safe_div_i32"),
            (BinaryOp::Div, DataType::U32) => Some("safe_div_u32"),
            _ => None,
        }
    }
}

/// Binary elementwise operator family.
///
/// All members share NumPy-style broadcasting, the same bindings and the
/// same uniforms; only the combining expression differs.
pub struct BinaryElementwiseOp {
    op: BinaryOp,
}

impl BinaryElementwiseOp {
    pub fn new(op: BinaryOp) -> Self {
        Self { op }
    }

    pub fn add() -> Self {
        Self::new(BinaryOp::Add)
    }

    pub fn sub() -> Self {
        Self::new(BinaryOp::Sub)
    }

    pub fn mul() -> Self {
        Self::new(BinaryOp::Mul)
    }

    pub fn div() -> Self {
        Self::new(BinaryOp::Div)
    }
}

impl Operator for BinaryElementwiseOp {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn create_kernel(&self, ctx: &KernelCtx) -> Result<Box<dyn Kernel>> {
        if ctx.input_count() != 2 || ctx.output_count() != 1 {
            return Err(Error::InvalidGraph(format!(
                "{} node '{}' needs 2 inputs and 1 output, has {} and {}",
                self.op.name(),
                ctx.node.name,
                ctx.input_count(),
                ctx.output_count()
            )));
        }
        Ok(Box::new(BinaryKernel { op: self.op }))
    }
}

/// How an output index maps to input indices.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Indexing {
    /// Both inputs repeat contiguously: `a[i % a_size]`, `b[i % b_size]`.
    Modulo { a_size: usize, b_size: usize },
    /// General broadcast through per-dimension strides.
    Strided {
        a_strides: Vec<usize>,
        b_strides: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Broadcast {
    dtype: DataType,
    out: Vec<usize>,
    indexing: Indexing,
}

fn broadcast(inputs: &[TensorDesc]) -> Result<Broadcast> {
    let [a, b] = inputs else {
        return Err(Error::Precondition(format!(
            "expected 2 inputs, got {}",
            inputs.len()
        )));
    };
    if a.dtype != b.dtype {
        return Err(Error::Precondition(format!(
            "input types differ: {} and {}",
            a.dtype, b.dtype
        )));
    }
    if !matches!(a.dtype, DataType::F32 | DataType::I32 | DataType::U32) {
        return Err(Error::Precondition(format!(
            "unsupported element type {}",
            a.dtype
        )));
    }

    let out = broadcast_shape(&a.shape, &b.shape)?;
    let indexing = if is_suffix_broadcast(&a.shape, &out) && is_suffix_broadcast(&b.shape, &out) {
        Indexing::Modulo {
            a_size: a.num_elements(),
            b_size: b.num_elements(),
        }
    } else {
        Indexing::Strided {
            a_strides: broadcast_strides(&a.shape, &out),
            b_strides: broadcast_strides(&b.shape, &out),
        }
    };
    Ok(Broadcast {
        dtype: a.dtype,
        out,
        indexing,
    })
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::Precondition(format!("{what} {value} does not fit in u32")))
}

fn to_u32_vec(values: &[usize], what: &str) -> Result<Vec<u32>> {
    values.iter().map(|&v| to_u32(v, what)).collect()
}

/// Kernel for one binary elementwise node.
///
/// Programs are specialized on full input shapes: the indexing scheme and
/// the rank are baked into the generated source.
pub struct BinaryKernel {
    op: BinaryOp,
}

impl Kernel for BinaryKernel {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn input_dependency(&self, _index: usize) -> InputDependency {
        InputDependency::Shape
    }

    fn run_data(&self, inputs: &[TensorDesc]) -> Result<RunData> {
        let bc = broadcast(inputs)?;
        let output = TensorDesc::new(bc.dtype, &bc.out);
        let size = output.num_elements();

        let mut uniforms = vec![UniformValue::from(to_u32(size, "output size")?)];
        match &bc.indexing {
            Indexing::Modulo { a_size, b_size } => {
                uniforms.push(UniformValue::from(to_u32(*a_size, "input size")?));
                uniforms.push(UniformValue::from(to_u32(*b_size, "input size")?));
            }
            Indexing::Strided {
                a_strides,
                b_strides,
            } => {
                uniforms.push(UniformValue::U32(to_u32_vec(&bc.out, "dimension")?));
                uniforms.push(UniformValue::U32(to_u32_vec(a_strides, "stride")?));
                uniforms.push(UniformValue::U32(to_u32_vec(b_strides, "stride")?));
            }
        }

        Ok(RunData {
            outputs: vec![output],
            dispatch: DispatchSize::Elements(size),
            uniforms,
        })
    }

    fn shader_source(&self, helper: &mut ShaderHelper, inputs: &[TensorDesc]) -> Result<String> {
        let bc = broadcast(inputs)?;
        helper
            .input("a", bc.dtype)?
            .input("b", bc.dtype)?
            .output("y", bc.dtype)?;
        if let Some(item) = self.op.import(bc.dtype) {
            helper.import(&NUMERIC, &[item]);
        }
        let output_size = helper.uniform("output_size", UniformType::U32, 1);

        let body = match &bc.indexing {
            Indexing::Modulo { .. } => {
                let a_size = helper.uniform("a_size", UniformType::U32, 1);
                let b_size = helper.uniform("b_size", UniformType::U32, 1);
                let a = format!("a[global_idx % {}]", a_size.access(""));
                let b = format!("b[global_idx % {}]", b_size.access(""));
                format!("    y[global_idx] = {};\n", self.op.expr(bc.dtype, &a, &b))
            }
            Indexing::Strided { .. } => {
                let rank = bc.out.len();
                let out_shape = helper.uniform("out_shape", UniformType::U32, rank);
                let a_strides = helper.uniform("a_strides", UniformType::U32, rank);
                let b_strides = helper.uniform("b_strides", UniformType::U32, rank);

                let mut body = String::from(
                    "    var remaining = global_idx;\n    var a_index = 0u;\n    var b_index = 0u;\n",
                );
                for d in (0..rank).rev() {
                    let i = format!("{d}u");
                    body.push_str(&format!(
                        "    let coord{d} = remaining % {dim};\n    remaining = remaining / {dim};\n    a_index += coord{d} * {sa};\n    b_index += coord{d} * {sb};\n",
                        dim = out_shape.access(&i),
                        sa = a_strides.access(&i),
                        sb = b_strides.access(&i),
                    ));
                }
                body.push_str(&format!(
                    "    y[global_idx] = {};\n",
                    self.op.expr(bc.dtype, "a[a_index]", "b[b_index]")
                ));
                body
            }
        };

        Ok(format!(
            "{}\n{}{}{}}}\n",
            helper.declarations(),
            helper.main_start(),
            helper.guard(&output_size.access("")),
            body
        ))
    }
}
