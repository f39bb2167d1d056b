//! Unary elementwise operator family.
//!
//! Covers: Neg, Abs, Relu, Sqrt, Exp, Sigmoid

use lumen_core::shader::ACTIVATIONS;
use lumen_core::{
    DataType, DispatchSize, Error, InputDependency, Kernel, KernelCtx, Operator, Result, RunData,
    ShaderHelper, TensorDesc, UniformType, UniformValue,
};

/// Function applied by a unary kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
    Sqrt,
    Exp,
    Sigmoid,
}

impl UnaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "Neg",
            UnaryOp::Abs => "Abs",
            UnaryOp::Relu => "Relu",
            UnaryOp::Sqrt => "Sqrt",
            UnaryOp::Exp => "Exp",
            UnaryOp::Sigmoid => "Sigmoid",
        }
    }

    fn supports(&self, dtype: DataType) -> bool {
        match self {
            UnaryOp::Neg | UnaryOp::Abs => matches!(dtype, DataType::F32 | DataType::I32),
            _ => dtype == DataType::F32,
        }
    }

    fn expr(&self, x: &str) -> String {
        match self {
            UnaryOp::Neg => format!("-{x}"),
            UnaryOp::Abs => format!("abs({x})"),
            UnaryOp::Relu => format!("relu({x})"),
            UnaryOp::Sqrt => format!("sqrt({x})"),
            UnaryOp::Exp => format!("exp({x})"),
            UnaryOp::Sigmoid => format!("sigmoid({x})"),
        }
    }

    /// Item imported from the shared activations module.
    fn import(&self) -> Option<&'static str> {
        match self {
            UnaryOp::Relu => Some("relu"),
            UnaryOp::Sigmoid => Some("sigmoid"),
            _ => None,
        }
    }
}

/// Unary elementwise operator family.
///
/// Output shape equals input shape; only the applied function differs.
pub struct UnaryElementwiseOp {
    op: UnaryOp,
}

impl UnaryElementwiseOp {
    pub fn new(op: UnaryOp) -> Self {
        Self { op }
    }

    pub fn neg() -> Self {
        Self::new(UnaryOp::Neg)
    }

    pub fn abs() -> Self {
        Self::new(UnaryOp::Abs)
    }

    pub fn relu() -> Self {
        Self::new(UnaryOp::Relu)
    }

    pub fn sqrt() -> Self {
        Self::new(UnaryOp::Sqrt)
    }

    pub fn exp() -> Self {
        Self::new(UnaryOp::Exp)
    }

    pub fn sigmoid() -> Self {
        Self::new(UnaryOp::Sigmoid)
    }
}

impl Operator for UnaryElementwiseOp {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn create_kernel(&self, ctx: &KernelCtx) -> Result<Box<dyn Kernel>> {
        if ctx.input_count() != 1 || ctx.output_count() != 1 {
            return Err(Error::InvalidGraph(format!(
                "{} node '{}' needs 1 input and 1 output, has {} and {}",
                self.op.name(),
                ctx.node.name,
                ctx.input_count(),
                ctx.output_count()
            )));
        }
        Ok(Box::new(UnaryKernel { op: self.op }))
    }
}

/// Kernel for one unary elementwise node.
///
/// The generated source depends on the element type only, so every shape
/// shares one program.
pub struct UnaryKernel {
    op: UnaryOp,
}

impl UnaryKernel {
    fn input<'a>(&self, inputs: &'a [TensorDesc]) -> Result<&'a TensorDesc> {
        let [input] = inputs else {
            return Err(Error::Precondition(format!(
                "expected 1 input, got {}",
                inputs.len()
            )));
        };
        if !self.op.supports(input.dtype) {
            return Err(Error::Precondition(format!(
                "{} does not support {}",
                self.op.name(),
                input.dtype
            )));
        }
        Ok(input)
    }
}

impl Kernel for UnaryKernel {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn input_dependency(&self, _index: usize) -> InputDependency {
        InputDependency::Type
    }

    fn run_data(&self, inputs: &[TensorDesc]) -> Result<RunData> {
        let input = self.input(inputs)?;
        let size = input.num_elements();
        let size_u32 = u32::try_from(size)
            .map_err(|_| Error::Precondition(format!("{size} elements do not fit in u32")))?;
        Ok(RunData {
            outputs: vec![input.clone()],
            dispatch: DispatchSize::Elements(size),
            uniforms: vec![UniformValue::from(size_u32)],
        })
    }

    fn shader_source(&self, helper: &mut ShaderHelper, inputs: &[TensorDesc]) -> Result<String> {
        let dtype = self.input(inputs)?.dtype;
        helper.input("x", dtype)?.output("y", dtype)?;
        if let Some(item) = self.op.import() {
            helper.import(&ACTIVATIONS, &[item]);
        }
        let size = helper.uniform("output_size", UniformType::U32, 1);

        Ok(format!(
            "{}\n{}{}    y[global_idx] = {};\n}}\n",
            helper.declarations(),
            helper.main_start(),
            helper.guard(&size.access("")),
            self.op.expr("x[global_idx]")
        ))
    }
}
