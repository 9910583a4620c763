use dyn_clone::DynClone;

use crate::argument::Argument;
use crate::error::Result;
use crate::program::{InstructionRef, Parameters, Program};
use crate::shape::Shape;

pub mod cpu;
pub mod gpu;
pub mod passes;

/// Compute entry point bound to one instruction at compile time.
pub trait Kernel: DynClone + core::fmt::Debug + Send + Sync {
    fn name(&self) -> String;
    /// Produces the value of an instruction with output shape `output` from the
    /// values of its inputs, in order.
    fn compute(&self, output: &Shape, inputs: &[Argument]) -> Result<Argument>;
}

dyn_clone::clone_trait_object!(Kernel);

/// Graph rewrite run by `Program::compile`.
pub trait Pass: core::fmt::Debug {
    fn name(&self) -> &'static str;
    fn apply(&self, program: &mut Program) -> Result<()>;
}

/// Backend a program is lowered to.
pub trait Target: core::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    /// Legalization passes, in the order they run.
    fn passes(&self) -> Vec<Box<dyn Pass>>;
    /// Kernel for `ins`. Fails with a lowering error when the backend has none.
    fn bind(&self, program: &Program, ins: InstructionRef) -> Result<Box<dyn Kernel>>;
    fn eval(&self, program: &Program, params: &Parameters) -> Result<Argument> {
        crate::eval::run(program, params)
    }
}
