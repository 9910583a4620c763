use super::passes::{EliminateDeadCode, InsertContiguous};
use super::{Kernel, Pass, Target};
use crate::argument::Argument;
use crate::error::{Error, Result};
use crate::ops::{reference, Operator};
use crate::program::{InstructionRef, Program};
use crate::shape::Shape;

/// Reference backend: every operator runs on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuTarget;

#[derive(Clone, Debug)]
struct HostKernel {
    op: Operator,
}

impl Kernel for HostKernel {
    fn name(&self) -> String {
        format!("cpu::{}", self.op.name())
    }

    fn compute(&self, output: &Shape, inputs: &[Argument]) -> Result<Argument> {
        reference::compute(&self.op, output, inputs)
    }
}

impl Target for CpuTarget {
    fn name(&self) -> &str {
        "cpu"
    }

    fn passes(&self) -> Vec<Box<dyn Pass>> {
        vec![
            Box::new(EliminateDeadCode),
            Box::new(InsertContiguous::new(|op| {
                matches!(
                    op,
                    Operator::Gemm { .. } | Operator::Softmax { .. } | Operator::Convolution(_)
                )
            })),
        ]
    }

    fn bind(&self, program: &Program, ins: InstructionRef) -> Result<Box<dyn Kernel>> {
        match program.get(ins)?.op() {
            op @ (Operator::HostToDevice | Operator::DeviceToHost) => Err(Error::Lowering {
                op: op.name().into(),
                target: self.name().into(),
                reason: "the host target has no device".into(),
            }),
            op => Ok(Box::new(HostKernel { op: op.clone() })),
        }
    }
}
