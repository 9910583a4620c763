use std::sync::Arc;

use super::passes::{EliminateDeadCode, InsertContiguous, InsertTransfers};
use super::{Kernel, Pass, Target};
use crate::argument::Argument;
use crate::config::CONFIG;
use crate::device::sim::SimDevice;
use crate::device::{allocate, kernel_arg, to_device, to_host, Device};
use crate::error::{Error, Result};
use crate::literal::Literal;
use crate::ops::Operator;
use crate::program::{InstructionRef, Program};
use crate::shape::Shape;

/// Accelerator backend over any `Device`.
///
/// Compute runs on the device; literals are uploaded once at compile time and
/// parameters on every evaluation. With `offload_copy` the output is copied back to
/// the host, otherwise it is left on the device for the caller.
#[derive(Clone, Debug)]
pub struct GpuTarget {
    device: Arc<dyn Device>,
    offload_copy: bool,
}

impl GpuTarget {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            offload_copy: CONFIG.offload_copy,
        }
    }

    pub fn sim() -> Self {
        Self::new(SimDevice::new())
    }

    #[cfg(feature = "cuda")]
    pub fn cuda() -> Result<Self> {
        Ok(Self::new(crate::device::cuda::CudaDevice::new(0)?))
    }

    pub fn offload_copy(mut self, enabled: bool) -> Self {
        self.offload_copy = enabled;
        self
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

#[derive(Clone, Debug)]
enum GpuKernel {
    Literal(Literal),
    /// Literal already on the device.
    Resident(Argument),
    Upload(Arc<dyn Device>),
    Download,
    View(&'static str),
    Launch {
        op: Operator,
        device: Arc<dyn Device>,
    },
}

impl Kernel for GpuKernel {
    fn name(&self) -> String {
        match self {
            GpuKernel::Literal(_) => "gpu::literal".into(),
            GpuKernel::Resident(_) => "gpu::resident_literal".into(),
            GpuKernel::Upload(_) => "gpu::host_to_device".into(),
            GpuKernel::Download => "gpu::device_to_host".into(),
            GpuKernel::View(name) => format!("gpu::{name}"),
            GpuKernel::Launch { op, .. } => format!("gpu::{}", op.name()),
        }
    }

    fn compute(&self, output: &Shape, inputs: &[Argument]) -> Result<Argument> {
        match self {
            GpuKernel::Literal(l) => Ok(l.argument()),
            GpuKernel::Resident(a) => Ok(a.clone()),
            GpuKernel::Upload(device) => to_device(device, &inputs[0]),
            GpuKernel::Download => to_host(&inputs[0]),
            GpuKernel::View(_) => inputs[0].with_shape(output.clone()),
            GpuKernel::Launch { op, device } => {
                let result = Argument::new(output.clone(), allocate(device, output.storage_bytes())?)?;
                let args = inputs.iter().map(kernel_arg).collect::<Result<Vec<_>>>()?;
                device.launch(op, &kernel_arg(&result)?, &args)?;
                Ok(result)
            }
        }
    }
}

impl Target for GpuTarget {
    fn name(&self) -> &str {
        "gpu"
    }

    fn passes(&self) -> Vec<Box<dyn Pass>> {
        vec![
            Box::new(EliminateDeadCode),
            Box::new(InsertContiguous::new(|op| {
                op.is_compute() && !matches!(op, Operator::Contiguous)
            })),
            Box::new(InsertTransfers {
                offload_copy: self.offload_copy,
            }),
        ]
    }

    fn bind(&self, program: &Program, ins: InstructionRef) -> Result<Box<dyn Kernel>> {
        let instruction = program.get(ins)?;
        let kernel = match instruction.op() {
            Operator::Literal(l) => GpuKernel::Literal(l.clone()),
            Operator::HostToDevice => match program.get(instruction.inputs()[0])?.op() {
                Operator::Literal(l) => {
                    GpuKernel::Resident(to_device(&self.device, &l.argument())?)
                }
                _ => GpuKernel::Upload(self.device.clone()),
            },
            Operator::DeviceToHost => GpuKernel::Download,
            op if op.is_view() => GpuKernel::View(op.name()),
            op if op.is_compute() && self.device.supports(op, instruction.shape().dtype()) => {
                GpuKernel::Launch {
                    op: op.clone(),
                    device: self.device.clone(),
                }
            }
            op => {
                return Err(Error::Lowering {
                    op: op.name().into(),
                    target: format!("{}:{}", self.name(), self.device.name()),
                    reason: format!("no kernel producing {}", instruction.shape().dtype()),
                })
            }
        };
        Ok(Box::new(kernel))
    }
}
