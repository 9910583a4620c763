pub mod argument;
pub mod buffer;
pub mod config;
/// Device memory ownership: Device -> DeviceBuffer (Arc) -> Argument
pub mod device;
pub mod dtype;
pub mod error;
pub mod eval;
pub mod export;
pub mod literal;
/// Operator -> compute_shape at construction, reference::compute as the host kernel
pub mod ops;
pub mod program;
pub mod shape;
pub mod target;

pub use error::{Error, ErrorKind, Result};

pub mod prelude {
    pub use crate::argument::Argument;
    pub use crate::buffer::{Buffer, HostBuffer, Location};
    pub use crate::device::prelude::*;
    pub use crate::dtype::{f16, Dtype, FloatType, NumType};
    pub use crate::error::{Error, ErrorKind};
    pub use crate::export::BufferInfo;
    pub use crate::literal::Literal;
    pub use crate::ops::{Convolution, Operator};
    pub use crate::program::{InstructionRef, Parameters, Program};
    pub use crate::shape::Shape;
    pub use crate::target::{cpu::CpuTarget, gpu::GpuTarget, Kernel, Pass, Target};
}
