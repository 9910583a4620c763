use std::sync::Arc;

use log::{error, trace};

use crate::argument::Argument;
use crate::buffer::{Buffer, HostBuffer, Location};
use crate::dtype::Dtype;
use crate::error::{Error, Result};
use crate::ops::Operator;
use crate::shape::Shape;

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod sim;

pub mod prelude {
    #[cfg(feature = "cuda")]
    pub use super::cuda::CudaDevice;
    pub use super::sim::{SimDevice, SimStats};
    pub use super::{to_device, to_host, Device, DeviceBuffer};
}

/// Address in device memory. Only meaningful to the device that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

/// Kernel operand: a device address and the shape to read or write it as.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelArg {
    pub ptr: DevicePtr,
    pub shape: Shape,
}

/// Narrow memory and stream capability of an accelerator.
///
/// `launch` may only enqueue; work is guaranteed complete after `synchronize`.
/// Copies are ordered after every launch enqueued before them. A queued launch that
/// fails is reported by the next `synchronize` or copy.
pub trait Device: Send + Sync + core::fmt::Debug {
    fn name(&self) -> &str;
    fn alloc(&self, bytes: usize) -> Result<DevicePtr>;
    fn free(&self, ptr: DevicePtr) -> Result<()>;
    fn copyin(&self, src: &[u8], dst: DevicePtr) -> Result<()>;
    fn copyout(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()>;
    fn launch(&self, op: &Operator, output: &KernelArg, inputs: &[KernelArg]) -> Result<()>;
    fn synchronize(&self) -> Result<()>;
    /// Whether `launch` can run `op` producing `dtype`.
    fn supports(&self, op: &Operator, dtype: Dtype) -> bool;
}

/// Owning handle of a device allocation. Shared through `Arc`; the allocation is
/// freed when the last reference drops.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    bytes: usize,
    device: Arc<dyn Device>,
}

impl core::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<DeviceBuffer {:#x} {} bytes on {}>",
            self.ptr.0,
            self.bytes,
            self.device.name()
        )
    }
}

impl DeviceBuffer {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

// SAFETY: device addresses are never dereferenced on the host.
unsafe impl Buffer for DeviceBuffer {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.0 as *const u8
    }

    fn bytesize(&self) -> usize {
        self.bytes
    }

    fn location(&self) -> Location {
        Location::Device
    }

    fn as_device(&self) -> Option<&DeviceBuffer> {
        Some(self)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        trace!("free {self:?}");
        if let Err(e) = self.device.free(self.ptr) {
            error!("releasing {self:?}: {e}");
        }
    }
}

pub fn allocate(device: &Arc<dyn Device>, bytes: usize) -> Result<Arc<DeviceBuffer>> {
    let ptr = device.alloc(bytes)?;
    let buffer = DeviceBuffer {
        ptr,
        bytes,
        device: device.clone(),
    };
    trace!("alloc {buffer:?}");
    Ok(Arc::new(buffer))
}

/// Allocates and copies `data` to the device. The allocation is released again if
/// the copy fails.
pub fn upload(device: &Arc<dyn Device>, data: &[u8]) -> Result<Arc<DeviceBuffer>> {
    let buffer = allocate(device, data.len())?;
    device.copyin(data, buffer.ptr)?;
    Ok(buffer)
}

/// Waits for queued work, then copies the whole allocation to a new host buffer.
pub fn download(buffer: &DeviceBuffer) -> Result<HostBuffer> {
    buffer.device.synchronize()?;
    let mut host = HostBuffer::zeroed(buffer.bytes);
    buffer.device.copyout(buffer.ptr, host.as_bytes_mut())?;
    Ok(host)
}

/// Copies `arg` into a fresh allocation on `device`, keeping its layout.
pub fn to_device(device: &Arc<dyn Device>, arg: &Argument) -> Result<Argument> {
    if arg.location() == Some(Location::Device) {
        return to_device(device, &to_host(arg)?);
    }
    let buffer = upload(device, arg.host_bytes()?)?;
    Argument::new(arg.shape().clone(), buffer)
}

/// Copies `arg` into a fresh host buffer, keeping its layout.
pub fn to_host(arg: &Argument) -> Result<Argument> {
    let host = match arg.buffer()?.as_device() {
        Some(device) => download(device)?,
        None => HostBuffer::from_bytes(arg.host_bytes()?),
    };
    Argument::new(arg.shape().clone(), Arc::new(host))
}

/// Device operand for a kernel launch.
pub(crate) fn kernel_arg(arg: &Argument) -> Result<KernelArg> {
    match arg.buffer()?.as_device() {
        Some(buffer) => Ok(KernelArg {
            ptr: buffer.ptr,
            shape: arg.shape().clone(),
        }),
        None => Err(Error::Storage(format!(
            "kernel operand {arg:?} is not on the device"
        ))),
    }
}
