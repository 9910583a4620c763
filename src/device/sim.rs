use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{trace, warn};
use ndarray::{ArrayViewD, ArrayViewMutD, IxDyn, ShapeBuilder};

use super::{Device, DevicePtr, KernelArg};
use crate::dtype::{Dtype, NumType};
use crate::error::{Error, Result};
use crate::ops::{reference, Operator};
use crate::{visit_dtype, visit_float};

const BASE_ADDRESS: u64 = 0x1000;
const ALIGNMENT: u64 = 256;

/// Counters kept by `SimDevice`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub allocations: usize,
    pub frees: usize,
    /// Allocations not yet freed.
    pub live: usize,
    pub live_bytes: usize,
    pub launches: usize,
    pub syncs: usize,
    /// Frees of an address that was never allocated or is already freed.
    pub invalid_frees: usize,
}

#[derive(Debug)]
struct Allocation {
    words: Vec<u64>,
    bytes: usize,
}

#[derive(Debug)]
struct Launch {
    op: Operator,
    output: KernelArg,
    inputs: Vec<KernelArg>,
}

#[derive(Debug)]
struct State {
    memory: HashMap<u64, Allocation>,
    next: u64,
    queue: Vec<Launch>,
    /// First failure of a deferred launch, reported by the next sync or copy.
    failed: Option<Error>,
    stats: SimStats,
}

/// Accelerator simulated in host memory.
///
/// Launches are queued and only run on `synchronize`, on a copy, or on a free,
/// the way a device stream defers work. Kernels are the host reference kernels, so
/// results match `CpuTarget` exactly.
#[derive(Debug)]
pub struct SimDevice {
    state: Mutex<State>,
    capacity: Option<usize>,
    unsupported: Vec<Dtype>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                memory: HashMap::new(),
                next: BASE_ADDRESS,
                queue: vec![],
                failed: None,
                stats: SimStats::default(),
            }),
            capacity: None,
            unsupported: vec![],
        }
    }
}

impl SimDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Device whose allocations fail once `bytes` would be live at the same time.
    pub fn with_capacity(bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: Some(bytes),
            ..Default::default()
        })
    }

    /// Device with no kernels for `dtype`.
    pub fn without_dtype(dtype: Dtype) -> Arc<Self> {
        Arc::new(Self {
            unsupported: vec![dtype],
            ..Default::default()
        })
    }

    pub fn stats(&self) -> SimStats {
        self.state().stats
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl State {
    /// Runs queued launches. A failure drops the launches behind it and is kept
    /// until `settle` reports it.
    fn flush(&mut self) {
        let queue = std::mem::take(&mut self.queue);
        for (i, launch) in queue.iter().enumerate() {
            trace!("sim: run {} -> {:#x}", launch.op, launch.output.ptr.0);
            if let Err(e) = execute(&mut self.memory, launch) {
                warn!(
                    "sim: {} failed, dropping {} queued launches",
                    launch.op,
                    queue.len() - i - 1
                );
                self.failed.get_or_insert(Error::device(
                    "launch",
                    format!("{}: {e}", launch.op),
                ));
                return;
            }
        }
    }

    /// Flushes the queue and returns the first launch failure since the last call.
    fn settle(&mut self) -> Result<()> {
        self.flush();
        match self.failed.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn allocation(&self, call: &'static str, ptr: DevicePtr) -> Result<&Allocation> {
        self.memory
            .get(&ptr.0)
            .ok_or_else(|| Error::device(call, format!("{:#x} is not allocated", ptr.0)))
    }
}

impl Device for SimDevice {
    fn name(&self) -> &str {
        "sim"
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        let mut state = self.state();
        if let Some(capacity) = self.capacity {
            if state.stats.live_bytes + bytes > capacity {
                return Err(Error::device(
                    "alloc",
                    format!(
                        "out of memory: {bytes} bytes requested, {} of {capacity} in use",
                        state.stats.live_bytes
                    ),
                ));
            }
        }
        let address = state.next;
        let span = (bytes.max(1) as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next += span;
        state.memory.insert(
            address,
            Allocation {
                words: vec![0; bytes.div_ceil(8)],
                bytes,
            },
        );
        state.stats.allocations += 1;
        state.stats.live += 1;
        state.stats.live_bytes += bytes;
        Ok(DevicePtr(address))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state();
        state.flush();
        match state.memory.remove(&ptr.0) {
            Some(a) => {
                state.stats.frees += 1;
                state.stats.live -= 1;
                state.stats.live_bytes -= a.bytes;
            }
            None => {
                state.stats.invalid_frees += 1;
                return Err(Error::device(
                    "free",
                    format!("{:#x} is not allocated", ptr.0),
                ));
            }
        }
        Ok(())
    }

    fn copyin(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        let mut state = self.state();
        state.settle()?;
        let a = state
            .memory
            .get_mut(&dst.0)
            .ok_or_else(|| Error::device("copyin", format!("{:#x} is not allocated", dst.0)))?;
        if src.len() > a.bytes {
            return Err(Error::device(
                "copyin",
                format!("{} bytes into a {} byte allocation", src.len(), a.bytes),
            ));
        }
        bytes_mut(a)[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copyout(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        let mut state = self.state();
        state.settle()?;
        let a = state.allocation("copyout", src)?;
        if dst.len() > a.bytes {
            return Err(Error::device(
                "copyout",
                format!("{} bytes from a {} byte allocation", dst.len(), a.bytes),
            ));
        }
        dst.copy_from_slice(&bytes(a)[..dst.len()]);
        Ok(())
    }

    fn launch(&self, op: &Operator, output: &KernelArg, inputs: &[KernelArg]) -> Result<()> {
        if !self.supports(op, output.shape.dtype()) {
            return Err(Error::device(
                "launch",
                format!("no {op} kernel for {}", output.shape.dtype()),
            ));
        }
        if inputs.iter().any(|i| i.ptr == output.ptr) {
            return Err(Error::device(
                "launch",
                format!("{op} output {:#x} aliases an input", output.ptr.0),
            ));
        }
        let mut state = self.state();
        for arg in inputs.iter().chain(std::iter::once(output)) {
            let a = state.allocation("launch", arg.ptr)?;
            if a.bytes < arg.shape.storage_bytes() {
                return Err(Error::device(
                    "launch",
                    format!("{} does not fit {} bytes at {:#x}", arg.shape, a.bytes, arg.ptr.0),
                ));
            }
        }
        state.queue.push(Launch {
            op: op.clone(),
            output: output.clone(),
            inputs: inputs.to_vec(),
        });
        state.stats.launches += 1;
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        let mut state = self.state();
        state.stats.syncs += 1;
        state.settle()
    }

    fn supports(&self, op: &Operator, dtype: Dtype) -> bool {
        if self.unsupported.contains(&dtype) {
            return false;
        }
        match op {
            Operator::Contiguous => true,
            op => op.is_compute() && dtype.is_float(),
        }
    }
}

fn bytes(a: &Allocation) -> &[u8] {
    // SAFETY: `words` holds at least `bytes` initialized bytes.
    unsafe { std::slice::from_raw_parts(a.words.as_ptr() as *const u8, a.bytes) }
}

fn bytes_mut(a: &mut Allocation) -> &mut [u8] {
    // SAFETY: as in `bytes`, with exclusive access through `&mut`.
    unsafe { std::slice::from_raw_parts_mut(a.words.as_mut_ptr() as *mut u8, a.bytes) }
}

fn view<'a, T: NumType>(
    memory: &'a HashMap<u64, Allocation>,
    arg: &KernelArg,
) -> Result<ArrayViewD<'a, T>> {
    let a = memory
        .get(&arg.ptr.0)
        .ok_or_else(|| Error::device("launch", format!("{:#x} was freed", arg.ptr.0)))?;
    let dim = IxDyn(arg.shape.lens()).strides(IxDyn(arg.shape.strides()));
    // SAFETY: `launch` checked that the allocation spans the shape, words are 8-byte
    // aligned and the borrow of `memory` keeps them alive.
    unsafe { Ok(ArrayViewD::from_shape_ptr(dim, a.words.as_ptr() as *const T)) }
}

fn store<T: NumType>(
    memory: &mut HashMap<u64, Allocation>,
    out: &KernelArg,
    value: ArrayViewD<'_, T>,
) -> Result<()> {
    if value.shape() != out.shape.lens() {
        return Err(Error::device(
            "launch",
            format!("kernel produced {:?} for {}", value.shape(), out.shape),
        ));
    }
    let a = memory
        .get_mut(&out.ptr.0)
        .ok_or_else(|| Error::device("launch", format!("{:#x} was freed", out.ptr.0)))?;
    let dim = IxDyn(out.shape.lens()).strides(IxDyn(out.shape.strides()));
    // SAFETY: as in `view`, with exclusive access through `&mut memory`.
    let mut dst = unsafe { ArrayViewMutD::from_shape_ptr(dim, a.words.as_mut_ptr() as *mut T) };
    dst.assign(&value);
    Ok(())
}

fn execute(memory: &mut HashMap<u64, Allocation>, launch: &Launch) -> Result<()> {
    let dtype = launch.output.shape.dtype();
    match &launch.op {
        Operator::Contiguous => visit_dtype!(dtype, T => {
            let out = reference::contiguous(&view::<T>(memory, &launch.inputs[0])?);
            store(memory, &launch.output, out.view())
        }),
        op => visit_float!(dtype, T => {
            let inputs = launch
                .inputs
                .iter()
                .map(|i| view::<T>(memory, i))
                .collect::<Result<Vec<_>>>()?;
            let out = reference::run(op, &launch.output.shape, &inputs)?;
            drop(inputs);
            store(memory, &launch.output, out.view())
        }, _ => Err(Error::device("launch", format!("no {op} kernel for {dtype}")))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn launches_wait_for_synchronize() {
        let dev = SimDevice::new();
        let shape = Shape::new(Dtype::Float, vec![2]);
        let x = dev.alloc(8).unwrap();
        let y = dev.alloc(8).unwrap();
        let bytes: Vec<u8> = [0.0f32, 1.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        dev.copyin(&bytes, x).unwrap();
        let arg = |ptr| KernelArg {
            ptr,
            shape: shape.clone(),
        };
        dev.launch(&Operator::Exp, &arg(y), &[arg(x)]).unwrap();
        assert_eq!(dev.stats().launches, 1);
        assert_eq!(dev.state().queue.len(), 1);
        dev.synchronize().unwrap();
        assert!(dev.state().queue.is_empty());
        let mut out = [0u8; 8];
        dev.copyout(y, &mut out).unwrap();
        assert_eq!(f32::from_le_bytes([out[4], out[5], out[6], out[7]]), 1.0f32.exp());
    }

    #[test]
    fn rejects_aliasing_and_double_free() {
        let dev = SimDevice::new();
        let shape = Shape::new(Dtype::Float, vec![2]);
        let x = dev.alloc(8).unwrap();
        let arg = KernelArg { ptr: x, shape };
        assert!(dev.launch(&Operator::Exp, &arg, &[arg.clone()]).is_err());
        dev.free(x).unwrap();
        assert!(dev.free(x).is_err());
        assert_eq!(dev.stats().invalid_frees, 1);
        assert_eq!(dev.stats().live, 0);
    }

    #[test]
    fn deferred_launch_failure_surfaces_on_synchronize() {
        let dev = SimDevice::new();
        let shape = Shape::new(Dtype::Float, vec![2]);
        let x = dev.alloc(8).unwrap();
        let y = dev.alloc(8).unwrap();
        let z = dev.alloc(8).unwrap();
        let spare = dev.alloc(8).unwrap();
        let arg = |ptr| KernelArg {
            ptr,
            shape: shape.clone(),
        };
        // No kernel exists for a transfer; `launch` would refuse it, so queue it
        // directly as a launch that fails while running.
        dev.state().queue.push(Launch {
            op: Operator::HostToDevice,
            output: arg(y),
            inputs: vec![arg(x)],
        });
        dev.launch(&Operator::Exp, &arg(z), &[arg(x)]).unwrap();

        // Freeing an unrelated buffer runs the queue but still succeeds.
        dev.free(spare).unwrap();
        assert!(dev.state().queue.is_empty());

        let err = dev.synchronize().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Device);
        assert!(err.to_string().contains("host_to_device"));
        // The launch queued behind the failure never ran.
        let mut out = [0u8; 8];
        dev.copyout(z, &mut out).unwrap();
        assert_eq!(out, [0u8; 8]);
        dev.synchronize().unwrap();
    }

    #[test]
    fn capacity_limits_live_bytes() {
        let dev = SimDevice::with_capacity(16);
        let a = dev.alloc(12).unwrap();
        let err = dev.alloc(8).unwrap_err();
        assert!(err.is_environment());
        dev.free(a).unwrap();
        assert!(dev.alloc(8).is_ok());
    }
}
