use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::ptr::null_mut;
use std::sync::{Arc, Mutex};

use cudarc::driver::result::{free_sync, malloc_sync, memcpy_dtoh_sync, memcpy_htod_sync};
use cudarc::driver::sys::{
    cuLaunchKernel, cuModuleGetFunction, cuModuleLoadData, cudaError_enum, CUdeviceptr,
    CUfunction, CUmodule, CUresult,
};
use itertools::Itertools;
use log::{debug, trace};

use super::{Device, DevicePtr, KernelArg};
use crate::dtype::Dtype;
use crate::error::{Error, Result};
use crate::ops::Operator;
use crate::shape::Shape;

const BLOCK: usize = 256;
const KERNEL: &str = "rtg_kernel";

fn check(call: &'static str, r: CUresult) -> Result<()> {
    if r != cudaError_enum::CUDA_SUCCESS {
        return Err(Error::device(call, format!("{r:?}")));
    }
    Ok(())
}

fn driver<T>(call: &'static str, r: std::result::Result<T, cudarc::driver::DriverError>) -> Result<T> {
    r.map_err(|e| Error::device(call, format!("{e:?}")))
}

/// NVIDIA GPU through the driver API. Kernels are rendered per operator and shape,
/// compiled with NVRTC and cached by source.
#[derive(Debug)]
pub struct CudaDevice {
    device: Arc<cudarc::driver::CudaDevice>,
    kernels: Mutex<HashMap<String, CUfunction>>,
}

// SAFETY: CUfunction handles are plain driver handles valid in the device's primary
// context, which every call binds before use.
unsafe impl Send for CudaDevice {}
unsafe impl Sync for CudaDevice {}

impl CudaDevice {
    pub fn new(ordinal: usize) -> Result<Arc<Self>> {
        let device = driver("init", cudarc::driver::CudaDevice::new(ordinal))?;
        Ok(Arc::new(Self {
            device,
            kernels: Mutex::new(HashMap::new()),
        }))
    }

    fn bind(&self) -> Result<()> {
        driver("bind", self.device.bind_to_thread())
    }

    fn function(&self, src: &str) -> Result<CUfunction> {
        let mut kernels = self.kernels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(f) = kernels.get(src) {
            return Ok(*f);
        }
        debug!("cuda: compiling\n{src}");
        let ptx = cudarc::nvrtc::compile_ptx(src)
            .map_err(|e| Error::device("nvrtc", format!("{e:?}")))?;
        let image = CString::new(ptx.to_src())
            .map_err(|e| Error::device("nvrtc", e.to_string()))?;
        let name = CString::new(KERNEL).map_err(|e| Error::device("nvrtc", e.to_string()))?;
        let mut module: CUmodule = null_mut();
        let mut func: CUfunction = null_mut();
        // SAFETY: out-pointers are valid locals; the image is a NUL terminated PTX string.
        unsafe {
            check(
                "cuModuleLoadData",
                cuModuleLoadData(&mut module, image.as_ptr() as *const c_void),
            )?;
            check(
                "cuModuleGetFunction",
                cuModuleGetFunction(&mut func, module, name.as_ptr()),
            )?;
        }
        kernels.insert(src.to_string(), func);
        Ok(func)
    }
}

impl Device for CudaDevice {
    fn name(&self) -> &str {
        "cuda"
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        self.bind()?;
        // SAFETY: the returned pointer is owned by a DeviceBuffer which frees it once.
        let ptr = driver("cuMemAlloc", unsafe { malloc_sync(bytes.max(1)) })?;
        trace!("cuda: alloc {bytes} bytes at {ptr:#x}");
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.bind()?;
        // SAFETY: `ptr` came from `alloc` and is freed exactly once by its owner.
        driver("cuMemFree", unsafe { free_sync(ptr.0 as CUdeviceptr) })
    }

    fn copyin(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        self.bind()?;
        // SAFETY: callers only copy into allocations at least `src.len()` long.
        driver("cuMemcpyHtoD", unsafe {
            memcpy_htod_sync(dst.0 as CUdeviceptr, src)
        })
    }

    fn copyout(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        self.bind()?;
        // SAFETY: callers only copy out of allocations at least `dst.len()` long.
        driver("cuMemcpyDtoH", unsafe {
            memcpy_dtoh_sync(dst, src.0 as CUdeviceptr)
        })
    }

    fn launch(&self, op: &Operator, output: &KernelArg, inputs: &[KernelArg]) -> Result<()> {
        if !self.supports(op, output.shape.dtype()) {
            return Err(Error::device(
                "launch",
                format!("no {op} kernel for {}", output.shape.dtype()),
            ));
        }
        self.bind()?;
        let shapes = inputs.iter().map(|i| &i.shape).collect_vec();
        let src = render(op, &output.shape, &shapes)?;
        let func = self.function(&src)?;
        let mut ptrs: Vec<CUdeviceptr> = std::iter::once(output)
            .chain(inputs)
            .map(|a| a.ptr.0 as CUdeviceptr)
            .collect();
        let mut params: Vec<*mut c_void> = ptrs
            .iter_mut()
            .map(|p| p as *mut CUdeviceptr as *mut c_void)
            .collect();
        let n = output.shape.elements();
        let grid = n.div_ceil(BLOCK).max(1);
        trace!("cuda: launch {op} grid {grid} block {BLOCK}");
        // SAFETY: `params` points at one device pointer per kernel parameter and
        // outlives the call, which copies them.
        unsafe {
            check(
                "cuLaunchKernel",
                cuLaunchKernel(
                    func,
                    grid as u32,
                    1,
                    1,
                    BLOCK as u32,
                    1,
                    1,
                    0,
                    null_mut(),
                    params.as_mut_ptr(),
                    null_mut(),
                ),
            )
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.bind()?;
        driver("cuCtxSynchronize", self.device.synchronize())
    }

    fn supports(&self, op: &Operator, dtype: Dtype) -> bool {
        match op {
            Operator::Contiguous => dtype != Dtype::Half,
            op => op.is_compute() && matches!(dtype, Dtype::Float | Dtype::Double),
        }
    }
}

/// Offset expression of element `i` of a standard-layout iteration over `shape`.
fn offset(shape: &Shape) -> String {
    if shape.standard() {
        return "i".into();
    }
    let lens = shape.lens();
    (0..lens.len())
        .filter(|&d| lens[d] != 1)
        .map(|d| {
            let inner: usize = lens[d + 1..].iter().product();
            format!("((i / {inner}ull) % {}ull) * {}ull", lens[d], shape.strides()[d])
        })
        .join(" + ")
}

/// CUDA C source of one thread-per-output-element kernel for `op`.
pub(crate) fn render(op: &Operator, output: &Shape, inputs: &[&Shape]) -> Result<String> {
    let t = output.dtype().c_name();
    let n = output.elements();
    let params = std::iter::once(format!("{t}* out"))
        .chain((0..inputs.len()).map(|k| format!("const {t}* in{k}")))
        .join(", ");
    let load = |k: usize| {
        let off = offset(inputs[k]);
        if off.is_empty() {
            format!("in{k}[0]")
        } else {
            format!("in{k}[{off}]")
        }
    };
    let body = match op {
        Operator::Exp | Operator::Sin | Operator::Cos | Operator::Tan => {
            format!("out[i] = {}({});", op.name(), load(0))
        }
        Operator::Add => format!("out[i] = {} + {};", load(0), load(1)),
        Operator::Mul => format!("out[i] = {};", (0..inputs.len()).map(load).join(" * ")),
        Operator::Contiguous => format!("out[i] = {};", load(0)),
        Operator::Gemm { alpha } => {
            let (k, cols) = (inputs[0][1], output[1]);
            format!(
                "const unsigned long long r = i / {cols}ull, c = i % {cols}ull;\n  \
                 double acc = 0.0;\n  \
                 for (unsigned long long l = 0; l < {k}ull; ++l) acc += (double)in0[r * {k}ull + l] * (double)in1[l * {cols}ull + c];\n  \
                 out[i] = ({t})(acc * {alpha:?});"
            )
        }
        Operator::Softmax { axis } => {
            let len = output[*axis];
            let inner: usize = output.lens()[axis + 1..].iter().product();
            format!(
                "const unsigned long long base = (i / {span}ull) * {span}ull + i % {inner}ull;\n  \
                 double m = -INFINITY, s = 0.0;\n  \
                 for (unsigned long long j = 0; j < {len}ull; ++j) m = fmax(m, (double)in0[base + j * {inner}ull]);\n  \
                 for (unsigned long long j = 0; j < {len}ull; ++j) s += exp((double)in0[base + j * {inner}ull] - m);\n  \
                 out[i] = ({t})(exp((double)in0[i] - m) / s);",
                span = len * inner
            )
        }
        Operator::Convolution(conv) => {
            let (x, w) = (inputs[0], inputs[1]);
            let (c, h, wd) = (x[1], x[2] as i64, x[3] as i64);
            let (kh, kw) = (w[2], w[3]);
            let (oc, oh, ow) = (output[1], output[2], output[3]);
            format!(
                "const long long ox = i % {ow}, oy = (i / {ow}) % {oh}, o = (i / {ohw}) % {oc}, b = i / {ochw};\n  \
                 double acc = 0.0;\n  \
                 for (long long ch = 0; ch < {c}; ++ch)\n  \
                 for (long long ky = 0; ky < {kh}; ++ky) {{\n    \
                   const long long iy = oy * {sh} + ky * {dh} - {ph};\n    \
                   if (iy < 0 || iy >= {h}) continue;\n    \
                   for (long long kx = 0; kx < {kw}; ++kx) {{\n      \
                     const long long ix = ox * {sw} + kx * {dw} - {pw};\n      \
                     if (ix < 0 || ix >= {wd}) continue;\n      \
                     acc += (double)in0[((b * {c} + ch) * {h} + iy) * {wd} + ix] * (double)in1[((o * {c} + ch) * {kh} + ky) * {kw} + kx];\n    \
                   }}\n  \
                 }}\n  \
                 out[i] = ({t})acc;",
                ohw = oh * ow,
                ochw = oc * oh * ow,
                sh = conv.stride[0],
                sw = conv.stride[1],
                dh = conv.dilation[0],
                dw = conv.dilation[1],
                ph = conv.padding[0],
                pw = conv.padding[1],
            )
        }
        op => {
            return Err(Error::Lowering {
                op: op.name().into(),
                target: "cuda".into(),
                reason: "no device kernel".into(),
            })
        }
    };
    Ok(format!(
        "extern \"C\" __global__ void {KERNEL}({params}) {{\n  \
         const unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;\n  \
         if (i >= {n}ull) return;\n  \
         {body}\n}}\n"
    ))
}
