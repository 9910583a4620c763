use std::path::Path;
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, IxDyn, ShapeBuilder};

use crate::buffer::{Buffer, HostBuffer, Location, MmapBuffer};
use crate::dtype::NumType;
use crate::error::{Error, Result};
use crate::shape::Shape;

/// Runtime tensor value: a shape plus shared storage.
///
/// The argument never knows what kind of storage it holds. Cloning shares the
/// storage handle, and the storage is released when the last clone is dropped.
#[derive(Clone)]
pub struct Argument {
    shape: Shape,
    data: Option<Arc<dyn Buffer>>,
}

impl core::fmt::Debug for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(b) => write!(f, "<Argument {} on {:?}>", self.shape, b.location()),
            None => write!(f, "<Argument {} absent>", self.shape),
        }
    }
}

impl Argument {
    pub fn new(shape: Shape, data: Arc<dyn Buffer>) -> Result<Self> {
        if data.bytesize() < shape.storage_bytes() {
            return Err(Error::Storage(format!(
                "{} byte buffer cannot back {shape}",
                data.bytesize()
            )));
        }
        if data.location() == Location::Host {
            let ptr = data.as_ptr();
            if ptr.is_null() || ptr as usize % shape.type_size() != 0 {
                return Err(Error::Storage(format!(
                    "host pointer {ptr:?} is not aligned for {}",
                    shape.dtype()
                )));
            }
        }
        Ok(Self {
            shape,
            data: Some(data),
        })
    }

    pub(crate) fn from_host(shape: Shape, data: Arc<HostBuffer>) -> Self {
        Self {
            shape,
            data: Some(data),
        }
    }

    /// Argument whose storage has not been decided yet.
    pub fn absent(shape: Shape) -> Self {
        Self { shape, data: None }
    }

    pub fn from_vec<T: NumType>(shape: Shape, data: &[T]) -> Result<Self> {
        let literal = crate::literal::Literal::new(shape, data)?;
        Ok(literal.argument())
    }

    pub fn from_array<T: NumType>(array: ArrayD<T>) -> Self {
        let shape = Shape::new(T::DTYPE, array.shape().to_vec());
        let elems: Vec<T> = array.iter().copied().collect();
        Self::from_host(shape, Arc::new(HostBuffer::from_elems(&elems)))
    }

    /// Memory-maps `path` as the storage of `shape`.
    pub fn from_file<P: AsRef<Path>>(shape: Shape, path: P) -> Result<Self> {
        Self::new(shape, Arc::new(MmapBuffer::open(path)?))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn is_absent(&self) -> bool {
        self.data.is_none()
    }

    pub fn location(&self) -> Option<Location> {
        self.data.as_ref().map(|b| b.location())
    }

    pub fn buffer(&self) -> Result<&Arc<dyn Buffer>> {
        self.data
            .as_ref()
            .ok_or_else(|| Error::Storage(format!("argument {} has no storage", self.shape)))
    }

    /// Resolves the storage pointer. Host or device address depending on location.
    pub fn data(&self) -> Result<*const u8> {
        Ok(self.buffer()?.as_ptr())
    }

    pub fn shares_storage(&self, other: &Argument) -> bool {
        match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8,
            _ => false,
        }
    }

    /// Reinterprets the same storage under another shape.
    pub fn with_shape(&self, shape: Shape) -> Result<Argument> {
        match &self.data {
            Some(data) => Argument::new(shape, data.clone()),
            None => Ok(Argument::absent(shape)),
        }
    }

    fn host_buffer(&self) -> Result<&Arc<dyn Buffer>> {
        let buffer = self.buffer()?;
        if buffer.location() != Location::Host {
            return Err(Error::Storage(format!(
                "argument {} lives on the device; copy it to the host first",
                self.shape
            )));
        }
        Ok(buffer)
    }

    /// Raw bytes spanned by the shape's strides, for host arguments.
    pub(crate) fn host_bytes(&self) -> Result<&[u8]> {
        let buffer = self.host_buffer()?;
        // SAFETY: construction checked bytesize >= storage_bytes and the borrow of
        // `self` keeps the storage alive.
        unsafe {
            Ok(std::slice::from_raw_parts(
                buffer.as_ptr(),
                self.shape.storage_bytes(),
            ))
        }
    }

    pub fn view<T: NumType>(&self) -> Result<ArrayViewD<'_, T>> {
        if T::DTYPE != self.shape.dtype() {
            return Err(Error::UnsupportedType(format!(
                "cannot view {} data as {}",
                self.shape.dtype(),
                T::DTYPE
            )));
        }
        let buffer = self.host_buffer()?;
        let dim = IxDyn(self.shape.lens()).strides(IxDyn(self.shape.strides()));
        // SAFETY: construction checked that the buffer spans every strided offset of
        // the shape, host buffers are 8-byte aligned, and the borrow of `self` keeps
        // the storage alive for the view's lifetime.
        unsafe { Ok(ArrayViewD::from_shape_ptr(dim, buffer.as_ptr() as *const T)) }
    }

    /// Elements in logical row-major order.
    pub fn to_vec<T: NumType>(&self) -> Result<Vec<T>> {
        Ok(self.view::<T>()?.iter().copied().collect())
    }
}
