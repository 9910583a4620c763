use crate::argument::Argument;
use crate::buffer::Location;
use crate::error::{Error, Result};

/// Flat strided view of a host argument, in the layout array libraries expect
/// from a buffer protocol: byte strides and a `struct` format character.
///
/// The view holds a clone of the argument, so `ptr` stays valid while it lives.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub ptr: *const u8,
    pub itemsize: usize,
    pub format: &'static str,
    pub ndim: usize,
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub size: usize,
    pub bytes: usize,
    _owner: Argument,
}

impl Argument {
    pub fn buffer_info(&self) -> Result<BufferInfo> {
        let shape = self.shape();
        let format = shape.dtype().format()?;
        if self.location() != Some(Location::Host) {
            return Err(Error::Storage(format!(
                "only host arguments can be exported, got {self:?}"
            )));
        }
        let itemsize = shape.type_size();
        Ok(BufferInfo {
            ptr: self.data()?,
            itemsize,
            format,
            ndim: shape.ndim(),
            shape: shape.lens().to_vec(),
            strides: shape.strides().iter().map(|s| s * itemsize).collect(),
            size: shape.elements(),
            bytes: shape.bytes(),
            _owner: self.clone(),
        })
    }
}
