use std::path::Path;

use crate::device::DeviceBuffer;
use crate::dtype::NumType;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device,
}

/// Backing storage of an `Argument`.
///
/// Implementors own their allocation; an `Argument` keeps it alive by holding an
/// `Arc<dyn Buffer>`, so the pointer stays valid for as long as any copy of the
/// argument exists.
///
/// # Safety
///
/// For a buffer whose `location` is `Location::Host`, `as_ptr` must be valid for
/// reads of `bytesize` initialized bytes for as long as `self` lives, and neither
/// may change over that time. `Argument::new` additionally rejects null pointers
/// and pointers not aligned for the element type. Device buffers are never
/// dereferenced on the host; their pointer is only handed back to the device that
/// produced it.
pub unsafe trait Buffer: core::fmt::Debug + Send + Sync {
    fn as_ptr(&self) -> *const u8;
    fn bytesize(&self) -> usize;
    fn location(&self) -> Location {
        Location::Host
    }
    fn as_device(&self) -> Option<&DeviceBuffer> {
        None
    }
}

/// Host heap storage, 8-byte aligned so any element type can be viewed in place.
#[derive(Clone)]
pub struct HostBuffer {
    words: Vec<u64>,
    bytesize: usize,
}

impl core::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<HostBuffer {} bytes>", self.bytesize)
    }
}

impl HostBuffer {
    pub fn zeroed(bytesize: usize) -> Self {
        Self {
            words: vec![0u64; bytesize.div_ceil(8)],
            bytesize,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut ret = Self::zeroed(bytes.len());
        ret.as_bytes_mut().copy_from_slice(bytes);
        ret
    }

    pub fn from_elems<T: NumType>(elems: &[T]) -> Self {
        let size = std::mem::size_of::<T>();
        let mut ret = Self::zeroed(elems.len() * size);
        for (dst, e) in ret.as_bytes_mut().chunks_exact_mut(size).zip(elems) {
            dst.copy_from_slice(&e._to_le_bytes());
        }
        ret
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` holds at least `bytesize` initialized bytes and u8 has no
        // alignment requirement.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.bytesize) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_bytes`, and `&mut self` guarantees exclusive access.
        unsafe {
            std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.bytesize)
        }
    }
}

// SAFETY: `words` is a live, 8-byte aligned allocation of at least `bytesize` bytes.
unsafe impl Buffer for HostBuffer {
    fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }

    fn bytesize(&self) -> usize {
        self.bytesize
    }
}

/// Read-only storage mapped from a file.
#[derive(Debug)]
pub struct MmapBuffer {
    map: memmap2::Mmap,
}

impl MmapBuffer {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        // SAFETY: the mapping is read only; callers must not truncate the file while
        // an argument refers to it.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        if map.as_ptr() as usize % 8 != 0 {
            return Err(Error::Storage("file mapping is not 8-byte aligned".into()));
        }
        Ok(Self { map })
    }
}

// SAFETY: `open` rejects mappings that are not 8-byte aligned, and the read-only
// mapping lives as long as `self`.
unsafe impl Buffer for MmapBuffer {
    fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    fn bytesize(&self) -> usize {
        self.map.len()
    }
}
