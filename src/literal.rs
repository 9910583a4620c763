use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::argument::Argument;
use crate::buffer::HostBuffer;
use crate::dtype::NumType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::visit_dtype;

/// Immutable tensor constant embedded in a program.
#[derive(Clone)]
pub struct Literal {
    shape: Shape,
    data: Arc<HostBuffer>,
}

impl Literal {
    /// Builds a literal from elements in row-major order. The element type must
    /// match the shape's type and the count must match its element count.
    pub fn new<T: NumType>(shape: Shape, data: &[T]) -> Result<Self> {
        if T::DTYPE != shape.dtype() {
            return Err(Error::shape(
                "literal",
                format!("{} data for a {} shape", T::DTYPE, shape.dtype()),
            ));
        }
        if !shape.standard() || data.len() != shape.elements() {
            return Err(Error::shape(
                "literal",
                format!("{} elements given for {shape}", data.len()),
            ));
        }
        Ok(Self {
            shape,
            data: Arc::new(HostBuffer::from_elems(data)),
        })
    }

    pub fn from_bytes(shape: Shape, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != shape.storage_bytes() {
            return Err(Error::shape(
                "literal",
                format!("{} bytes given for {shape}", bytes.len()),
            ));
        }
        Ok(Self {
            shape,
            data: Arc::new(HostBuffer::from_bytes(bytes)),
        })
    }

    /// Deterministic pseudo-random literal: floats in [-1, 1), integers in [0, 16).
    pub fn generate(shape: Shape, seed: u64) -> Self {
        let shape = shape.as_standard();
        let mut rng = StdRng::seed_from_u64(seed);
        let n = shape.elements();
        let data = visit_dtype!(shape.dtype(), T => {
            let elems: Vec<T> = (0..n)
                .map(|_| {
                    let v = if T::DTYPE.is_float() {
                        rng.gen_range(-1.0f64..1.0)
                    } else {
                        rng.gen_range(0u32..16) as f64
                    };
                    <T as num_traits::FromPrimitive>::from_f64(v).unwrap_or_default()
                })
                .collect();
            HostBuffer::from_elems(&elems)
        });
        Self {
            shape,
            data: Arc::new(data),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Host argument sharing the literal's storage.
    pub fn argument(&self) -> Argument {
        Argument::from_host(self.shape.clone(), self.data.clone())
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && (Arc::ptr_eq(&self.data, &other.data) || self.as_bytes() == other.as_bytes())
    }
}

impl core::fmt::Debug for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}", self.shape)
    }
}
