use core::ops::Index;

use itertools::Itertools;

use crate::dtype::Dtype;
use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dtype: Dtype,
    lens: Vec<usize>,
    strides: Vec<usize>,
}

pub fn strides_for_shape(lens: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; lens.len()];
    let mut tmp = 1;
    strides
        .iter_mut()
        .zip(lens.iter())
        .rev()
        .for_each(|(st, sh)| {
            *st = tmp;
            tmp *= *sh
        });
    strides
}

impl Shape {
    /// Standard (row-major) shape.
    pub fn new<L: Into<Vec<usize>>>(dtype: Dtype, lens: L) -> Self {
        let lens = lens.into();
        let strides = strides_for_shape(&lens);
        Self {
            dtype,
            lens,
            strides,
        }
    }

    pub fn with_strides<L: Into<Vec<usize>>, S: Into<Vec<usize>>>(
        dtype: Dtype,
        lens: L,
        strides: S,
    ) -> Result<Self> {
        let (lens, strides) = (lens.into(), strides.into());
        if lens.len() != strides.len() {
            return Err(Error::shape(
                "shape",
                format!("{} lens but {} strides", lens.len(), strides.len()),
            ));
        }
        Ok(Self {
            dtype,
            lens,
            strides,
        })
    }

    pub fn scalar_of(dtype: Dtype) -> Self {
        Self::new(dtype, vec![])
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn ndim(&self) -> usize {
        self.lens.len()
    }

    pub fn type_size(&self) -> usize {
        self.dtype.size()
    }

    pub fn elements(&self) -> usize {
        self.lens.iter().product()
    }

    pub fn bytes(&self) -> usize {
        self.elements() * self.type_size()
    }

    /// Number of elements the strides span, i.e. one past the largest offset.
    pub fn element_space(&self) -> usize {
        if self.lens.iter().any(|&l| l == 0) {
            return 0;
        }
        self.lens
            .iter()
            .zip(self.strides.iter())
            .map(|(l, s)| (l - 1) * s)
            .sum::<usize>()
            + 1
    }

    /// Bytes a buffer backing this shape must hold.
    pub fn storage_bytes(&self) -> usize {
        self.element_space() * self.type_size()
    }

    /// Same lens and type in row-major layout.
    pub fn as_standard(&self) -> Shape {
        Shape::new(self.dtype, self.lens.clone())
    }

    pub fn standard(&self) -> bool {
        self.lens
            .iter()
            .zip(self.strides.iter().zip(strides_for_shape(&self.lens)))
            .all(|(&l, (&st, expected))| l == 1 || st == expected)
    }

    pub fn packed(&self) -> bool {
        self.elements() == self.element_space()
    }

    pub fn transposed(&self) -> bool {
        !self
            .lens
            .iter()
            .zip(self.strides.iter())
            .filter(|(l, _)| **l != 1)
            .map(|(_, &s)| s)
            .tuple_windows()
            .all(|(a, b)| a >= b)
    }

    pub fn broadcasted(&self) -> bool {
        self.lens
            .iter()
            .zip(self.strides.iter())
            .any(|(&l, &s)| s == 0 && l > 1)
    }

    pub fn scalar(&self) -> bool {
        self.lens.iter().all(|&l| l == 1)
    }

    /// Shape with lens and strides reordered by `perm`.
    pub fn permute(&self, perm: &[usize]) -> Shape {
        Shape {
            dtype: self.dtype,
            lens: perm.iter().map(|&p| self.lens[p]).collect(),
            strides: perm.iter().map(|&p| self.strides[p]).collect(),
        }
    }
}

impl Index<usize> for Shape {
    type Output = usize;
    fn index(&self, index: usize) -> &Self::Output {
        &self.lens[index]
    }
}

impl core::fmt::Display for Shape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}, {{{}}}, {{{}}}",
            self.dtype,
            self.lens.iter().join(", "),
            self.strides.iter().join(", ")
        )
    }
}

impl core::fmt::Debug for Shape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self}")
    }
}
