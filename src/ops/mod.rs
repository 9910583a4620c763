pub mod reference;

use itertools::Itertools;

use crate::error::{Error, Result};
use crate::literal::Literal;
use crate::shape::Shape;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Convolution {
    pub padding: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
}

impl Default for Convolution {
    fn default() -> Self {
        Self {
            padding: [0, 0],
            stride: [1, 1],
            dilation: [1, 1],
        }
    }
}

impl Convolution {
    pub fn new(padding: [usize; 2], stride: [usize; 2]) -> Self {
        Self {
            padding,
            stride,
            ..Default::default()
        }
    }

    pub fn with_dilation(mut self, dilation: [usize; 2]) -> Self {
        self.dilation = dilation;
        self
    }

    fn output_len(&self, dim: usize, input: usize, kernel: usize) -> Option<usize> {
        if kernel == 0 || self.stride[dim] == 0 {
            return None;
        }
        let padded = input + 2 * self.padding[dim];
        let span = self.dilation[dim] * (kernel - 1) + 1;
        if padded < span {
            return None;
        }
        Some((padded - span) / self.stride[dim] + 1)
    }
}

/// Every operation a program can contain.
#[derive(Clone, Debug, PartialEq)]
pub enum Operator {
    Literal(Literal),
    Parameter { name: String, shape: Shape },
    Exp,
    Sin,
    Cos,
    Tan,
    Add,
    /// Product of two or more inputs.
    Mul,
    /// `0` keeps the input extent at that position, one `-1` is inferred.
    Reshape { dims: Vec<i64> },
    Transpose { permutation: Vec<usize> },
    Contiguous,
    Gemm { alpha: f32 },
    Softmax { axis: usize },
    Convolution(Convolution),
    HostToDevice,
    DeviceToHost,
}

impl Operator {
    pub fn reshape(dims: &[i64]) -> Self {
        Operator::Reshape {
            dims: dims.to_vec(),
        }
    }

    pub fn transpose(permutation: &[usize]) -> Self {
        Operator::Transpose {
            permutation: permutation.to_vec(),
        }
    }

    pub fn gemm() -> Self {
        Operator::Gemm { alpha: 1.0 }
    }

    /// Softmax over the channel axis, axis 1. The input must have rank 2 or more;
    /// a rank 1 input is rejected with a shape mismatch and needs
    /// `Operator::Softmax { axis: 0 }`.
    pub fn softmax() -> Self {
        Operator::Softmax { axis: 1 }
    }

    pub fn convolution(padding: [usize; 2], stride: [usize; 2]) -> Self {
        Operator::Convolution(Convolution::new(padding, stride))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Literal(_) => "@literal",
            Operator::Parameter { .. } => "@param",
            Operator::Exp => "exp",
            Operator::Sin => "sin",
            Operator::Cos => "cos",
            Operator::Tan => "tan",
            Operator::Add => "add",
            Operator::Mul => "mul",
            Operator::Reshape { .. } => "reshape",
            Operator::Transpose { .. } => "transpose",
            Operator::Contiguous => "contiguous",
            Operator::Gemm { .. } => "gemm",
            Operator::Softmax { .. } => "softmax",
            Operator::Convolution(_) => "convolution",
            Operator::HostToDevice => "host_to_device",
            Operator::DeviceToHost => "device_to_host",
        }
    }

    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Operator::Exp | Operator::Sin | Operator::Cos | Operator::Tan | Operator::Add | Operator::Mul
        )
    }

    /// Operators whose output only reinterprets the input storage.
    pub fn is_view(&self) -> bool {
        matches!(self, Operator::Reshape { .. } | Operator::Transpose { .. })
    }

    /// Operators that read their inputs and write a fresh output buffer.
    pub fn is_compute(&self) -> bool {
        self.is_elementwise()
            || matches!(
                self,
                Operator::Contiguous
                    | Operator::Gemm { .. }
                    | Operator::Softmax { .. }
                    | Operator::Convolution(_)
            )
    }

    pub fn compute_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        match self {
            Operator::Literal(l) => {
                self.check_arity(inputs, 0)?;
                Ok(l.shape().clone())
            }
            Operator::Parameter { shape, .. } => {
                self.check_arity(inputs, 0)?;
                Ok(shape.clone())
            }
            Operator::Exp | Operator::Sin | Operator::Cos | Operator::Tan => {
                self.check_arity(inputs, 1)?;
                self.check_float(&inputs[0])?;
                Ok(inputs[0].as_standard())
            }
            Operator::Add | Operator::Mul => {
                if matches!(self, Operator::Add) {
                    self.check_arity(inputs, 2)?;
                } else if inputs.len() < 2 {
                    return Err(Error::shape(
                        self.name(),
                        format!("expected at least 2 inputs, got {}", inputs.len()),
                    ));
                }
                self.check_float(&inputs[0])?;
                for s in &inputs[1..] {
                    if s.dtype() != inputs[0].dtype() || s.lens() != inputs[0].lens() {
                        return Err(Error::shape(
                            self.name(),
                            format!("operands {} and {s} differ", inputs[0]),
                        ));
                    }
                }
                Ok(inputs[0].as_standard())
            }
            Operator::Reshape { dims } => {
                self.check_arity(inputs, 1)?;
                let lens = self.resolve_reshape(dims, &inputs[0])?;
                Ok(Shape::new(inputs[0].dtype(), lens))
            }
            Operator::Transpose { permutation } => {
                self.check_arity(inputs, 1)?;
                let rank = inputs[0].ndim();
                if !permutation.iter().copied().sorted().eq(0..rank) {
                    return Err(Error::shape(
                        self.name(),
                        format!("{permutation:?} is not a permutation of rank {rank}"),
                    ));
                }
                Ok(inputs[0].permute(permutation))
            }
            Operator::Contiguous => {
                self.check_arity(inputs, 1)?;
                Ok(inputs[0].as_standard())
            }
            Operator::Gemm { .. } => {
                self.check_arity(inputs, 2)?;
                let (a, b) = (&inputs[0], &inputs[1]);
                self.check_float(a)?;
                if a.dtype() != b.dtype() {
                    return Err(Error::shape(self.name(), format!("{a} and {b} differ in type")));
                }
                if a.ndim() != 2 || b.ndim() != 2 {
                    return Err(Error::shape(self.name(), "only rank 2 operands are supported"));
                }
                if a[1] != b[0] {
                    return Err(Error::shape(
                        self.name(),
                        format!("inner dimensions do not match: {} != {}", a[1], b[0]),
                    ));
                }
                Ok(Shape::new(a.dtype(), vec![a[0], b[1]]))
            }
            Operator::Softmax { axis } => {
                self.check_arity(inputs, 1)?;
                self.check_float(&inputs[0])?;
                if *axis >= inputs[0].ndim() {
                    return Err(Error::shape(
                        self.name(),
                        format!("axis {axis} out of range for {}", inputs[0]),
                    ));
                }
                Ok(inputs[0].as_standard())
            }
            Operator::Convolution(conv) => {
                self.check_arity(inputs, 2)?;
                let (x, w) = (&inputs[0], &inputs[1]);
                self.check_float(x)?;
                if x.ndim() != 4 || w.ndim() != 4 {
                    return Err(Error::shape(self.name(), "input and weights must be rank 4"));
                }
                if x.dtype() != w.dtype() {
                    return Err(Error::shape(self.name(), format!("{x} and {w} differ in type")));
                }
                if x[1] != w[1] {
                    return Err(Error::shape(
                        self.name(),
                        format!("input has {} channels but weights expect {}", x[1], w[1]),
                    ));
                }
                let out_h = conv.output_len(0, x[2], w[2]);
                let out_w = conv.output_len(1, x[3], w[3]);
                match (out_h, out_w) {
                    (Some(h), Some(wd)) => Ok(Shape::new(x.dtype(), vec![x[0], w[0], h, wd])),
                    _ => Err(Error::shape(
                        self.name(),
                        format!("kernel {w} does not fit input {x} with {conv:?}"),
                    )),
                }
            }
            Operator::HostToDevice | Operator::DeviceToHost => {
                self.check_arity(inputs, 1)?;
                Ok(inputs[0].clone())
            }
        }
    }

    fn check_arity(&self, inputs: &[Shape], n: usize) -> Result<()> {
        if inputs.len() != n {
            return Err(Error::shape(
                self.name(),
                format!("expected {n} inputs, got {}", inputs.len()),
            ));
        }
        Ok(())
    }

    fn check_float(&self, s: &Shape) -> Result<()> {
        if !s.dtype().is_float() {
            return Err(Error::shape(
                self.name(),
                format!("{} is not a float type", s.dtype()),
            ));
        }
        Ok(())
    }

    fn resolve_reshape(&self, dims: &[i64], input: &Shape) -> Result<Vec<usize>> {
        let mut lens = Vec::with_capacity(dims.len());
        let mut infer = None;
        for (i, &d) in dims.iter().enumerate() {
            match d {
                0 if i < input.ndim() => lens.push(input[i]),
                -1 if infer.is_none() => {
                    infer = Some(i);
                    lens.push(1);
                }
                d if d > 0 => lens.push(d as usize),
                _ => {
                    return Err(Error::shape(
                        self.name(),
                        format!("invalid dimension {d} at position {i} in {dims:?}"),
                    ))
                }
            }
        }
        if let Some(i) = infer {
            let known: usize = lens.iter().product();
            if known == 0 || input.elements() % known != 0 {
                return Err(Error::shape(
                    self.name(),
                    format!("cannot infer dimension {i} of {dims:?} from {input}"),
                ));
            }
            lens[i] = input.elements() / known;
        }
        if lens.iter().product::<usize>() != input.elements() {
            return Err(Error::shape(
                self.name(),
                format!(
                    "{} elements cannot be reshaped to {lens:?}",
                    input.elements()
                ),
            ));
        }
        Ok(lens)
    }
}

impl core::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::Literal(l) => write!(f, "{}{l:?}", self.name()),
            Operator::Parameter { name, .. } => write!(f, "{}:{name}", self.name()),
            Operator::Reshape { dims } => write!(f, "reshape[dims={{{}}}]", dims.iter().join(", ")),
            Operator::Transpose { permutation } => {
                write!(f, "transpose[permutation={{{}}}]", permutation.iter().join(", "))
            }
            Operator::Gemm { alpha } => write!(f, "gemm[alpha={alpha}]"),
            Operator::Softmax { axis } => write!(f, "softmax[axis={axis}]"),
            Operator::Convolution(c) => write!(
                f,
                "convolution[padding={:?},stride={:?},dilation={:?}]",
                c.padding, c.stride, c.dilation
            ),
            op => write!(f, "{}", op.name()),
        }
    }
}
