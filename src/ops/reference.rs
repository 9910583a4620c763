//! Host reference kernels. These define the numerics every other backend is
//! checked against.

use ndarray::{Array2, Array4, ArrayD, ArrayViewD, Axis, Ix2, Ix4};
use num_traits::NumCast;

use super::{Convolution, Operator};
use crate::argument::Argument;
use crate::dtype::{FloatType, NumType};
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::{visit_dtype, visit_float};

/// Computes `op` on host arguments.
pub fn compute(op: &Operator, output: &Shape, inputs: &[Argument]) -> Result<Argument> {
    match op {
        Operator::Literal(l) => Ok(l.argument()),
        Operator::Parameter { name, .. } => Err(Error::parameter(
            name.clone(),
            "parameters are supplied at evaluation time",
        )),
        Operator::Reshape { .. } | Operator::Transpose { .. } => {
            inputs[0].with_shape(output.clone())
        }
        Operator::Contiguous => visit_dtype!(output.dtype(), T => {
            Ok(Argument::from_array(contiguous(&inputs[0].view::<T>()?)))
        }),
        Operator::HostToDevice | Operator::DeviceToHost => Err(Error::Lowering {
            op: op.name().into(),
            target: "host".into(),
            reason: "transfers need a device".into(),
        }),
        _ => visit_float!(output.dtype(), T => {
            let views = inputs
                .iter()
                .map(|a| a.view::<T>())
                .collect::<Result<Vec<_>>>()?;
            Ok(Argument::from_array(run::<T>(op, output, &views)?))
        }, _ => Err(Error::UnsupportedType(format!(
            "{} has no {} kernel",
            op.name(),
            output.dtype()
        )))),
    }
}

pub(crate) fn contiguous<T: NumType>(x: &ArrayViewD<T>) -> ArrayD<T> {
    x.as_standard_layout().into_owned()
}

/// Numeric kernels over float views. The result is in standard layout with
/// `output`'s lens.
pub(crate) fn run<T: FloatType>(
    op: &Operator,
    output: &Shape,
    inputs: &[ArrayViewD<T>],
) -> Result<ArrayD<T>> {
    match op {
        Operator::Exp => Ok(inputs[0].mapv(|x| x.exp())),
        Operator::Sin => Ok(inputs[0].mapv(|x| x.sin())),
        Operator::Cos => Ok(inputs[0].mapv(|x| x.cos())),
        Operator::Tan => Ok(inputs[0].mapv(|x| x.tan())),
        Operator::Add => Ok(&inputs[0] + &inputs[1]),
        Operator::Mul => Ok(inputs[1..]
            .iter()
            .fold(inputs[0].to_owned(), |acc, x| acc * x)),
        Operator::Contiguous => Ok(contiguous(&inputs[0])),
        Operator::Gemm { alpha } => gemm(&inputs[0], &inputs[1], *alpha),
        Operator::Softmax { axis } => Ok(softmax(&inputs[0], *axis)),
        Operator::Convolution(conv) => convolution(conv, output, &inputs[0], &inputs[1]),
        op => Err(Error::UnsupportedType(format!(
            "{} is not a numeric kernel",
            op.name()
        ))),
    }
}

fn widen<T: FloatType>(x: T) -> f64 {
    x.to_f64().unwrap_or(f64::NAN)
}

fn narrow<T: FloatType>(x: f64) -> T {
    <T as NumCast>::from(x).unwrap_or_else(T::nan)
}

fn gemm<T: FloatType>(a: &ArrayViewD<T>, b: &ArrayViewD<T>, alpha: f32) -> Result<ArrayD<T>> {
    let a = a
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::shape("gemm", e.to_string()))?;
    let b = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::shape("gemm", e.to_string()))?;
    let (m, k) = a.dim();
    let n = b.dim().1;
    let alpha = alpha as f64;
    Ok(Array2::from_shape_fn((m, n), |(i, j)| {
        let acc: f64 = (0..k).map(|l| widen(a[[i, l]]) * widen(b[[l, j]])).sum();
        narrow(acc * alpha)
    })
    .into_dyn())
}

fn softmax<T: FloatType>(x: &ArrayViewD<T>, axis: usize) -> ArrayD<T> {
    let mut out = contiguous(x);
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane
            .iter()
            .fold(f64::NEG_INFINITY, |m, &v| m.max(widen(v)));
        let sum: f64 = lane.iter().map(|&v| (widen(v) - max).exp()).sum();
        lane.mapv_inplace(|v| narrow((widen(v) - max).exp() / sum));
    }
    out
}

fn convolution<T: FloatType>(
    conv: &Convolution,
    output: &Shape,
    x: &ArrayViewD<T>,
    w: &ArrayViewD<T>,
) -> Result<ArrayD<T>> {
    let x = x
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::shape("convolution", e.to_string()))?;
    let w = w
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::shape("convolution", e.to_string()))?;
    let (_, channels, height, width) = x.dim();
    let (_, _, kh, kw) = w.dim();
    let [ph, pw] = conv.padding;
    let [sh, sw] = conv.stride;
    let [dh, dw] = conv.dilation;
    let out = output.lens();
    Ok(
        Array4::from_shape_fn((out[0], out[1], out[2], out[3]), |(n, o, y, xo)| {
            let mut acc = 0f64;
            for c in 0..channels {
                for ky in 0..kh {
                    let iy = (y * sh + ky * dh) as isize - ph as isize;
                    if iy < 0 || iy >= height as isize {
                        continue;
                    }
                    for kx in 0..kw {
                        let ix = (xo * sw + kx * dw) as isize - pw as isize;
                        if ix < 0 || ix >= width as isize {
                            continue;
                        }
                        acc += widen(x[[n, c, iy as usize, ix as usize]]) * widen(w[[o, c, ky, kx]]);
                    }
                }
            }
            narrow(acc)
        })
        .into_dyn(),
    )
}
