//! Shape rules and numeric kernels behind the graph operators.

use ndarray::{
    arr0, Array3, Array4, ArrayView2, ArrayView3, ArrayViewD, Axis, Ix2, Ix3, Ix4, IxDyn, Slice,
    Zip,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::T;

/// Convolution window description. Pairs are `[height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub kernel: [usize; 2],
    #[serde(default)]
    pub padding: [usize; 2],
    #[serde(default = "unit_pair")]
    pub stride: [usize; 2],
    #[serde(default = "unit_pair")]
    pub dilation: [usize; 2],
}

/// Pooling window description. Pairs are `[height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2dParams {
    pub kernel: [usize; 2],
    #[serde(default)]
    pub padding: [usize; 2],
    #[serde(default = "unit_pair")]
    pub stride: [usize; 2],
}

fn unit_pair() -> [usize; 2] {
    [1, 1]
}

impl Conv2dParams {
    pub fn new(kernel: [usize; 2]) -> Self {
        Self {
            kernel,
            padding: [0, 0],
            stride: [1, 1],
            dilation: [1, 1],
        }
    }

    pub fn padding(mut self, padding: [usize; 2]) -> Self {
        self.padding = padding;
        self
    }

    pub fn stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn dilation(mut self, dilation: [usize; 2]) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.kernel.contains(&0) {
            return Err(format!("kernel {:?} has a zero extent", self.kernel));
        }
        if self.stride.contains(&0) {
            return Err(format!("stride {:?} has a zero step", self.stride));
        }
        if self.dilation.contains(&0) {
            return Err(format!("dilation {:?} has a zero factor", self.dilation));
        }
        Ok(())
    }
}

impl Pool2dParams {
    pub fn new(kernel: [usize; 2]) -> Self {
        Self {
            kernel,
            padding: [0, 0],
            stride: kernel,
        }
    }

    pub fn padding(mut self, padding: [usize; 2]) -> Self {
        self.padding = padding;
        self
    }

    pub fn stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.kernel.contains(&0) {
            return Err(format!("kernel {:?} has a zero extent", self.kernel));
        }
        if self.stride.contains(&0) {
            return Err(format!("stride {:?} has a zero step", self.stride));
        }
        // windows lying entirely in padding would have no maximum
        if self.padding[0] >= self.kernel[0] || self.padding[1] >= self.kernel[1] {
            return Err(format!(
                "padding {:?} must be smaller than kernel {:?}",
                self.padding, self.kernel
            ));
        }
        Ok(())
    }
}

fn mismatch(op: &'static str, a: &[usize], b: &[usize]) -> GraphError {
    GraphError::ShapeMismatch {
        op,
        left: a.to_vec(),
        right: b.to_vec(),
    }
}

pub fn matmul_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, GraphError> {
    match (a, b) {
        ([m, k], [k2, n]) if k == k2 => Ok(vec![*m, *n]),
        ([k], [k2, n]) if k == k2 => Ok(vec![*n]),
        ([m, k], [k2]) if k == k2 => Ok(vec![*m]),
        ([_] | [_, _], [_] | [_, _]) => Err(mismatch("mul", a, b)),
        _ => Err(GraphError::Rank {
            op: "mul",
            expected: "1 or 2",
            got: if a.len() > 2 { a.to_vec() } else { b.to_vec() },
        }),
    }
}

pub fn batched_matmul_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, GraphError> {
    match (a, b) {
        ([n, k], [k2, o]) if k == k2 => Ok(vec![*n, *o]),
        ([n, m, k], [k2, o]) if k == k2 => Ok(vec![*n, *m, *o]),
        ([n, m, k], [n2, k2, o]) if n == n2 && k == k2 => Ok(vec![*n, *m, *o]),
        ([_, _] | [_, _, _], [_, _] | [_, _, _]) => Err(mismatch("batched_mul", a, b)),
        _ => Err(GraphError::Rank {
            op: "batched_mul",
            expected: "2 or 3",
            got: if a.len() < 2 || a.len() > 3 {
                a.to_vec()
            } else {
                b.to_vec()
            },
        }),
    }
}

/// Equal shapes, or one operand holding a single element.
pub fn elementwise_shape(
    op: &'static str,
    a: &[usize],
    b: &[usize],
) -> Result<Vec<usize>, GraphError> {
    if a == b {
        return Ok(a.to_vec());
    }
    let size = |s: &[usize]| s.iter().product::<usize>();
    if size(b) == 1 && b.len() <= a.len() {
        return Ok(a.to_vec());
    }
    if size(a) == 1 && a.len() <= b.len() {
        return Ok(b.to_vec());
    }
    Err(mismatch(op, a, b))
}

/// Broadcasting along axis 0 only: one side lacks the batch axis or has a
/// batch axis of size one, everything else must match.
pub fn batch_broadcast_shape(
    op: &'static str,
    a: &[usize],
    b: &[usize],
) -> Result<Vec<usize>, GraphError> {
    if a == b {
        return Ok(a.to_vec());
    }
    if !a.is_empty() && b == &a[1..] {
        return Ok(a.to_vec());
    }
    if !b.is_empty() && a == &b[1..] {
        return Ok(b.to_vec());
    }
    if a.len() == b.len() && !a.is_empty() && a[1..] == b[1..] {
        if b[0] == 1 {
            return Ok(a.to_vec());
        }
        if a[0] == 1 {
            return Ok(b.to_vec());
        }
    }
    Err(mismatch(op, a, b))
}

fn extent(size: usize, padding: usize) -> usize {
    size + 2 * padding
}

pub fn conv2d_shape(
    x: &[usize],
    k: &[usize],
    params: &Conv2dParams,
) -> Result<Vec<usize>, GraphError> {
    params.validate().map_err(|reason| GraphError::InvalidParams {
        op: "conv2d",
        reason,
    })?;
    let ([n, c, h, w], [f, kc, kh, kw]) = (x, k) else {
        return Err(GraphError::Rank {
            op: "conv2d",
            expected: "4",
            got: if x.len() != 4 { x.to_vec() } else { k.to_vec() },
        });
    };
    if c != kc || [*kh, *kw] != params.kernel {
        return Err(mismatch("conv2d", x, k));
    }
    let span_h = params.dilation[0] * (kh - 1) + 1;
    let span_w = params.dilation[1] * (kw - 1) + 1;
    let (ph, pw) = (extent(*h, params.padding[0]), extent(*w, params.padding[1]));
    if span_h > ph || span_w > pw {
        return Err(GraphError::InvalidParams {
            op: "conv2d",
            reason: format!(
                "kernel span {}x{} exceeds padded input {}x{}",
                span_h, span_w, ph, pw
            ),
        });
    }
    let out_h = (ph - span_h) / params.stride[0] + 1;
    let out_w = (pw - span_w) / params.stride[1] + 1;
    Ok(vec![*n, *f, out_h, out_w])
}

pub fn pool2d_shape(x: &[usize], params: &Pool2dParams) -> Result<Vec<usize>, GraphError> {
    params.validate().map_err(|reason| GraphError::InvalidParams {
        op: "max_pool2d",
        reason,
    })?;
    let [n, c, h, w] = x else {
        return Err(GraphError::Rank {
            op: "max_pool2d",
            expected: "4",
            got: x.to_vec(),
        });
    };
    let (ph, pw) = (extent(*h, params.padding[0]), extent(*w, params.padding[1]));
    let [kh, kw] = params.kernel;
    if kh > ph || kw > pw {
        return Err(GraphError::InvalidParams {
            op: "max_pool2d",
            reason: format!("kernel {}x{} exceeds padded input {}x{}", kh, kw, ph, pw),
        });
    }
    Ok(vec![
        *n,
        *c,
        (ph - kh) / params.stride[0] + 1,
        (pw - kw) / params.stride[1] + 1,
    ])
}

fn view2(x: &T) -> Result<ArrayView2<'_, f64>, GraphError> {
    x.view().into_dimensionality::<Ix2>().map_err(|_| GraphError::Rank {
        op: "mul",
        expected: "2",
        got: x.shape().to_vec(),
    })
}

fn view3(x: &T) -> Result<ArrayView3<'_, f64>, GraphError> {
    x.view().into_dimensionality::<Ix3>().map_err(|_| GraphError::Rank {
        op: "batched_mul",
        expected: "3",
        got: x.shape().to_vec(),
    })
}

/// Treats a rank-1 operand as a row (left) or column (right) and restores the
/// rank of the result afterwards.
pub fn matmul(a: &T, b: &T) -> Result<T, GraphError> {
    let shape = matmul_shape(a.shape(), b.shape())?;
    let left = match a.ndim() {
        1 => a.view().into_shape((1, a.len())).map_err(|_| mismatch("mul", a.shape(), b.shape()))?,
        _ => view2(a)?,
    };
    let right = match b.ndim() {
        1 => b.view().into_shape((b.len(), 1)).map_err(|_| mismatch("mul", a.shape(), b.shape()))?,
        _ => view2(b)?,
    };
    reshape(&left.dot(&right).into_dyn(), &shape)
}

pub fn batched_matmul(a: &T, b: &T) -> Result<T, GraphError> {
    batched_matmul_shape(a.shape(), b.shape())?;
    match (a.ndim(), b.ndim()) {
        (2, 2) => Ok(view2(a)?.dot(&view2(b)?).into_dyn()),
        (3, 2) => {
            let (a, b) = (view3(a)?, view2(b)?);
            let (n, m, _) = a.dim();
            let mut out = Array3::<f64>::zeros((n, m, b.ncols()));
            for (i, sample) in a.outer_iter().enumerate() {
                out.index_axis_mut(Axis(0), i).assign(&sample.dot(&b));
            }
            Ok(out.into_dyn())
        }
        _ => {
            let (a, b) = (view3(a)?, view3(b)?);
            let (n, m, _) = a.dim();
            let mut out = Array3::<f64>::zeros((n, m, b.dim().2));
            for i in 0..n {
                let product = a.index_axis(Axis(0), i).dot(&b.index_axis(Axis(0), i));
                out.index_axis_mut(Axis(0), i).assign(&product);
            }
            Ok(out.into_dyn())
        }
    }
}

pub fn transpose(x: &T) -> T {
    x.t().as_standard_layout().into_owned()
}

/// Row-major reinterpretation of `x` with a new shape of the same size.
pub fn reshape(x: &T, shape: &[usize]) -> Result<T, GraphError> {
    T::from_shape_vec(IxDyn(shape), x.iter().copied().collect()).map_err(|_| GraphError::Reshape {
        from: x.shape().to_vec(),
        to: shape.to_vec(),
    })
}

pub fn slice(x: &T, axis: usize, start: usize, end: usize) -> T {
    x.slice_axis(Axis(axis), Slice::from(start..end)).to_owned()
}

pub fn concat(axis: usize, parts: &[&T]) -> Result<T, GraphError> {
    let views: Vec<ArrayViewD<'_, f64>> = parts.iter().map(|p| p.view()).collect();
    ndarray::concatenate(Axis(axis), &views).map_err(|_| GraphError::ShapeMismatch {
        op: "concat",
        left: parts.first().map(|p| p.shape().to_vec()).unwrap_or_default(),
        right: parts.last().map(|p| p.shape().to_vec()).unwrap_or_default(),
    })
}

pub fn gather(table: &T, indices: &T) -> Result<T, GraphError> {
    let rows = table.shape()[0];
    let idx = indices
        .iter()
        .map(|v| {
            let index = *v as i64;
            if index < 0 || index as usize >= rows {
                Err(GraphError::IndexOutOfRange { index, rows })
            } else {
                Ok(index as usize)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(table.select(Axis(0), &idx))
}

pub fn softmax(x: &T, axis: usize) -> T {
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.fold(f64::NEG_INFINITY, |m, v| m.max(*v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

/// Inverted dropout: zeroes each element with `probability` and scales the
/// survivors so the expectation is unchanged.
pub fn dropout<R: Rng + ?Sized>(x: &T, probability: f64, rng: &mut R) -> T {
    if probability <= 0.0 {
        return x.clone();
    }
    if probability >= 1.0 {
        return T::zeros(x.raw_dim());
    }
    let keep = 1.0 - probability;
    x.mapv(|v| if rng.gen::<f64>() < probability { 0.0 } else { v / keep })
}

pub fn sum(x: &T) -> T {
    arr0(x.sum()).into_dyn()
}

pub fn mean(x: &T) -> T {
    arr0(x.mean().unwrap_or(f64::NAN)).into_dyn()
}

/// Applies `f` pairwise after broadcasting both operands to `shape`, which
/// must come from [`elementwise_shape`] or [`batch_broadcast_shape`].
pub fn zip_with<F>(op: &'static str, a: &T, b: &T, shape: &[usize], f: F) -> Result<T, GraphError>
where
    F: Fn(f64, f64) -> f64,
{
    let dim = IxDyn(shape);
    let left = a
        .broadcast(dim.clone())
        .ok_or_else(|| mismatch(op, a.shape(), shape))?;
    let right = b
        .broadcast(dim)
        .ok_or_else(|| mismatch(op, b.shape(), shape))?;
    let mut out = left.to_owned();
    Zip::from(&mut out).and(&right).for_each(|o, r| *o = f(*o, *r));
    Ok(out)
}

pub fn conv2d(x: &T, k: &T, params: &Conv2dParams) -> Result<T, GraphError> {
    let out_shape = conv2d_shape(x.shape(), k.shape(), params)?;
    let x = x.view().into_dimensionality::<Ix4>().map_err(|_| rank4("conv2d", x))?;
    let k = k.view().into_dimensionality::<Ix4>().map_err(|_| rank4("conv2d", k))?;
    let (n, c, h, w) = x.dim();
    let (f, _, kh, kw) = k.dim();
    let (oh, ow) = (out_shape[2], out_shape[3]);
    let [sh, sw] = params.stride;
    let [dh, dw] = params.dilation;
    let [ph, pw] = params.padding;

    let mut out = Array4::<f64>::zeros((n, f, oh, ow));
    for b in 0..n {
        for o in 0..f {
            for y in 0..oh {
                for x0 in 0..ow {
                    let mut acc = 0.0;
                    for ch in 0..c {
                        for i in 0..kh {
                            let row = (y * sh + i * dh) as isize - ph as isize;
                            if row < 0 || row as usize >= h {
                                continue;
                            }
                            for j in 0..kw {
                                let col = (x0 * sw + j * dw) as isize - pw as isize;
                                if col < 0 || col as usize >= w {
                                    continue;
                                }
                                acc += x[[b, ch, row as usize, col as usize]] * k[[o, ch, i, j]];
                            }
                        }
                    }
                    out[[b, o, y, x0]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

pub fn max_pool2d(x: &T, params: &Pool2dParams) -> Result<T, GraphError> {
    let out_shape = pool2d_shape(x.shape(), params)?;
    let x = x.view().into_dimensionality::<Ix4>().map_err(|_| rank4("max_pool2d", x))?;
    let (n, c, h, w) = x.dim();
    let (oh, ow) = (out_shape[2], out_shape[3]);
    let [kh, kw] = params.kernel;
    let [sh, sw] = params.stride;
    let [ph, pw] = params.padding;

    let mut out = Array4::<f64>::from_elem((n, c, oh, ow), f64::NEG_INFINITY);
    for b in 0..n {
        for ch in 0..c {
            for y in 0..oh {
                for x0 in 0..ow {
                    let mut best = f64::NEG_INFINITY;
                    for i in 0..kh {
                        let row = (y * sh + i) as isize - ph as isize;
                        if row < 0 || row as usize >= h {
                            continue;
                        }
                        for j in 0..kw {
                            let col = (x0 * sw + j) as isize - pw as isize;
                            if col < 0 || col as usize >= w {
                                continue;
                            }
                            best = best.max(x[[b, ch, row as usize, col as usize]]);
                        }
                    }
                    out[[b, ch, y, x0]] = best;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

fn rank4(op: &'static str, x: &T) -> GraphError {
    GraphError::Rank {
        op,
        expected: "4",
        got: x.shape().to_vec(),
    }
}
