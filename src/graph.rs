//! Symbolic expression graph.
//!
//! Every builder method appends a node to the graph, infers its shape and
//! dtype from the parents and returns its handle. Shape problems surface here,
//! at construction time; numbers are only produced later by the
//! [`TapeMachine`](crate::tape::TapeMachine).

use ndarray::{ArrayD, IxDyn};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::init::Init;
use crate::kernels::{self, Conv2dParams, Pool2dParams};

pub type T = ArrayD<f64>;
pub type Ix = NodeIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    Float64,
    /// Integer valued tensor. Values are stored as `f64` but must be integral.
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Sign,
    Ceil,
    Floor,
    Sin,
    Cos,
    Exp,
    Log,
    Log2,
    Neg,
    Square,
    Sqrt,
    Inverse,
    InverseSqrt,
    Cube,
    Tanh,
    Sigmoid,
    Log1p,
    Expm1,
    Softplus,
    Rectify,
}

impl UnaryOp {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Ceil => x.ceil(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Log2 => x.log2(),
            UnaryOp::Neg => -x,
            UnaryOp::Square => x * x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Inverse => 1.0 / x,
            UnaryOp::InverseSqrt => 1.0 / x.sqrt(),
            UnaryOp::Cube => x * x * x,
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Log1p => x.ln_1p(),
            UnaryOp::Expm1 => x.exp_m1(),
            // ln(1 + e^x) without overflowing for large x
            UnaryOp::Softplus => {
                if x > 30.0 {
                    x
                } else {
                    x.exp().ln_1p()
                }
            }
            UnaryOp::Rectify => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    /// Placeholder bound from outside with [`ExprGraph::let_value`].
    Input,
    /// Value-bearing node allocated with an initial value (weights, biases, states).
    Param,
    Transpose { x: Ix },
    MatMul { left: Ix, right: Ix },
    BatchedMatMul { left: Ix, right: Ix },
    Add { left: Ix, right: Ix },
    Sub { left: Ix, right: Ix },
    HadamardProd { left: Ix, right: Ix },
    BroadcastAdd { left: Ix, right: Ix },
    BroadcastHadamardProd { left: Ix, right: Ix },
    Unary { op: UnaryOp, x: Ix },
    Softmax { x: Ix, axis: usize },
    Conv2d { input: Ix, kernel: Ix, params: Conv2dParams },
    MaxPool2d { input: Ix, params: Pool2dParams },
    Reshape { x: Ix },
    Slice { x: Ix, axis: usize, start: usize, end: usize },
    Concat { axis: usize, parts: Vec<Ix> },
    Gather { table: Ix, indices: Ix },
    Dropout { x: Ix, probability: f64 },
    Sum { x: Ix },
    Mean { x: Ix },
}

#[derive(Debug, Clone)]
pub struct Node {
    expr: Expr,
    name: String,
    shape: Vec<usize>,
    dtype: Dtype,
    value: Option<T>,
}

impl Node {
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

#[derive(Debug)]
pub struct ExprGraph {
    graph: DiGraph<Node, ()>,
    rng: StdRng,
}

impl Default for ExprGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Graph whose parameter initializers draw from a seeded generator.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            graph: DiGraph::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn push(
        &mut self,
        expr: Expr,
        shape: Vec<usize>,
        dtype: Dtype,
        parents: &[Ix],
        value: Option<T>,
    ) -> Ix {
        let name = format!("{}{}", op_label(&expr), self.graph.node_count());
        let new = self.graph.add_node(Node {
            expr,
            name,
            shape,
            dtype,
            value,
        });
        for parent in parents {
            self.graph.add_edge(*parent, new, ());
        }
        new
    }

    pub fn node(&self, ix: Ix) -> Result<&Node, GraphError> {
        self.graph.node_weight(ix).ok_or(GraphError::UnknownNode(ix))
    }

    fn node_mut(&mut self, ix: Ix) -> Result<&mut Node, GraphError> {
        self.graph
            .node_weight_mut(ix)
            .ok_or(GraphError::UnknownNode(ix))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn shape(&self, ix: Ix) -> Result<&[usize], GraphError> {
        Ok(self.node(ix)?.shape())
    }

    pub fn dtype(&self, ix: Ix) -> Result<Dtype, GraphError> {
        Ok(self.node(ix)?.dtype)
    }

    pub fn name(&self, ix: Ix) -> Result<&str, GraphError> {
        Ok(self.node(ix)?.name())
    }

    pub fn set_name(&mut self, ix: Ix, name: impl Into<String>) -> Result<(), GraphError> {
        self.node_mut(ix)?.name = name.into();
        Ok(())
    }

    pub fn is_param(&self, ix: Ix) -> bool {
        matches!(
            self.graph.node_weight(ix).map(Node::expr),
            Some(Expr::Param)
        )
    }

    /// Current value of a node: the initial value for parameters, the bound
    /// value for inputs, the last tape result for everything else.
    pub fn value(&self, ix: Ix) -> Option<&T> {
        self.graph.node_weight(ix).and_then(Node::value)
    }

    pub fn value_of(&self, ix: Ix) -> Result<&T, GraphError> {
        let node = self.node(ix)?;
        node.value()
            .ok_or_else(|| GraphError::Unbound(node.name.clone()))
    }

    /// Binds a value to an input (or overwrites the value of a parameter).
    pub fn let_value(&mut self, ix: Ix, value: T) -> Result<(), GraphError> {
        let node = self.node_mut(ix)?;
        if value.shape() != node.shape.as_slice() {
            return Err(GraphError::InvalidValue {
                name: node.name.clone(),
                reason: format!(
                    "expected shape {:?}, got {:?}",
                    node.shape,
                    value.shape()
                ),
            });
        }
        if node.dtype == Dtype::Int && value.iter().any(|v| v.fract() != 0.0) {
            return Err(GraphError::InvalidValue {
                name: node.name.clone(),
                reason: "integer node received a non-integral value".to_string(),
            });
        }
        node.value = Some(value);
        Ok(())
    }

    pub(crate) fn set_value(&mut self, ix: Ix, value: T) -> Result<(), GraphError> {
        self.node_mut(ix)?.value = Some(value);
        Ok(())
    }

    pub(crate) fn topo_order(&self) -> Result<Vec<Ix>, GraphError> {
        toposort(&self.graph, None).map_err(|cycle| GraphError::Cycle(cycle.node_id()))
    }

    pub fn new_input(&mut self, name: &str, shape: &[usize], dtype: Dtype) -> Ix {
        let ix = self.push(Expr::Input, shape.to_vec(), dtype, &[], None);
        self.graph[ix].name = name.to_string();
        ix
    }

    pub fn new_param(&mut self, name: &str, shape: &[usize], init: Init) -> Ix {
        let value = init.fill(shape, &mut self.rng);
        self.new_param_from(name, value)
    }

    /// Parameter seeded with a copy of `value`.
    pub fn new_param_from(&mut self, name: &str, value: T) -> Ix {
        let shape = value.shape().to_vec();
        let ix = self.push(Expr::Param, shape, Dtype::Float64, &[], Some(value));
        self.graph[ix].name = name.to_string();
        ix
    }

    fn float_operand(&self, op: &'static str, ix: Ix) -> Result<Vec<usize>, GraphError> {
        let node = self.node(ix)?;
        if node.dtype != Dtype::Float64 {
            return Err(GraphError::Dtype {
                op,
                expected: Dtype::Float64,
                got: node.dtype,
            });
        }
        Ok(node.shape.clone())
    }

    pub fn transpose(&mut self, x: Ix) -> Result<Ix, GraphError> {
        let shape = self.float_operand("transpose", x)?;
        if shape.len() != 2 {
            return Err(GraphError::Rank {
                op: "transpose",
                expected: "2",
                got: shape,
            });
        }
        let out = vec![shape[1], shape[0]];
        Ok(self.push(Expr::Transpose { x }, out, Dtype::Float64, &[x], None))
    }

    /// Matrix product. Vector operands are treated as a single row (left)
    /// or a single column (right).
    pub fn mul(&mut self, left: Ix, right: Ix) -> Result<Ix, GraphError> {
        let a = self.float_operand("mul", left)?;
        let b = self.float_operand("mul", right)?;
        let out = kernels::matmul_shape(&a, &b)?;
        Ok(self.push(
            Expr::MatMul { left, right },
            out,
            Dtype::Float64,
            &[left, right],
            None,
        ))
    }

    /// Matrix product over the leading batch axis of `left`. `right` is either
    /// shared by every sample (rank 2) or batched itself (rank 3).
    pub fn batched_mul(&mut self, left: Ix, right: Ix) -> Result<Ix, GraphError> {
        let a = self.float_operand("batched_mul", left)?;
        let b = self.float_operand("batched_mul", right)?;
        let out = kernels::batched_matmul_shape(&a, &b)?;
        Ok(self.push(
            Expr::BatchedMatMul { left, right },
            out,
            Dtype::Float64,
            &[left, right],
            None,
        ))
    }

    fn elementwise(
        &mut self,
        op: &'static str,
        left: Ix,
        right: Ix,
        expr: Expr,
    ) -> Result<Ix, GraphError> {
        let a = self.float_operand(op, left)?;
        let b = self.float_operand(op, right)?;
        let out = kernels::elementwise_shape(op, &a, &b)?;
        Ok(self.push(expr, out, Dtype::Float64, &[left, right], None))
    }

    fn batch_broadcast(
        &mut self,
        op: &'static str,
        left: Ix,
        right: Ix,
        expr: Expr,
    ) -> Result<Ix, GraphError> {
        let a = self.float_operand(op, left)?;
        let b = self.float_operand(op, right)?;
        let out = kernels::batch_broadcast_shape(op, &a, &b)?;
        Ok(self.push(expr, out, Dtype::Float64, &[left, right], None))
    }

    pub fn add(&mut self, left: Ix, right: Ix) -> Result<Ix, GraphError> {
        self.elementwise("add", left, right, Expr::Add { left, right })
    }

    pub fn sub(&mut self, left: Ix, right: Ix) -> Result<Ix, GraphError> {
        self.elementwise("sub", left, right, Expr::Sub { left, right })
    }

    pub fn hadamard_prod(&mut self, left: Ix, right: Ix) -> Result<Ix, GraphError> {
        self.elementwise(
            "hadamard_prod",
            left,
            right,
            Expr::HadamardProd { left, right },
        )
    }

    /// Addition replicating the operand without a batch axis (or with a batch
    /// axis of size one) along axis 0.
    pub fn broadcast_add(&mut self, left: Ix, right: Ix) -> Result<Ix, GraphError> {
        self.batch_broadcast(
            "broadcast_add",
            left,
            right,
            Expr::BroadcastAdd { left, right },
        )
    }

    pub fn broadcast_hadamard_prod(&mut self, left: Ix, right: Ix) -> Result<Ix, GraphError> {
        self.batch_broadcast(
            "broadcast_hadamard_prod",
            left,
            right,
            Expr::BroadcastHadamardProd { left, right },
        )
    }

    pub fn unary(&mut self, op: UnaryOp, x: Ix) -> Result<Ix, GraphError> {
        let shape = self.float_operand("unary", x)?;
        Ok(self.push(Expr::Unary { op, x }, shape, Dtype::Float64, &[x], None))
    }

    pub fn sigmoid(&mut self, x: Ix) -> Result<Ix, GraphError> {
        self.unary(UnaryOp::Sigmoid, x)
    }

    pub fn tanh(&mut self, x: Ix) -> Result<Ix, GraphError> {
        self.unary(UnaryOp::Tanh, x)
    }

    pub fn softmax(&mut self, x: Ix, axis: usize) -> Result<Ix, GraphError> {
        let shape = self.float_operand("softmax", x)?;
        if axis >= shape.len() {
            return Err(GraphError::Axis { axis, shape });
        }
        Ok(self.push(Expr::Softmax { x, axis }, shape, Dtype::Float64, &[x], None))
    }

    pub fn conv2d(
        &mut self,
        input: Ix,
        kernel: Ix,
        params: Conv2dParams,
    ) -> Result<Ix, GraphError> {
        let x = self.float_operand("conv2d", input)?;
        let k = self.float_operand("conv2d", kernel)?;
        let out = kernels::conv2d_shape(&x, &k, &params)?;
        Ok(self.push(
            Expr::Conv2d {
                input,
                kernel,
                params,
            },
            out,
            Dtype::Float64,
            &[input, kernel],
            None,
        ))
    }

    pub fn max_pool2d(&mut self, input: Ix, params: Pool2dParams) -> Result<Ix, GraphError> {
        let x = self.float_operand("max_pool2d", input)?;
        let out = kernels::pool2d_shape(&x, &params)?;
        Ok(self.push(
            Expr::MaxPool2d { input, params },
            out,
            Dtype::Float64,
            &[input],
            None,
        ))
    }

    pub fn reshape(&mut self, x: Ix, shape: &[usize]) -> Result<Ix, GraphError> {
        let node = self.node(x)?;
        let (from, dtype) = (node.shape.clone(), node.dtype);
        if from.iter().product::<usize>() != shape.iter().product::<usize>() {
            return Err(GraphError::Reshape {
                from,
                to: shape.to_vec(),
            });
        }
        Ok(self.push(Expr::Reshape { x }, shape.to_vec(), dtype, &[x], None))
    }

    /// Keeps `[start, end)` of `axis`; the rank is preserved.
    pub fn slice(
        &mut self,
        x: Ix,
        axis: usize,
        start: usize,
        end: usize,
    ) -> Result<Ix, GraphError> {
        let node = self.node(x)?;
        let (mut shape, dtype) = (node.shape.clone(), node.dtype);
        if axis >= shape.len() {
            return Err(GraphError::Axis { axis, shape });
        }
        if start >= end || end > shape[axis] {
            return Err(GraphError::SliceRange {
                axis,
                start,
                end,
                shape,
            });
        }
        shape[axis] = end - start;
        Ok(self.push(
            Expr::Slice {
                x,
                axis,
                start,
                end,
            },
            shape,
            dtype,
            &[x],
            None,
        ))
    }

    pub fn concat(&mut self, axis: usize, parts: &[Ix]) -> Result<Ix, GraphError> {
        let first = *parts.first().ok_or(GraphError::EmptyConcat)?;
        let mut shape = self.float_operand("concat", first)?;
        if axis >= shape.len() {
            return Err(GraphError::Axis { axis, shape });
        }
        for part in &parts[1..] {
            let other = self.float_operand("concat", *part)?;
            let compatible = other.len() == shape.len()
                && other
                    .iter()
                    .zip(&shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(GraphError::ShapeMismatch {
                    op: "concat",
                    left: shape,
                    right: other,
                });
            }
            shape[axis] += other[axis];
        }
        Ok(self.push(
            Expr::Concat {
                axis,
                parts: parts.to_vec(),
            },
            shape,
            Dtype::Float64,
            parts,
            None,
        ))
    }

    /// Selects rows of a rank-2 `table` by the integer entries of a rank-1
    /// `indices` node.
    pub fn gather(&mut self, table: Ix, indices: Ix) -> Result<Ix, GraphError> {
        let t = self.float_operand("gather", table)?;
        if t.len() != 2 {
            return Err(GraphError::Rank {
                op: "gather",
                expected: "2",
                got: t,
            });
        }
        let idx = self.node(indices)?;
        if idx.dtype != Dtype::Int {
            return Err(GraphError::Dtype {
                op: "gather",
                expected: Dtype::Int,
                got: idx.dtype,
            });
        }
        if idx.shape.len() != 1 {
            return Err(GraphError::Rank {
                op: "gather",
                expected: "1",
                got: idx.shape.clone(),
            });
        }
        let out = vec![idx.shape[0], t[1]];
        Ok(self.push(
            Expr::Gather { table, indices },
            out,
            Dtype::Float64,
            &[table, indices],
            None,
        ))
    }

    pub fn dropout(&mut self, x: Ix, probability: f64) -> Result<Ix, GraphError> {
        let shape = self.float_operand("dropout", x)?;
        if !(0.0..=1.0).contains(&probability) {
            return Err(GraphError::InvalidParams {
                op: "dropout",
                reason: format!("probability {} is outside [0;1]", probability),
            });
        }
        Ok(self.push(
            Expr::Dropout { x, probability },
            shape,
            Dtype::Float64,
            &[x],
            None,
        ))
    }

    pub fn sum(&mut self, x: Ix) -> Result<Ix, GraphError> {
        self.float_operand("sum", x)?;
        Ok(self.push(Expr::Sum { x }, vec![], Dtype::Float64, &[x], None))
    }

    pub fn mean(&mut self, x: Ix) -> Result<Ix, GraphError> {
        self.float_operand("mean", x)?;
        Ok(self.push(Expr::Mean { x }, vec![], Dtype::Float64, &[x], None))
    }
}

fn op_label(expr: &Expr) -> &'static str {
    match expr {
        Expr::Input => "input",
        Expr::Param => "param",
        Expr::Transpose { .. } => "transpose",
        Expr::MatMul { .. } => "mul",
        Expr::BatchedMatMul { .. } => "batched_mul",
        Expr::Add { .. } => "add",
        Expr::Sub { .. } => "sub",
        Expr::HadamardProd { .. } => "hadamard_prod",
        Expr::BroadcastAdd { .. } => "broadcast_add",
        Expr::BroadcastHadamardProd { .. } => "broadcast_hadamard_prod",
        Expr::Unary { .. } => "unary",
        Expr::Softmax { .. } => "softmax",
        Expr::Conv2d { .. } => "conv2d",
        Expr::MaxPool2d { .. } => "max_pool2d",
        Expr::Reshape { .. } => "reshape",
        Expr::Slice { .. } => "slice",
        Expr::Concat { .. } => "concat",
        Expr::Gather { .. } => "gather",
        Expr::Dropout { .. } => "dropout",
        Expr::Sum { .. } => "sum",
        Expr::Mean { .. } => "mean",
    }
}

/// Builds a tensor of the given shape from row-major data.
pub fn tensor(shape: &[usize], data: Vec<f64>) -> Result<T, GraphError> {
    let len = data.len();
    T::from_shape_vec(IxDyn(shape), data).map_err(|_| GraphError::Reshape {
        from: vec![len],
        to: shape.to_vec(),
    })
}
