//! Forward evaluation of an [`ExprGraph`].

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::GraphError;
use crate::graph::{Expr, ExprGraph, Ix, T};
use crate::kernels;

/// Evaluates every node of a graph in topological order and stores the
/// results as node values.
///
/// The machine starts in training mode, where dropout nodes mask their
/// input; in eval mode they pass it through untouched.
#[derive(Debug)]
pub struct TapeMachine {
    order: Vec<Ix>,
    compiled_for: usize,
    training: bool,
    rng: StdRng,
}

impl TapeMachine {
    pub fn new(g: &ExprGraph) -> Result<Self, GraphError> {
        Self::build(g, StdRng::from_entropy())
    }

    pub fn with_seed(g: &ExprGraph, seed: u64) -> Result<Self, GraphError> {
        Self::build(g, StdRng::seed_from_u64(seed))
    }

    fn build(g: &ExprGraph, rng: StdRng) -> Result<Self, GraphError> {
        let mut machine = Self {
            order: vec![],
            compiled_for: 0,
            training: true,
            rng,
        };
        machine.compile(g)?;
        Ok(machine)
    }

    fn compile(&mut self, g: &ExprGraph) -> Result<(), GraphError> {
        self.order = g.topo_order()?;
        self.compiled_for = g.node_count();
        tracing::debug!(nodes = self.compiled_for, "compiled tape");
        Ok(())
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Runs the whole graph. Nodes appended since the last run are picked up
    /// by recompiling first.
    pub fn run_all(&mut self, g: &mut ExprGraph) -> Result<(), GraphError> {
        #[cfg(feature = "puffin")]
        puffin::profile_function!();

        if g.node_count() != self.compiled_for {
            self.compile(g)?;
        }
        for i in 0..self.order.len() {
            let ix = self.order[i];
            if let Some(value) = self.eval_node(g, ix)? {
                g.set_value(ix, value)?;
            }
        }
        Ok(())
    }

    /// `None` for leaves, which keep their bound value.
    fn eval_node(&mut self, g: &ExprGraph, ix: Ix) -> Result<Option<T>, GraphError> {
        let node = g.node(ix)?;
        let shape = node.shape();
        let value = match node.expr() {
            Expr::Input | Expr::Param => {
                g.value_of(ix)?;
                return Ok(None);
            }
            Expr::Transpose { x } => kernels::transpose(g.value_of(*x)?),
            Expr::MatMul { left, right } => {
                kernels::matmul(g.value_of(*left)?, g.value_of(*right)?)?
            }
            Expr::BatchedMatMul { left, right } => {
                kernels::batched_matmul(g.value_of(*left)?, g.value_of(*right)?)?
            }
            Expr::Add { left, right } | Expr::BroadcastAdd { left, right } => {
                zip(g, "add", *left, *right, shape, |a, b| a + b)?
            }
            Expr::Sub { left, right } => zip(g, "sub", *left, *right, shape, |a, b| a - b)?,
            Expr::HadamardProd { left, right } | Expr::BroadcastHadamardProd { left, right } => {
                zip(g, "hadamard_prod", *left, *right, shape, |a, b| a * b)?
            }
            Expr::Unary { op, x } => {
                let op = *op;
                g.value_of(*x)?.mapv(|v| op.apply(v))
            }
            Expr::Softmax { x, axis } => kernels::softmax(g.value_of(*x)?, *axis),
            Expr::Conv2d {
                input,
                kernel,
                params,
            } => kernels::conv2d(g.value_of(*input)?, g.value_of(*kernel)?, params)?,
            Expr::MaxPool2d { input, params } => kernels::max_pool2d(g.value_of(*input)?, params)?,
            Expr::Reshape { x } => kernels::reshape(g.value_of(*x)?, shape)?,
            Expr::Slice {
                x,
                axis,
                start,
                end,
            } => kernels::slice(g.value_of(*x)?, *axis, *start, *end),
            Expr::Concat { axis, parts } => {
                let values = parts
                    .iter()
                    .map(|p| g.value_of(*p))
                    .collect::<Result<Vec<_>, _>>()?;
                kernels::concat(*axis, &values)?
            }
            Expr::Gather { table, indices } => {
                kernels::gather(g.value_of(*table)?, g.value_of(*indices)?)?
            }
            Expr::Dropout { x, probability } => {
                let x = g.value_of(*x)?;
                if self.training {
                    kernels::dropout(x, *probability, &mut self.rng)
                } else {
                    x.clone()
                }
            }
            Expr::Sum { x } => kernels::sum(g.value_of(*x)?),
            Expr::Mean { x } => kernels::mean(g.value_of(*x)?),
        };
        Ok(Some(value))
    }
}

fn zip<F>(
    g: &ExprGraph,
    op: &'static str,
    left: Ix,
    right: Ix,
    shape: &[usize],
    f: F,
) -> Result<T, GraphError>
where
    F: Fn(f64, f64) -> f64,
{
    kernels::zip_with(op, g.value_of(left)?, g.value_of(right)?, shape, f)
}
