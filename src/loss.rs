use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::{ExprGraph, Ix, UnaryOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    Sum,
    #[default]
    Mean,
}

fn reduce(g: &mut ExprGraph, x: Ix, reduction: Reduction) -> Result<Ix, GraphError> {
    match reduction {
        Reduction::Sum => g.sum(x),
        Reduction::Mean => g.mean(x),
    }
}

/// `reduce((a - b)^2)`
pub fn mse_loss(g: &mut ExprGraph, a: Ix, b: Ix, reduction: Reduction) -> Result<Ix, GraphError> {
    let diff = g.sub(a, b)?;
    let sq = g.unary(UnaryOp::Square, diff)?;
    reduce(g, sq, reduction)
}

/// `reduce(-log(a) * b)`, with `a` the predicted probabilities and `b` the
/// targets.
pub fn cross_entropy_loss(
    g: &mut ExprGraph,
    a: Ix,
    b: Ix,
    reduction: Reduction,
) -> Result<Ix, GraphError> {
    let log = g.unary(UnaryOp::Log, a)?;
    let neg = g.unary(UnaryOp::Neg, log)?;
    let prod = g.hadamard_prod(neg, b)?;
    reduce(g, prod, reduction)
}
