//! Named activation functions applied after a layer's bias.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::{ExprGraph, Ix, UnaryOp};

/// Closed registry of pure node-to-node functions. Serialized by name, e.g.
/// `"sigmoid"`, `"softmax"` (last axis) or `"softmax:1"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    #[default]
    NoActivation,
    Unary(UnaryOp),
    /// Softmax over `axis`, or the last axis when `None`.
    Softmax { axis: Option<usize> },
}

impl Activation {
    pub const SIGMOID: Activation = Activation::Unary(UnaryOp::Sigmoid);
    pub const TANH: Activation = Activation::Unary(UnaryOp::Tanh);
    pub const RELU: Activation = Activation::Unary(UnaryOp::Rectify);

    pub fn apply(&self, g: &mut ExprGraph, x: Ix) -> Result<Ix, GraphError> {
        match *self {
            Activation::NoActivation => Ok(x),
            Activation::Unary(op) => g.unary(op, x),
            Activation::Softmax { axis } => {
                let axis = match axis {
                    Some(axis) => axis,
                    None => g.shape(x)?.len().saturating_sub(1),
                };
                g.softmax(x, axis)
            }
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Activation::NoActivation)
    }
}

const UNARY_NAMES: [(&str, UnaryOp); 21] = [
    ("abs", UnaryOp::Abs),
    ("sign", UnaryOp::Sign),
    ("ceil", UnaryOp::Ceil),
    ("floor", UnaryOp::Floor),
    ("sin", UnaryOp::Sin),
    ("cos", UnaryOp::Cos),
    ("exp", UnaryOp::Exp),
    ("log", UnaryOp::Log),
    ("log2", UnaryOp::Log2),
    ("neg", UnaryOp::Neg),
    ("square", UnaryOp::Square),
    ("sqrt", UnaryOp::Sqrt),
    ("inverse", UnaryOp::Inverse),
    ("inverse_sqrt", UnaryOp::InverseSqrt),
    ("cube", UnaryOp::Cube),
    ("tanh", UnaryOp::Tanh),
    ("sigmoid", UnaryOp::Sigmoid),
    ("log1p", UnaryOp::Log1p),
    ("expm1", UnaryOp::Expm1),
    ("softplus", UnaryOp::Softplus),
    ("rectify", UnaryOp::Rectify),
];

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::NoActivation => write!(f, "no_activation"),
            Activation::Unary(op) => {
                let name = UNARY_NAMES
                    .iter()
                    .find(|(_, o)| o == op)
                    .map_or("unknown", |(name, _)| *name);
                write!(f, "{}", name)
            }
            Activation::Softmax { axis: None } => write!(f, "softmax"),
            Activation::Softmax { axis: Some(axis) } => write!(f, "softmax:{}", axis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown activation '{0}'")]
pub struct UnknownActivation(pub String);

impl FromStr for Activation {
    type Err = UnknownActivation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" | "none" | "no_activation" | "identity" => return Ok(Activation::NoActivation),
            "relu" => return Ok(Activation::RELU),
            "softmax" => return Ok(Activation::Softmax { axis: None }),
            _ => {}
        }
        if let Some(axis) = s.strip_prefix("softmax:") {
            return axis
                .parse()
                .map(|axis| Activation::Softmax { axis: Some(axis) })
                .map_err(|_| UnknownActivation(s.to_string()));
        }
        UNARY_NAMES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, op)| Activation::Unary(*op))
            .ok_or_else(|| UnknownActivation(s.to_string()))
    }
}

impl TryFrom<String> for Activation {
    type Error = UnknownActivation;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Activation> for String {
    fn from(a: Activation) -> Self {
        a.to_string()
    }
}
