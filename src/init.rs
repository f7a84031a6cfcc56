//! Parameter initializers and random input helpers.

use ndarray::IxDyn;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::graph::T;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Init {
    Zeros,
    Ones,
    Constant { value: f64 },
    Uniform { low: f64, high: f64 },
    /// Normal with std `gain * sqrt(2 / (fan_in + fan_out))`.
    GlorotNormal { gain: f64 },
    /// Uniform in `±gain * sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform { gain: f64 },
}

impl Default for Init {
    fn default() -> Self {
        Init::GlorotNormal { gain: 1.0 }
    }
}

impl Init {
    pub fn fill<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> T {
        let dim = IxDyn(shape);
        match *self {
            Init::Zeros => T::zeros(dim),
            Init::Ones => T::ones(dim),
            Init::Constant { value } => T::from_elem(dim, value),
            Init::Uniform { low, high } => T::from_shape_simple_fn(dim, || uniform(rng, low, high)),
            Init::GlorotNormal { gain } => {
                let (fan_in, fan_out) = fans(shape);
                let std = gain * (2.0 / (fan_in + fan_out)).sqrt();
                T::from_shape_simple_fn(dim, || std * standard_normal(rng))
            }
            Init::GlorotUniform { gain } => {
                let (fan_in, fan_out) = fans(shape);
                let limit = gain * (6.0 / (fan_in + fan_out)).sqrt();
                T::from_shape_simple_fn(dim, || uniform(rng, -limit, limit))
            }
        }
    }
}

/// Dim 0 is fan-out, dim 1 fan-in, trailing dims form the receptive field.
fn fans(shape: &[usize]) -> (f64, f64) {
    match shape {
        [] => (1.0, 1.0),
        [n] => (*n as f64, *n as f64),
        [out, inp, rest @ ..] => {
            let receptive = rest.iter().product::<usize>() as f64;
            (*inp as f64 * receptive, *out as f64 * receptive)
        }
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    low + (high - low) * rng.gen::<f64>()
}

/// Box-Muller transform.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-12);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// `(batch_size, n)` tensor of standard normal samples, e.g. generator noise.
pub fn normal_dense<R: Rng + ?Sized>(rng: &mut R, batch_size: usize, n: usize) -> T {
    T::from_shape_simple_fn(IxDyn(&[batch_size, n]), || standard_normal(rng))
}

/// `(batch_size, n)` tensor of samples from `[0, 1)`.
pub fn uniform_dense<R: Rng + ?Sized>(rng: &mut R, batch_size: usize, n: usize) -> T {
    T::from_shape_simple_fn(IxDyn(&[batch_size, n]), || rng.gen::<f64>())
}
