//! LSTM cell unrolled over the leading (sequence) axis.

use crate::activation::Activation;
use crate::error::BuildError;
use crate::graph::{ExprGraph, Ix};
use crate::init::Init;
use crate::layer::{wrap, Layer};

const VARIANT: &str = "recurrent";

/// Nodes and settings of a recurrent cell besides its input weight.
///
/// `hidden_weight` has shape `(H, 4H)`; `bias`, when present, `(4H)` or
/// `(1, 4H)`. Gate columns are laid out as input, forget, cell, output.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentOptions {
    pub hidden_size: usize,
    pub hidden_weight: Ix,
    pub bias: Option<Ix>,
    /// Applied to the cell candidate.
    pub activation: Activation,
    /// Applied to the input, forget and output gates.
    pub recurrent_activation: Activation,
    pub hidden_state: Ix,
    pub cell_state: Ix,
}

impl RecurrentOptions {
    pub fn new(hidden_size: usize, hidden_weight: Ix, hidden_state: Ix, cell_state: Ix) -> Self {
        Self {
            hidden_size,
            hidden_weight,
            bias: None,
            activation: Activation::TANH,
            recurrent_activation: Activation::SIGMOID,
            hidden_state,
            cell_state,
        }
    }

    pub fn with_bias(mut self, bias: Ix) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_activations(
        mut self,
        activation: Activation,
        recurrent_activation: Activation,
    ) -> Self {
        self.activation = activation;
        self.recurrent_activation = recurrent_activation;
        self
    }
}

/// Allocates the input weight `{name}_input_w` plus the hidden weight, gate
/// bias and zero states of an LSTM cell mapping `input_size` features to
/// `hidden_size`.
pub fn lstm_params(
    g: &mut ExprGraph,
    name: &str,
    input_size: usize,
    hidden_size: usize,
    init: Init,
) -> (Ix, RecurrentOptions) {
    let gates = 4 * hidden_size;
    let weight = g.new_param(&format!("{}_input_w", name), &[input_size, gates], init);
    let hidden_weight = g.new_param(&format!("{}_hidden_w", name), &[hidden_size, gates], init);
    let bias = g.new_param(&format!("{}_b", name), &[1, gates], Init::Zeros);
    let hidden_state = g.new_param(&format!("{}_h0", name), &[1, hidden_size], Init::Zeros);
    let cell_state = g.new_param(&format!("{}_c0", name), &[1, hidden_size], Init::Zeros);
    let options =
        RecurrentOptions::new(hidden_size, hidden_weight, hidden_state, cell_state).with_bias(bias);
    (weight, options)
}

pub fn lstm(
    g: &mut ExprGraph,
    name: &str,
    input_size: usize,
    hidden_size: usize,
    init: Init,
) -> Layer {
    let (weight, options) = lstm_params(g, name, input_size, hidden_size, init);
    Layer::recurrent(weight, options)
}

/// `[start, end)` column ranges of the input, forget, cell and output gates.
pub fn gate_bounds(hidden_size: usize) -> [(usize, usize); 4] {
    let h = hidden_size;
    [(0, h), (h, 2 * h), (2 * h, 3 * h), (3 * h, 4 * h)]
}

fn options_error(reason: String) -> BuildError {
    BuildError::Options {
        variant: VARIANT,
        reason,
    }
}

fn expect_shape(g: &ExprGraph, node: Ix, what: &str, shape: &[usize]) -> Result<(), BuildError> {
    let got = g.shape(node).map_err(wrap(VARIANT, "read parameter shape"))?;
    if got != shape {
        return Err(options_error(format!(
            "{} must have shape {:?}, got {:?}",
            what, shape, got
        )));
    }
    Ok(())
}

struct Cell<'o> {
    options: &'o RecurrentOptions,
    broadcast: bool,
}

impl Cell<'_> {
    fn add(&self, g: &mut ExprGraph, a: Ix, b: Ix) -> Result<Ix, BuildError> {
        if self.broadcast {
            g.broadcast_add(a, b)
                .map_err(wrap(VARIANT, "add [batch_size >= 2]"))
        } else {
            g.add(a, b).map_err(wrap(VARIANT, "add"))
        }
    }

    fn hadamard(&self, g: &mut ExprGraph, a: Ix, b: Ix) -> Result<Ix, BuildError> {
        if self.broadcast {
            g.broadcast_hadamard_prod(a, b)
                .map_err(wrap(VARIANT, "hadamard product [batch_size >= 2]"))
        } else {
            g.hadamard_prod(a, b)
                .map_err(wrap(VARIANT, "hadamard product"))
        }
    }

    fn gate(
        &self,
        g: &mut ExprGraph,
        gates: Ix,
        idx: usize,
        activation: Activation,
    ) -> Result<Ix, BuildError> {
        let (start, end) = gate_bounds(self.options.hidden_size)[idx];
        let raw = g
            .slice(gates, 1, start, end)
            .map_err(wrap(VARIANT, "slice gate"))?;
        activation
            .apply(g, raw)
            .map_err(wrap(VARIANT, "activate gate"))
    }

    /// One time step; returns the new hidden and cell states.
    fn step(
        &self,
        g: &mut ExprGraph,
        x: Ix,
        weight: Ix,
        bias: Ix,
        h: Ix,
        c: Ix,
    ) -> Result<(Ix, Ix), BuildError> {
        let xw = g.mul(x, weight).map_err(wrap(VARIANT, "multiply input and weights"))?;
        let hw = g
            .mul(h, self.options.hidden_weight)
            .map_err(wrap(VARIANT, "multiply hidden state and weights"))?;
        let sum = self.add(g, xw, hw)?;
        let gates = self.add(g, sum, bias)?;

        let recurrent = self.options.recurrent_activation;
        let i = self.gate(g, gates, 0, recurrent)?;
        let f = self.gate(g, gates, 1, recurrent)?;
        let cand = self.gate(g, gates, 2, self.options.activation)?;
        let o = self.gate(g, gates, 3, recurrent)?;

        let kept = self.hadamard(g, f, c)?;
        let written = self.hadamard(g, i, cand)?;
        let c = self.add(g, kept, written)?;
        let squashed = g.tanh(c).map_err(wrap(VARIANT, "squash cell state"))?;
        let h = self.hadamard(g, o, squashed)?;
        Ok((h, c))
    }
}

/// Builds the unrolled cell. `inputs` is `[x]` (zero states from the options)
/// or `[x, h0, c0]`; `x` is `(T, B, D)` or `(T, D)`. The output stacks the
/// hidden state of every step: `(T, B, H)` or `(T, H)`.
pub(crate) fn fwd(
    g: &mut ExprGraph,
    batch_size: usize,
    weight: Ix,
    options: &RecurrentOptions,
    inputs: &[Ix],
) -> Result<Ix, BuildError> {
    let x = inputs[0];
    let (mut h, mut c) = match inputs {
        [_, h0, c0] => (*h0, *c0),
        _ => (options.hidden_state, options.cell_state),
    };

    let hidden = options.hidden_size;
    let x_shape = g.shape(x).map_err(wrap(VARIANT, "read input shape"))?.to_vec();
    let (steps, step_shape) = match x_shape.as_slice() {
        [t, d] => (*t, vec![1, *d]),
        [t, b, d] => (*t, vec![*b, *d]),
        _ => {
            return Err(options_error(format!(
                "input must be (T, B, D) or (T, D), got {:?}",
                x_shape
            )))
        }
    };
    let features = step_shape[1];

    expect_shape(g, weight, "input weight", &[features, 4 * hidden])?;
    expect_shape(g, options.hidden_weight, "hidden weight", &[hidden, 4 * hidden])?;
    for (node, what) in [(h, "hidden state"), (c, "cell state")] {
        let shape = g.shape(node).map_err(wrap(VARIANT, "read state shape"))?;
        if shape.len() != 2 || shape[1] != hidden {
            return Err(options_error(format!(
                "{} must have shape (B, {}), got {:?}",
                what, hidden, shape
            )));
        }
    }

    let bias = match options.bias {
        Some(bias) => {
            let shape = g.shape(bias).map_err(wrap(VARIANT, "read bias shape"))?.to_vec();
            match shape.as_slice() {
                [n] if *n == 4 * hidden => g
                    .reshape(bias, &[1, 4 * hidden])
                    .map_err(wrap(VARIANT, "reshape bias"))?,
                [1, n] if *n == 4 * hidden => bias,
                _ => {
                    return Err(options_error(format!(
                        "gate bias must have shape ({}) or (1, {}), got {:?}",
                        4 * hidden,
                        4 * hidden,
                        shape
                    )))
                }
            }
        }
        None => g.new_param("lstm_zero_bias", &[1, 4 * hidden], Init::Zeros),
    };

    let cell = Cell {
        options,
        broadcast: batch_size >= 2,
    };
    let mut outputs = Vec::with_capacity(steps);
    for t in 0..steps {
        let xt = g
            .slice(x, 0, t, t + 1)
            .map_err(wrap(VARIANT, "slice time step"))?;
        let xt = g
            .reshape(xt, &step_shape)
            .map_err(wrap(VARIANT, "reshape time step"))?;
        (h, c) = cell.step(g, xt, weight, bias, h, c)?;
        let out = if x_shape.len() == 3 {
            let rows = g.shape(h).map_err(wrap(VARIANT, "read hidden shape"))?[0];
            g.reshape(h, &[1, rows, hidden])
                .map_err(wrap(VARIANT, "stack hidden state"))?
        } else {
            h
        };
        outputs.push(out);
    }
    g.concat(0, &outputs)
        .map_err(wrap(VARIANT, "concatenate hidden states"))
}
