//! Layer descriptors and their forward construction.

use crate::activation::Activation;
use crate::error::{BuildError, GraphError};
use crate::graph::{Dtype, ExprGraph, Ix};
use crate::kernels::{Conv2dParams, Pool2dParams};
use crate::recurrent::{self, RecurrentOptions};

/// What a layer does, together with exactly the nodes and options it needs.
///
/// Variants without an `activation` field have no activation slot: their
/// output is always passed on unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Linear {
        weight: Ix,
        activation: Activation,
    },
    Flatten,
    Convolutional {
        weight: Ix,
        params: Conv2dParams,
        activation: Activation,
    },
    Maxpool {
        params: Pool2dParams,
        activation: Activation,
    },
    Reshape {
        shape: Vec<usize>,
    },
    Dropout {
        probability: f64,
    },
    Embedding {
        weight: Ix,
        width: usize,
    },
    Recurrent {
        weight: Ix,
        options: RecurrentOptions,
        activation: Activation,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    kind: LayerKind,
    bias: Option<Ix>,
}

impl Layer {
    pub fn new(kind: LayerKind) -> Self {
        Self { kind, bias: None }
    }

    pub fn linear(weight: Ix) -> Self {
        Self::new(LayerKind::Linear {
            weight,
            activation: Activation::NoActivation,
        })
    }

    pub fn flatten() -> Self {
        Self::new(LayerKind::Flatten)
    }

    pub fn convolutional(weight: Ix, params: Conv2dParams) -> Self {
        Self::new(LayerKind::Convolutional {
            weight,
            params,
            activation: Activation::NoActivation,
        })
    }

    pub fn maxpool(params: Pool2dParams) -> Self {
        Self::new(LayerKind::Maxpool {
            params,
            activation: Activation::NoActivation,
        })
    }

    pub fn reshape(shape: &[usize]) -> Self {
        Self::new(LayerKind::Reshape {
            shape: shape.to_vec(),
        })
    }

    /// `probability` is the chance of zeroing each element.
    pub fn dropout(probability: f64) -> Self {
        Self::new(LayerKind::Dropout { probability })
    }

    pub fn embedding(weight: Ix, width: usize) -> Self {
        Self::new(LayerKind::Embedding { weight, width })
    }

    pub fn recurrent(weight: Ix, options: RecurrentOptions) -> Self {
        Self::new(LayerKind::Recurrent {
            weight,
            options,
            activation: Activation::NoActivation,
        })
    }

    pub fn with_bias(mut self, bias: Ix) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Sets the activation of variants that have a slot. Other variants keep
    /// passing their output through unchanged.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        let variant = self.variant();
        match &mut self.kind {
            LayerKind::Linear { activation: a, .. }
            | LayerKind::Convolutional { activation: a, .. }
            | LayerKind::Maxpool { activation: a, .. }
            | LayerKind::Recurrent { activation: a, .. } => *a = activation,
            _ if activation.is_identity() => {}
            _ => tracing::warn!(
                variant,
                %activation,
                "layer has no activation slot, ignoring activation"
            ),
        }
        self
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn bias(&self) -> Option<Ix> {
        self.bias
    }

    pub fn weight(&self) -> Option<Ix> {
        match &self.kind {
            LayerKind::Linear { weight, .. }
            | LayerKind::Convolutional { weight, .. }
            | LayerKind::Embedding { weight, .. }
            | LayerKind::Recurrent { weight, .. } => Some(*weight),
            LayerKind::Flatten
            | LayerKind::Maxpool { .. }
            | LayerKind::Reshape { .. }
            | LayerKind::Dropout { .. } => None,
        }
    }

    pub fn activation(&self) -> Activation {
        match &self.kind {
            LayerKind::Linear { activation, .. }
            | LayerKind::Convolutional { activation, .. }
            | LayerKind::Maxpool { activation, .. }
            | LayerKind::Recurrent { activation, .. } => *activation,
            LayerKind::Flatten
            | LayerKind::Reshape { .. }
            | LayerKind::Dropout { .. }
            | LayerKind::Embedding { .. } => Activation::NoActivation,
        }
    }

    pub fn variant(&self) -> &'static str {
        match &self.kind {
            LayerKind::Linear { .. } => "linear",
            LayerKind::Flatten => "flatten",
            LayerKind::Convolutional { .. } => "convolutional",
            LayerKind::Maxpool { .. } => "maxpool",
            LayerKind::Reshape { .. } => "reshape",
            LayerKind::Dropout { .. } => "dropout",
            LayerKind::Embedding { .. } => "embedding",
            LayerKind::Recurrent { .. } => "recurrent",
        }
    }

    /// Trainable nodes: weight, hidden weight (recurrent only), then bias.
    pub fn learnables(&self) -> Vec<Ix> {
        let mut out: Vec<Ix> = self.weight().into_iter().collect();
        if let LayerKind::Recurrent { options, .. } = &self.kind {
            out.push(options.hidden_weight);
            out.extend(options.bias);
        }
        out.extend(self.bias);
        out
    }

    /// Every value-bearing node the layer holds: the learnables plus the
    /// recurrent zero states.
    pub(crate) fn param_nodes(&self) -> Vec<Ix> {
        let mut out = self.learnables();
        if let LayerKind::Recurrent { options, .. } = &self.kind {
            out.push(options.hidden_state);
            out.push(options.cell_state);
        }
        out
    }

    /// Same layer with every node in [`Layer::param_nodes`] replaced by `f`.
    pub(crate) fn map_nodes<F>(&self, mut f: F) -> Result<Layer, BuildError>
    where
        F: FnMut(Ix) -> Result<Ix, BuildError>,
    {
        let mut kind = self.kind.clone();
        match &mut kind {
            LayerKind::Linear { weight, .. }
            | LayerKind::Convolutional { weight, .. }
            | LayerKind::Embedding { weight, .. } => *weight = f(*weight)?,
            LayerKind::Recurrent {
                weight, options, ..
            } => {
                *weight = f(*weight)?;
                options.hidden_weight = f(options.hidden_weight)?;
                options.bias = options.bias.map(&mut f).transpose()?;
                options.hidden_state = f(options.hidden_state)?;
                options.cell_state = f(options.cell_state)?;
            }
            LayerKind::Flatten
            | LayerKind::Maxpool { .. }
            | LayerKind::Reshape { .. }
            | LayerKind::Dropout { .. } => {}
        }
        let bias = self.bias.map(f).transpose()?;
        Ok(Layer { kind, bias })
    }

    fn validate(&self, inputs: &[Ix]) -> Result<(), BuildError> {
        let variant = self.variant();
        if inputs.is_empty() {
            return Err(BuildError::NoInputs(variant));
        }
        match &self.kind {
            LayerKind::Recurrent { .. } => {
                if inputs.len() != 1 && inputs.len() != 3 {
                    return Err(BuildError::Arity {
                        variant,
                        expected: "1 or 3",
                        got: inputs.len(),
                    });
                }
                if self.bias.is_some() {
                    return Err(BuildError::RecurrentBias);
                }
            }
            _ if inputs.len() != 1 => {
                return Err(BuildError::Arity {
                    variant,
                    expected: "1",
                    got: inputs.len(),
                })
            }
            _ => {}
        }
        let invalid = |reason: String| BuildError::Options { variant, reason };
        match &self.kind {
            LayerKind::Convolutional { params, .. } => params.validate().map_err(invalid),
            LayerKind::Maxpool { params, .. } => params.validate().map_err(invalid),
            LayerKind::Reshape { shape } if shape.is_empty() => {
                Err(invalid("target shape is empty".to_string()))
            }
            LayerKind::Dropout { probability } if !(0.0..=1.0).contains(probability) => {
                Err(BuildError::DropoutProbability(*probability))
            }
            LayerKind::Embedding { width: 0, .. } => {
                Err(invalid("embedding width must be non-zero".to_string()))
            }
            LayerKind::Recurrent { options, .. } if options.hidden_size == 0 => {
                Err(invalid("hidden size must be non-zero".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Appends the layer's computation to `g` and returns the node before
    /// activation.
    ///
    /// With `batch_size >= 2` the weight and bias are broadcast over axis 0 of
    /// the input.
    pub fn fwd(
        &self,
        g: &mut ExprGraph,
        batch_size: usize,
        inputs: &[Ix],
    ) -> Result<Ix, BuildError> {
        if batch_size == 0 {
            return Err(BuildError::BatchSize);
        }
        self.validate(inputs)?;

        let variant = self.variant();
        let input = inputs[0];
        let non_activated = match &self.kind {
            LayerKind::Linear { weight, .. } => {
                let t = g.transpose(*weight).map_err(wrap(variant, "transpose weights"))?;
                if batch_size < 2 {
                    g.mul(input, t)
                        .map_err(wrap(variant, "multiply input and weights [batch_size = 1]"))?
                } else {
                    g.batched_mul(input, t)
                        .map_err(wrap(variant, "multiply input and weights [batch_size >= 2]"))?
                }
            }
            LayerKind::Convolutional { weight, params, .. } => g
                .conv2d(input, *weight, *params)
                .map_err(wrap(variant, "convolve input by kernel"))?,
            LayerKind::Maxpool { params, .. } => g
                .max_pool2d(input, *params)
                .map_err(wrap(variant, "max-pool input"))?,
            LayerKind::Flatten => {
                let total = g
                    .shape(input)
                    .map_err(wrap(variant, "read input shape"))?
                    .iter()
                    .product::<usize>();
                g.reshape(input, &[batch_size, total / batch_size])
                    .map_err(wrap(variant, "flatten input"))?
            }
            LayerKind::Reshape { shape } => g
                .reshape(input, shape)
                .map_err(wrap(variant, "reshape input"))?,
            LayerKind::Dropout { probability } => g
                .dropout(input, *probability)
                .map_err(wrap(variant, "dilute input"))?,
            LayerKind::Embedding { weight, width } => embed(g, input, *weight, *width)?,
            LayerKind::Recurrent {
                weight, options, ..
            } => {
                recurrent::fwd(g, batch_size, *weight, options, inputs)?
            }
        };

        let Some(bias) = self.bias else {
            return Ok(non_activated);
        };
        if batch_size < 2 {
            g.add(non_activated, bias)
                .map_err(wrap(variant, "add bias to non-activated output"))
        } else {
            g.broadcast_add(non_activated, bias)
                .map_err(wrap(variant, "add bias to non-activated output [batch_size >= 2]"))
        }
    }
}

fn embed(g: &mut ExprGraph, input: Ix, table: Ix, width: usize) -> Result<Ix, BuildError> {
    let variant = "embedding";
    let dtype = g.dtype(input).map_err(wrap(variant, "read input dtype"))?;
    if dtype != Dtype::Int {
        return Err(BuildError::InputDtype {
            variant,
            expected: Dtype::Int,
            got: dtype,
        });
    }
    let table_shape = g.shape(table).map_err(wrap(variant, "read table shape"))?;
    if table_shape.len() != 2 || table_shape[1] != width {
        return Err(BuildError::Options {
            variant,
            reason: format!(
                "table of shape {:?} does not hold rows of width {}",
                table_shape, width
            ),
        });
    }
    let mut shape = g
        .shape(input)
        .map_err(wrap(variant, "read input shape"))?
        .to_vec();
    let count = shape.iter().product::<usize>();
    let flat = g
        .reshape(input, &[count])
        .map_err(wrap(variant, "flatten indices"))?;
    let rows = g
        .gather(table, flat)
        .map_err(wrap(variant, "gather rows"))?;
    shape.push(width);
    g.reshape(rows, &shape)
        .map_err(wrap(variant, "reshape gathered rows"))
}

pub(crate) fn wrap(
    variant: &'static str,
    action: &'static str,
) -> impl FnOnce(GraphError) -> BuildError {
    move |source| BuildError::Graph {
        variant,
        action,
        source,
    }
}
