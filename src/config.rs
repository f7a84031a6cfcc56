//! Declarative JSON network descriptions.
//!
//! ```json
//! {
//!   "name": "generator",
//!   "layers": [
//!     { "type": "linear", "inputs": 1, "outputs": 16, "activation": "rectify" },
//!     { "type": "linear", "inputs": 16, "outputs": 2 }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::ConfigError;
use crate::graph::ExprGraph;
use crate::init::Init;
use crate::kernels::{Conv2dParams, Pool2dParams};
use crate::layer::Layer;
use crate::net::{Discriminator, Generator, Network};
use crate::recurrent;

fn yes() -> bool {
    true
}

fn tanh() -> Activation {
    Activation::TANH
}

fn sigmoid() -> Activation {
    Activation::SIGMOID
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Linear {
        inputs: usize,
        outputs: usize,
        #[serde(default = "yes")]
        bias: bool,
        #[serde(default)]
        activation: Activation,
        #[serde(default)]
        init: Init,
    },
    Flatten,
    Convolutional {
        channels: usize,
        filters: usize,
        params: Conv2dParams,
        #[serde(default)]
        activation: Activation,
        #[serde(default)]
        init: Init,
    },
    Maxpool {
        params: Pool2dParams,
        #[serde(default)]
        activation: Activation,
    },
    Reshape {
        shape: Vec<usize>,
    },
    Dropout {
        probability: f64,
    },
    Embedding {
        vocabulary: usize,
        width: usize,
        #[serde(default)]
        init: Init,
    },
    Recurrent {
        inputs: usize,
        hidden: usize,
        #[serde(default = "tanh")]
        activation: Activation,
        #[serde(default = "sigmoid")]
        recurrent_activation: Activation,
        /// Applied to the stacked hidden states.
        #[serde(default)]
        output_activation: Activation,
        #[serde(default)]
        init: Init,
    },
}

impl LayerConfig {
    fn validate(&self) -> Result<(), String> {
        let nonzero = |what: &str, v: usize| {
            if v == 0 {
                Err(format!("{} must be non-zero", what))
            } else {
                Ok(())
            }
        };
        match self {
            LayerConfig::Linear { inputs, outputs, .. } => {
                nonzero("inputs", *inputs)?;
                nonzero("outputs", *outputs)
            }
            LayerConfig::Flatten => Ok(()),
            LayerConfig::Convolutional {
                channels,
                filters,
                params,
                ..
            } => {
                nonzero("channels", *channels)?;
                nonzero("filters", *filters)?;
                params.validate()
            }
            LayerConfig::Maxpool { params, .. } => params.validate(),
            LayerConfig::Reshape { shape } => {
                if shape.is_empty() || shape.contains(&0) {
                    Err(format!("invalid reshape target {:?}", shape))
                } else {
                    Ok(())
                }
            }
            LayerConfig::Dropout { probability } => {
                if (0.0..=1.0).contains(probability) {
                    Ok(())
                } else {
                    Err(format!("dropout probability {} is outside [0;1]", probability))
                }
            }
            LayerConfig::Embedding { vocabulary, width, .. } => {
                nonzero("vocabulary", *vocabulary)?;
                nonzero("width", *width)
            }
            LayerConfig::Recurrent { inputs, hidden, .. } => {
                nonzero("inputs", *inputs)?;
                nonzero("hidden", *hidden)
            }
        }
    }

    /// Allocates the layer's parameters on `g` as `{prefix}_w{i}` /
    /// `{prefix}_b{i}`.
    fn build(&self, g: &mut ExprGraph, prefix: &str, i: usize) -> Layer {
        let w = format!("{}_w{}", prefix, i);
        match self {
            LayerConfig::Linear {
                inputs,
                outputs,
                bias,
                activation,
                init,
            } => {
                let weight = g.new_param(&w, &[*outputs, *inputs], *init);
                let layer = Layer::linear(weight).with_activation(*activation);
                if *bias {
                    let b = g.new_param(&format!("{}_b{}", prefix, i), &[1, *outputs], Init::Zeros);
                    layer.with_bias(b)
                } else {
                    layer
                }
            }
            LayerConfig::Flatten => Layer::flatten(),
            LayerConfig::Convolutional {
                channels,
                filters,
                params,
                activation,
                init,
            } => {
                let [kh, kw] = params.kernel;
                let weight = g.new_param(&w, &[*filters, *channels, kh, kw], *init);
                Layer::convolutional(weight, *params).with_activation(*activation)
            }
            LayerConfig::Maxpool { params, activation } => {
                Layer::maxpool(*params).with_activation(*activation)
            }
            LayerConfig::Reshape { shape } => Layer::reshape(shape),
            LayerConfig::Dropout { probability } => Layer::dropout(*probability),
            LayerConfig::Embedding {
                vocabulary,
                width,
                init,
            } => {
                let table = g.new_param(&w, &[*vocabulary, *width], *init);
                Layer::embedding(table, *width)
            }
            LayerConfig::Recurrent {
                inputs,
                hidden,
                activation,
                recurrent_activation,
                output_activation,
                init,
            } => {
                let name = format!("{}_lstm{}", prefix, i);
                let (weight, options) =
                    recurrent::lstm_params(g, &name, *inputs, *hidden, *init);
                Layer::recurrent(
                    weight,
                    options.with_activations(*activation, *recurrent_activation),
                )
                .with_activation(*output_activation)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub layers: Vec<LayerConfig>,
}

impl NetworkConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("network name is empty".to_string()));
        }
        if self.layers.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "network '{}' has no layers",
                self.name
            )));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            layer
                .validate()
                .map_err(|reason| {
                    ConfigError::Invalid(format!("{} layer #{}: {}", self.name, i, reason))
                })?;
        }
        Ok(())
    }

    /// Allocates every parameter on `g` and assembles the network.
    pub fn build(&self, g: &mut ExprGraph) -> Result<Network, ConfigError> {
        self.validate()?;
        let layers = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| layer.build(g, &self.name, i))
            .collect();
        Ok(Network::new(self.name.clone(), layers)?)
    }

    pub fn build_generator(&self, g: &mut ExprGraph) -> Result<Generator, ConfigError> {
        Ok(self.build(g)?.into())
    }

    pub fn build_discriminator(&self, g: &mut ExprGraph) -> Result<Discriminator, ConfigError> {
        Ok(self.build(g)?.into())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<NetworkConfig, ConfigError> {
    let json = std::fs::read_to_string(path)?;
    NetworkConfig::from_json(&json)
}

/// Both halves of a GAN in one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GanConfig {
    pub generator: NetworkConfig,
    pub discriminator: NetworkConfig,
}

impl GanConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.generator.validate()?;
        config.discriminator.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Builds both networks on the same graph.
    pub fn build(&self, g: &mut ExprGraph) -> Result<(Generator, Discriminator), ConfigError> {
        Ok((
            self.generator.build_generator(g)?,
            self.discriminator.build_discriminator(g)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::from_json(
            r#"{"name": "d", "layers": [{"type": "linear", "inputs": 2, "outputs": 1}]}"#,
        )
        .unwrap();
        assert_eq!(
            config.layers[0],
            LayerConfig::Linear {
                inputs: 2,
                outputs: 1,
                bias: true,
                activation: Activation::NoActivation,
                init: Init::GlorotNormal { gain: 1.0 },
            }
        );
    }

    #[test]
    fn test_rejects_bad_dropout() {
        let err = NetworkConfig::from_json(
            r#"{"name": "d", "layers": [{"type": "dropout", "probability": 1.1}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_activation() {
        let err = NetworkConfig::from_json(
            r#"{"name": "d", "layers": [{"type": "linear", "inputs": 2, "outputs": 1, "activation": "gelu"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_parameter_names() {
        let config = NetworkConfig::from_json(
            r#"{"name": "g", "layers": [
                {"type": "linear", "inputs": 2, "outputs": 4, "activation": "tanh"},
                {"type": "linear", "inputs": 4, "outputs": 1, "bias": false}
            ]}"#,
        )
        .unwrap();
        let mut g = ExprGraph::with_seed(1);
        let net = config.build(&mut g).unwrap();
        let names: Vec<_> = net
            .learnables()
            .into_iter()
            .map(|ix| g.name(ix).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["g_w0", "g_b0", "g_w1"]);
        assert_eq!(g.shape(net.learnables()[0]).unwrap(), &[4, 2]);
    }
}
