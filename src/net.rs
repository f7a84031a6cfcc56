use crate::error::BuildError;
use crate::graph::{ExprGraph, Ix};
use crate::layer::{wrap, Layer};

/// Ordered stack of layers wired one after another onto a shared graph.
#[derive(Debug, Clone)]
pub struct Network {
    name: String,
    layers: Vec<Layer>,
    out: Option<Ix>,
}

impl Network {
    pub fn new(name: impl Into<String>, layers: Vec<Layer>) -> Result<Self, BuildError> {
        let name = name.into();
        if layers.is_empty() {
            return Err(BuildError::EmptyNetwork(name));
        }
        Ok(Self {
            name,
            layers,
            out: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Output of the last successful [`Network::fwd`].
    pub fn out(&self) -> Option<Ix> {
        self.out
    }

    /// Feeds `inputs` to the first layer and every layer's activated output
    /// to the next one. Intermediate nodes are named `{name}_{i}` and
    /// `{name}_activated_{i}`.
    pub fn fwd(
        &mut self,
        g: &mut ExprGraph,
        batch_size: usize,
        inputs: &[Ix],
    ) -> Result<(), BuildError> {
        #[cfg(feature = "puffin")]
        puffin::profile_function!();

        let mut current = inputs.to_vec();
        for (i, layer) in self.layers.iter().enumerate() {
            let non_activated = layer
                .fwd(g, batch_size, &current)
                .map_err(|source| layer_error(&self.name, i, source))?;
            let name = format!("{}_{}", self.name, i);
            name_node(g, non_activated, &self.name, i, layer.variant(), name)?;
            let activation = layer.activation();
            let activated = activation
                .apply(g, non_activated)
                .map_err(|source| BuildError::Activation {
                    network: self.name.clone(),
                    index: i,
                    activation,
                    source,
                })?;
            if activated != non_activated {
                let name = format!("{}_activated_{}", self.name, i);
                name_node(g, activated, &self.name, i, layer.variant(), name)?;
            }
            tracing::debug!(
                network = %self.name,
                index = i,
                variant = layer.variant(),
                shape = ?g.shape(activated).unwrap_or(&[]),
                "built layer"
            );
            current = vec![activated];
        }
        self.out = current.first().copied();
        Ok(())
    }

    /// Every trainable node in layer order.
    pub fn learnables(&self) -> Vec<Ix> {
        self.layers.iter().flat_map(Layer::learnables).collect()
    }
}

fn layer_error(network: &str, index: usize, source: BuildError) -> BuildError {
    BuildError::Layer {
        network: network.to_string(),
        index,
        source: Box::new(source),
    }
}

fn name_node(
    g: &mut ExprGraph,
    node: Ix,
    network: &str,
    index: usize,
    variant: &'static str,
    name: String,
) -> Result<(), BuildError> {
    g.set_name(node, name)
        .map_err(wrap(variant, "name output"))
        .map_err(|source| layer_error(network, index, source))
}

macro_rules! role {
    ($(#[$doc:meta])* $ty:ident, $role:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $ty {
            network: Network,
        }

        impl $ty {
            pub fn new(layers: Vec<Layer>) -> Result<Self, BuildError> {
                Self::with_name($role, layers)
            }

            pub fn with_name(
                name: impl Into<String>,
                layers: Vec<Layer>,
            ) -> Result<Self, BuildError> {
                Ok(Self {
                    network: Network::new(name, layers)?,
                })
            }

            pub fn fwd(
                &mut self,
                g: &mut ExprGraph,
                batch_size: usize,
                inputs: &[Ix],
            ) -> Result<(), BuildError> {
                self.network
                    .fwd(g, batch_size, inputs)
                    .map_err(|source| BuildError::Role {
                        role: $role,
                        source: Box::new(source),
                    })
            }

            pub fn out(&self) -> Option<Ix> {
                self.network.out()
            }

            pub fn learnables(&self) -> Vec<Ix> {
                self.network.learnables()
            }

            pub fn network(&self) -> &Network {
                &self.network
            }
        }

        impl From<Network> for $ty {
            fn from(network: Network) -> Self {
                Self { network }
            }
        }
    };
}

role!(
    /// Network producing fake samples from noise.
    Generator,
    "generator"
);
role!(
    /// Network scoring samples as real or fake.
    Discriminator,
    "discriminator"
);

impl Discriminator {
    pub(crate) fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::graph::Dtype;
    use crate::init::Init;

    #[test]
    fn test_empty_network() {
        assert!(matches!(
            Network::new("net", vec![]),
            Err(BuildError::EmptyNetwork(name)) if name == "net"
        ));
        assert!(Generator::new(vec![]).is_err());
    }

    #[test]
    fn test_names_intermediate_nodes() {
        let mut g = ExprGraph::new();
        let w = g.new_param("w", &[3, 2], Init::Ones);
        let x = g.new_input("x", &[1, 2], Dtype::Float64);
        let mut net = Network::new(
            "net",
            vec![
                Layer::linear(w).with_activation(Activation::SIGMOID),
                Layer::flatten(),
            ],
        )
        .unwrap();
        assert_eq!(net.out(), None);
        net.fwd(&mut g, 1, &[x]).unwrap();
        let out = net.out().unwrap();
        assert_eq!(g.name(out).unwrap(), "net_1");
        assert_eq!(g.shape(out).unwrap(), &[1, 3]);
    }

    #[test]
    fn test_layer_errors_carry_index() {
        let mut g = ExprGraph::new();
        let w = g.new_param("w", &[3, 2], Init::Ones);
        let w2 = g.new_param("w2", &[4, 4], Init::Ones);
        let x = g.new_input("x", &[1, 2], Dtype::Float64);
        let mut disc = Discriminator::new(vec![Layer::linear(w), Layer::linear(w2)]).unwrap();
        let err = disc.fwd(&mut g, 1, &[x]).unwrap_err();
        let BuildError::Role { role, source } = &err else {
            panic!("expected role error, got {:?}", err);
        };
        assert_eq!(*role, "discriminator");
        assert!(matches!(**source, BuildError::Layer { index: 1, .. }));
        assert!(matches!(err.root(), BuildError::Graph { variant: "linear", .. }));
        assert_eq!(disc.out(), None);
    }

    #[test]
    fn test_naming_failure_is_a_layer_error() {
        let mut g = ExprGraph::new();
        let err = name_node(&mut g, Ix::new(42), "net", 3, "linear", "net_3".to_string())
            .unwrap_err();
        assert!(matches!(err, BuildError::Layer { index: 3, .. }));
        assert!(matches!(
            err.root(),
            BuildError::Graph {
                variant: "linear",
                action: "name output",
                ..
            }
        ));
    }
}
