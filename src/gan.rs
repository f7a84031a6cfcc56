//! Adversarial composition of a generator and a mirrored discriminator.

use std::collections::HashMap;

use crate::error::{BuildError, GraphError};
use crate::graph::{ExprGraph, Ix, T};
use crate::net::{Discriminator, Generator};

/// Name of the mirrored discriminator network.
pub const MIRRORED_NAME: &str = "gan_discriminator";

/// Original-to-mirror correspondence of the discriminator's parameter nodes.
#[derive(Debug, Clone, Default)]
pub struct ParamMirror {
    pairs: Vec<(Ix, Ix)>,
    index: HashMap<Ix, Ix>,
}

impl ParamMirror {
    fn insert(&mut self, original: Ix, mirrored: Ix) {
        self.pairs.push((original, mirrored));
        self.index.insert(original, mirrored);
    }

    pub fn get(&self, original: Ix) -> Option<Ix> {
        self.index.get(&original).copied()
    }

    /// Pairs in allocation order.
    pub fn pairs(&self) -> &[(Ix, Ix)] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// GAN topology: generator output fed into a copy of the discriminator whose
/// parameters are fresh nodes seeded with the original's values.
///
/// Training against [`Gan::learnables`] updates the generator and the copy
/// while the original discriminator's parameters stay untouched.
#[derive(Debug)]
pub struct Gan<'a> {
    generator: &'a Generator,
    discriminator: &'a Discriminator,
    mirrored: Discriminator,
    mirror: ParamMirror,
    out: Option<Ix>,
    learnables: Vec<Ix>,
    generator_learnables: Vec<Ix>,
}

struct Snapshot {
    layer: usize,
    original: Ix,
    name: String,
    value: T,
}

impl<'a> Gan<'a> {
    /// Mirrors a discriminator that lives on `g` itself.
    pub fn new(
        g: &mut ExprGraph,
        generator: &'a Generator,
        discriminator: &'a Discriminator,
    ) -> Result<Self, BuildError> {
        let snapshots = snapshot(g, discriminator)?;
        Self::build(g, generator, discriminator, snapshots)
    }

    /// Mirrors a discriminator built on a different graph into `g`.
    pub fn with_source(
        g: &mut ExprGraph,
        generator: &'a Generator,
        discriminator: &'a Discriminator,
        source: &ExprGraph,
    ) -> Result<Self, BuildError> {
        let snapshots = snapshot(source, discriminator)?;
        Self::build(g, generator, discriminator, snapshots)
    }

    fn build(
        g: &mut ExprGraph,
        generator: &'a Generator,
        discriminator: &'a Discriminator,
        snapshots: Vec<Snapshot>,
    ) -> Result<Self, BuildError> {
        let mut mirror = ParamMirror::default();
        for snap in snapshots {
            // Shared nodes are mirrored once.
            if mirror.get(snap.original).is_some() {
                continue;
            }
            let copy = g.new_param_from(&format!("{}_gan", snap.name), snap.value);
            mirror.insert(snap.original, copy);
        }

        let layers = discriminator
            .network()
            .layers()
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                layer.map_nodes(|ix| {
                    mirror.get(ix).ok_or_else(|| BuildError::Mirror {
                        name: format!("{:?}", ix),
                        index,
                        source: GraphError::UnknownNode(ix),
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mirrored = Discriminator::with_name(MIRRORED_NAME, layers)?;

        let generator_learnables = generator.learnables();
        let mut learnables = generator_learnables.clone();
        learnables.extend(mirrored.learnables());

        tracing::info!(
            layers = mirrored.network().layers().len(),
            parameters = mirror.len(),
            "mirrored discriminator"
        );

        Ok(Self {
            generator,
            discriminator,
            mirrored,
            mirror,
            out: None,
            learnables,
            generator_learnables,
        })
    }

    /// Builds the mirrored discriminator on top of the generator's output.
    pub fn fwd(&mut self, g: &mut ExprGraph, batch_size: usize) -> Result<(), BuildError> {
        let input = self.generator.out().ok_or(BuildError::GeneratorNotBuilt)?;
        self.mirrored
            .network_mut()
            .fwd(g, batch_size, &[input])
            .map_err(|source| BuildError::Role {
                role: "gan",
                source: Box::new(source),
            })?;
        self.out = self.mirrored.out();
        Ok(())
    }

    /// Copies the original discriminator's current values into the mirror.
    pub fn resync(&self, g: &mut ExprGraph) -> Result<(), BuildError> {
        let snapshots = snapshot(g, self.discriminator)?;
        self.write_back(g, snapshots)
    }

    /// [`Gan::resync`] for a discriminator living on `source`.
    pub fn resync_from(&self, g: &mut ExprGraph, source: &ExprGraph) -> Result<(), BuildError> {
        let snapshots = snapshot(source, self.discriminator)?;
        self.write_back(g, snapshots)
    }

    fn write_back(&self, g: &mut ExprGraph, snapshots: Vec<Snapshot>) -> Result<(), BuildError> {
        for snap in snapshots {
            let Some(mirrored) = self.mirror.get(snap.original) else {
                continue;
            };
            g.let_value(mirrored, snap.value)
                .map_err(|source| BuildError::Mirror {
                    name: snap.name,
                    index: snap.layer,
                    source,
                })?;
        }
        Ok(())
    }

    pub fn out(&self) -> Option<Ix> {
        self.out
    }

    pub fn generator_out(&self) -> Option<Ix> {
        self.generator.out()
    }

    /// Generator learnables followed by the mirrored discriminator's.
    pub fn learnables(&self) -> &[Ix] {
        &self.learnables
    }

    pub fn generator_learnables(&self) -> &[Ix] {
        &self.generator_learnables
    }

    pub fn mirrored_discriminator(&self) -> &Discriminator {
        &self.mirrored
    }

    pub fn mirror(&self) -> &ParamMirror {
        &self.mirror
    }
}

/// Current values of every parameter node of `discriminator`, read from the
/// graph it was built on.
fn snapshot(graph: &ExprGraph, discriminator: &Discriminator) -> Result<Vec<Snapshot>, BuildError> {
    let mut out = vec![];
    for (layer, l) in discriminator.network().layers().iter().enumerate() {
        for original in l.param_nodes() {
            let node = graph.node(original).map_err(|source| BuildError::Mirror {
                name: format!("{:?}", original),
                index: layer,
                source,
            })?;
            let value = graph
                .value_of(original)
                .map_err(|source| BuildError::Mirror {
                    name: node.name().to_string(),
                    index: layer,
                    source,
                })?
                .clone();
            out.push(Snapshot {
                layer,
                original,
                name: node.name().to_string(),
                value,
            });
        }
    }
    Ok(out)
}
