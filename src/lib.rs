//! Builds neural-network computation graphs from typed layer descriptors and
//! composes a generator and a discriminator into a GAN.

pub mod activation;
pub mod config;
pub mod error;
pub mod gan;
pub mod graph;
pub mod init;
pub mod kernels;
pub mod layer;
pub mod loss;
pub mod net;
pub mod recurrent;
pub mod tape;

pub use activation::Activation;
pub use error::{BuildError, ConfigError, GraphError};
pub use gan::{Gan, ParamMirror};
pub use graph::{Dtype, ExprGraph, Ix, T};
pub use init::Init;
pub use layer::{Layer, LayerKind};
pub use net::{Discriminator, Generator, Network};
pub use recurrent::RecurrentOptions;
pub use tape::TapeMachine;
