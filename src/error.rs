use crate::activation::Activation;
use crate::graph::{Dtype, Ix};

/// Errors raised by the expression graph while allocating nodes, inferring
/// shapes or evaluating the tape.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    #[error("node {0:?} does not belong to this graph")]
    UnknownNode(Ix),

    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("{op} expects a tensor of rank {expected}, got shape {got:?}")]
    Rank {
        op: &'static str,
        expected: &'static str,
        got: Vec<usize>,
    },

    #[error("can't reshape {from:?} into {to:?}")]
    Reshape { from: Vec<usize>, to: Vec<usize> },

    #[error("axis {axis} is out of range for shape {shape:?}")]
    Axis { axis: usize, shape: Vec<usize> },

    #[error("slice [{start}, {end}) is out of range for axis {axis} of shape {shape:?}")]
    SliceRange {
        axis: usize,
        start: usize,
        end: usize,
        shape: Vec<usize>,
    },

    #[error("dtype mismatch in {op}: expected {expected:?}, got {got:?}")]
    Dtype {
        op: &'static str,
        expected: Dtype,
        got: Dtype,
    },

    #[error("value of node '{0}' is not bound")]
    Unbound(String),

    #[error("index {index} is out of range for a table with {rows} rows")]
    IndexOutOfRange { index: i64, rows: usize },

    #[error("invalid value for node '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("invalid {op} parameters: {reason}")]
    InvalidParams { op: &'static str, reason: String },

    #[error("concat requires at least one input")]
    EmptyConcat,

    #[error("graph contains a cycle at node {0:?}")]
    Cycle(Ix),
}

/// Errors raised while building layers, networks and the GAN on top of an
/// expression graph. All of them are detected before the tape runs.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("batch size must be at least 1")]
    BatchSize,

    #[error("no input nodes supplied to {0} layer")]
    NoInputs(&'static str),

    #[error("{variant} layer expects {expected} input node(s), got {got}")]
    Arity {
        variant: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("dropout probability should lie in [0;1], got {0}")]
    DropoutProbability(f64),

    #[error("invalid options for {variant} layer: {reason}")]
    Options {
        variant: &'static str,
        reason: String,
    },

    #[error("{variant} layer requires {expected:?} input, got {got:?}")]
    InputDtype {
        variant: &'static str,
        expected: Dtype,
        got: Dtype,
    },

    #[error("recurrent layer manages its own gate bias; set it through RecurrentOptions")]
    RecurrentBias,

    #[error("can't {action} in {variant} layer")]
    Graph {
        variant: &'static str,
        action: &'static str,
        #[source]
        source: GraphError,
    },

    #[error("network '{0}' must have at least one layer")]
    EmptyNetwork(String),

    #[error("[{network}, layer #{index}] can't feedforward input before activation")]
    Layer {
        network: String,
        index: usize,
        #[source]
        source: Box<BuildError>,
    },

    #[error("[{network}, layer #{index}] can't apply activation '{activation}'")]
    Activation {
        network: String,
        index: usize,
        activation: Activation,
        #[source]
        source: GraphError,
    },

    #[error("[{role}] forward construction failed")]
    Role {
        role: &'static str,
        #[source]
        source: Box<BuildError>,
    },

    #[error("generator output is undefined; forward the generator before the GAN")]
    GeneratorNotBuilt,

    #[error("can't mirror parameter '{name}' of discriminator layer #{index}")]
    Mirror {
        name: String,
        index: usize,
        #[source]
        source: GraphError,
    },
}

impl BuildError {
    /// Walks through the layer/role wrappers and returns the innermost error.
    pub fn root(&self) -> &BuildError {
        match self {
            BuildError::Layer { source, .. } | BuildError::Role { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Errors raised while loading or materialising a network description.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read config file")]
    Io(#[from] std::io::Error),

    #[error("can't parse config")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Build(#[from] BuildError),
}
