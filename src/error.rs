use crate::cache::MicroBatchId;

/// Errors raised by parameters, modules and layers.
///
/// Everything here is a programmer error surfaced immediately; nothing is
/// retried inside the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `forward` or `backward` was called on a module that does not provide it.
    #[error("{module}::{op} is not implemented")]
    ContractViolation { module: String, op: &'static str },

    /// `backward` ran for a micro-batch that has no cached forward state.
    #[error("{module}: no cached activations for micro-batch {mubatch_id} (backward without a matching forward)")]
    MissingCache {
        module: String,
        mubatch_id: MicroBatchId,
    },

    #[error("parameter `{0}` is already registered")]
    DuplicateParameter(String),

    #[error("no parameter named `{0}`")]
    UnknownParameter(String),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl Error {
    pub(crate) fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        Error::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
