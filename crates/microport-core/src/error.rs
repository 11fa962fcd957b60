use thiserror::Error;

use crate::{DType, Stage, TensorRole};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Every way a pipeline call can fail. All variants are terminal for the
/// call that produced them; nothing is retried.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("model schema version {found} is not equal to supported version {expected}")]
    SchemaVersionMismatch { found: u32, expected: u32 },

    #[error("model blob could not be parsed")]
    MalformedModel(#[source] BoxError),

    #[error("tensor allocation failed")]
    AllocationFailure(#[source] BoxError),

    #[error("model has no {role} tensor at index {index}")]
    MissingTensor { role: TensorRole, index: usize },

    #[error("{role} rank {rank} (dims {dims:?}) is not supported; expected {}", supported_forms(.role))]
    UnsupportedRank {
        role: TensorRole,
        rank: usize,
        dims: Vec<usize>,
    },

    #[error("{role} dimension [n] should be 1, got {batch}")]
    InvalidBatchSize { role: TensorRole, batch: usize },

    #[error("{role} dimension [c] should be 1 or 3, got {channels}")]
    InvalidChannelCount { role: TensorRole, channels: usize },

    #[error("{role} dimension {axis} of {dims:?} is zero")]
    ZeroDimension {
        role: TensorRole,
        axis: usize,
        dims: Vec<usize>,
    },

    #[error("{role} tensor has element type {found:?}, expected {expected:?}")]
    UnexpectedDType {
        role: TensorRole,
        found: DType,
        expected: DType,
    },

    #[error("inference pass failed")]
    InferenceFailure(#[source] BoxError),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Field-free discriminant of [`PipelineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SchemaVersionMismatch,
    MalformedModel,
    AllocationFailure,
    MissingTensor,
    UnsupportedRank,
    InvalidBatchSize,
    InvalidChannelCount,
    ZeroDimension,
    UnexpectedDType,
    InferenceFailure,
}

impl ErrorKind {
    /// Non-zero status code reported across the C boundary.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::SchemaVersionMismatch => 1,
            ErrorKind::MalformedModel => 2,
            ErrorKind::AllocationFailure => 3,
            ErrorKind::MissingTensor => 4,
            ErrorKind::UnsupportedRank => 5,
            ErrorKind::InvalidBatchSize => 6,
            ErrorKind::InvalidChannelCount => 7,
            ErrorKind::ZeroDimension => 8,
            ErrorKind::UnexpectedDType => 9,
            ErrorKind::InferenceFailure => 10,
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SchemaVersionMismatch { .. } => ErrorKind::SchemaVersionMismatch,
            PipelineError::MalformedModel(_) => ErrorKind::MalformedModel,
            PipelineError::AllocationFailure(_) => ErrorKind::AllocationFailure,
            PipelineError::MissingTensor { .. } => ErrorKind::MissingTensor,
            PipelineError::UnsupportedRank { .. } => ErrorKind::UnsupportedRank,
            PipelineError::InvalidBatchSize { .. } => ErrorKind::InvalidBatchSize,
            PipelineError::InvalidChannelCount { .. } => ErrorKind::InvalidChannelCount,
            PipelineError::ZeroDimension { .. } => ErrorKind::ZeroDimension,
            PipelineError::UnexpectedDType { .. } => ErrorKind::UnexpectedDType,
            PipelineError::InferenceFailure(_) => ErrorKind::InferenceFailure,
        }
    }

    /// Role of the offending tensor, for shape and dtype failures.
    pub fn role(&self) -> Option<TensorRole> {
        match self {
            PipelineError::MissingTensor { role, .. }
            | PipelineError::UnsupportedRank { role, .. }
            | PipelineError::InvalidBatchSize { role, .. }
            | PipelineError::InvalidChannelCount { role, .. }
            | PipelineError::ZeroDimension { role, .. }
            | PipelineError::UnexpectedDType { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// The pipeline state that was current when the call failed.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::SchemaVersionMismatch { .. } | PipelineError::MalformedModel(_) => {
                Stage::Unloaded
            }
            PipelineError::AllocationFailure(_) => Stage::Validated,
            PipelineError::InferenceFailure(_) => Stage::InputBound,
            _ => match self.role() {
                Some(TensorRole::Output) => Stage::Invoked,
                _ => Stage::Allocated,
            },
        }
    }

    /// Wraps an engine parse error.
    pub fn from_parse(err: anyhow::Error) -> Self {
        PipelineError::MalformedModel(err.into())
    }

    /// Wraps an engine bind or allocation error.
    pub fn from_allocation(err: anyhow::Error) -> Self {
        PipelineError::AllocationFailure(err.into())
    }

    /// Wraps an engine forward-pass error.
    pub fn from_invoke(err: anyhow::Error) -> Self {
        PipelineError::InferenceFailure(err.into())
    }
}

fn supported_forms(role: &TensorRole) -> &'static str {
    match role {
        TensorRole::Input => "[h][w](c=1), [h][w][c==1||c==3], or [n==1][h][w][c==1||c==3]",
        TensorRole::Output => "[c], [n==1][c], [h][w][c], or [n==1][h][w][c]",
    }
}
