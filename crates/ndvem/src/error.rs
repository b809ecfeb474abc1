//! Error taxonomy shared by every accessor.
//!
//! Construction-time backend selection never produces these errors for the caller: factories
//! resolve them by substituting a weaker accessor. Everything below is what a caller can observe
//! at run time.

use thiserror::Error;

use crate::array::kernel::KernelError;
use crate::lazy::NodeId;

/// Errors surfaced by array reads, writes, views and operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArrayError {
    /// Index tuple outside the array bounds.
    #[error("index {index:?} is out of bounds for shape {shape:?}")]
    Index { index: Vec<usize>, shape: Vec<usize> },

    /// Requested capability is disabled or not supported by this build.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Shape, stride or axis arguments do not describe a valid result.
    #[error("shape error: {0}")]
    Shape(String),

    /// The remote engine failed after a successful activation.
    #[error("remote backend fault: {0}")]
    RecoverableBackend(String),

    /// Evaluating an operation failed. `node` names the lazy node when there is one.
    #[error("{}", describe_computation(.node, .source))]
    Computation {
        node: Option<NodeId>,
        #[source]
        source: KernelError,
    },
}

fn describe_computation(node: &Option<NodeId>, source: &KernelError) -> String {
    match node {
        Some(node) => format!("computation failed at lazy node {}: {source}", node.index()),
        None => format!("computation failed: {source}"),
    }
}

impl ArrayError {
    pub fn unsupported(message: impl Into<String>) -> Self {
        ArrayError::Unsupported(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        ArrayError::Shape(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        ArrayError::RecoverableBackend(message.into())
    }

    /// Wraps a kernel failure that happened outside of a lazy graph.
    pub fn eager(source: KernelError) -> Self {
        ArrayError::Computation { node: None, source }
    }

    /// Returns the lazy node a computation error is attached to.
    pub fn failed_node(&self) -> Option<NodeId> {
        match self {
            ArrayError::Computation { node, .. } => *node,
            _ => None,
        }
    }

    pub fn is_recoverable_backend(&self) -> bool {
        matches!(self, ArrayError::RecoverableBackend(_))
    }
}

/// Convenience alias for results returned by array routines.
pub type ArrayResult<T> = Result<T, ArrayError>;
