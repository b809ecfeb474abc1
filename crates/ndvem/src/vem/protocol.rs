//! Messages exchanged with the vector engine, one JSON document per line.

use serde::{Deserialize, Serialize};

use crate::array::{DType, Element, KernelError, Layout, Opcode, Shape};

/// Bumped whenever a message changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Engine-side allocation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteHandle(pub u64);

/// Element data in transit. Values travel as their exact bit patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub dtype: DType,
    pub bits: Vec<u64>,
}

impl Payload {
    pub fn encode<T: Element>(values: &[T]) -> Self {
        Payload {
            dtype: T::DTYPE,
            bits: values.iter().map(|v| v.to_bits()).collect(),
        }
    }

    pub fn decode<T: Element>(&self) -> Result<Vec<T>, KernelError> {
        if self.dtype != T::DTYPE {
            return Err(KernelError::DType {
                expected: T::DTYPE,
                found: self.dtype,
            });
        }
        Ok(self.bits.iter().map(|&bits| T::from_bits(bits)).collect())
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Dispatch operand: an engine allocation and the view of it to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOperand {
    pub handle: RemoteHandle,
    pub layout: Layout,
}

/// Where a batch operand comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSource {
    /// An existing engine allocation.
    Handle(RemoteHandle),
    /// The result of an earlier step of the same batch.
    Step(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperand {
    pub source: BatchSource,
    pub layout: Layout,
}

/// One dispatch inside a [`Request::Batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStep {
    pub op: Opcode,
    pub shape: Shape,
    pub operands: Vec<BatchOperand>,
}

/// First step of a batch that failed. Later steps were not run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub step: usize,
    pub error: KernelError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Hello {
        protocol: u32,
    },
    Allocate {
        dtype: DType,
        shape: Shape,
    },
    Upload {
        handle: RemoteHandle,
        payload: Payload,
    },
    Dispatch {
        op: Opcode,
        dtype: DType,
        shape: Shape,
        operands: Vec<RemoteOperand>,
    },
    /// Dependency-ordered dispatches answered with one reply.
    Batch {
        dtype: DType,
        steps: Vec<BatchStep>,
    },
    Fetch {
        handle: RemoteHandle,
    },
    ReadElement {
        handle: RemoteHandle,
        offset: usize,
    },
    WriteElement {
        handle: RemoteHandle,
        offset: usize,
        bits: u64,
    },
    Release {
        handle: RemoteHandle,
    },
    Shutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Allocate { .. } => "allocate",
            Request::Upload { .. } => "upload",
            Request::Dispatch { .. } => "dispatch",
            Request::Batch { .. } => "batch",
            Request::Fetch { .. } => "fetch",
            Request::ReadElement { .. } => "read_element",
            Request::WriteElement { .. } => "write_element",
            Request::Release { .. } => "release",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready { engine: String, protocol: u32 },
    Allocated { handle: RemoteHandle },
    /// One allocation per completed batch step, in step order.
    Batched {
        handles: Vec<RemoteHandle>,
        failure: Option<BatchFailure>,
    },
    Done,
    Data { payload: Payload },
    Element { bits: u64 },
    /// The request was understood but could not be carried out.
    Error { error: KernelError },
}
