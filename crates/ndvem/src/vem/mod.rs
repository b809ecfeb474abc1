//! Bridge to an out-of-process vector engine manager.
//!
//! ```text
//! RemoteAccessor --> Bridge --> Transport --(JSON lines)--> VemEngine
//!                      |            |
//!                      |            +-- ProcessTransport (ndvem-engine child process)
//!                      |            +-- LoopbackTransport (in-process engine)
//!                      +-- BridgeState: Uninitialized -> Activating -> Active | Unavailable
//! ```
//!
//! Activation failures are returned to the caller as [`ActivationError`]; the remote factory
//! turns them into a local fallback. Faults after activation make the bridge unavailable and
//! remote accessors react according to their [`FaultPolicy`].
mod bridge;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod transport;

pub use bridge::{activate, ActivationError, Bridge, BridgeError, BridgeState, RemoteBinding};
pub use config::{BridgeConfig, BridgeEnv, FaultPolicy};
pub use engine::VemEngine;
pub use protocol::{
    BatchFailure, BatchOperand, BatchSource, BatchStep, Payload, RemoteHandle, RemoteOperand,
    PROTOCOL_VERSION,
};
pub use transport::{LoopbackTransport, ProcessTransport, Transport, TransportError};
