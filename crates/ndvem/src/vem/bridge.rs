use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::array::{DType, KernelError, Opcode, Shape};
use crate::timing::ScopedTimer;

use super::config::{BridgeConfig, BridgeEnv, FaultPolicy};
use super::protocol::{
    BatchFailure, BatchStep, Payload, RemoteHandle, RemoteOperand, Request, Response,
    PROTOCOL_VERSION,
};
use super::transport::{ProcessTransport, Transport, TransportError};

static BRIDGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a bridge. `Unavailable` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Activating,
    Active,
    Unavailable,
}

/// Reasons activation did not reach [`BridgeState::Active`].
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("no bridge configuration path was provided")]
    MissingConfig,
    #[error("bridge configuration {} is unusable: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },
    #[error("engine `{engine}` was not found in {searched} search path entries")]
    EngineNotFound { engine: String, searched: usize },
    #[error("failed to start engine {}: {reason}", .path.display())]
    Spawn { path: PathBuf, reason: String },
    #[error("engine handshake failed: {0}")]
    Handshake(String),
    #[error("engine did not answer the handshake within {0:?}")]
    Timeout(Duration),
    #[error("engine speaks protocol {found}, expected {expected}")]
    ProtocolMismatch { expected: u32, found: u32 },
    #[error("bridge can not be activated from state {0:?}")]
    InvalidState(BridgeState),
}

/// Failures of an individual bridge operation after activation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("remote engine is unavailable")]
    Unavailable,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected engine response to {request}: {response}")]
    Protocol {
        request: &'static str,
        response: String,
    },
    /// The engine understood the request and reported that it failed.
    #[error("engine rejected the request: {0}")]
    Engine(KernelError),
}

impl BridgeError {
    /// Faults degrade the bridge; engine-reported failures do not.
    pub fn is_fault(&self) -> bool {
        !matches!(self, BridgeError::Engine(_))
    }
}

/// Identifies an engine allocation together with the bridge that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteBinding {
    pub bridge: u64,
    pub handle: RemoteHandle,
}

struct BridgeInner {
    state: BridgeState,
    config: BridgeConfig,
    link: Option<Box<dyn Transport>>,
    engine: Option<String>,
    live: HashSet<RemoteHandle>,
}

/// Connection to one external vector engine.
///
/// Every operation is a synchronous round trip. The first transport failure or malformed reply
/// moves the bridge to [`BridgeState::Unavailable`] for the rest of its life.
pub struct Bridge {
    id: u64,
    inner: Mutex<BridgeInner>,
}

/// Creates a bridge from `env` and activates it.
pub fn activate(env: &BridgeEnv) -> Result<Arc<Bridge>, ActivationError> {
    let bridge = Arc::new(Bridge::new());
    bridge.activate(env)?;
    Ok(bridge)
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Bridge {
            id: BRIDGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Uninitialized,
                config: BridgeConfig::default(),
                link: None,
                engine: None,
                live: HashSet::new(),
            }),
        }
    }

    /// Activates a bridge over an already established transport.
    pub fn connect(
        config: BridgeConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Bridge>, ActivationError> {
        let bridge = Arc::new(Bridge::new());
        bridge.activate_with_transport(config, transport)?;
        Ok(bridge)
    }

    fn lock(&self) -> MutexGuard<'_, BridgeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> BridgeState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == BridgeState::Active
    }

    pub fn fault_policy(&self) -> FaultPolicy {
        self.lock().config.fault_policy
    }

    /// Engine name reported during the handshake.
    pub fn engine_name(&self) -> Option<String> {
        self.lock().engine.clone()
    }

    /// Allocations created through this bridge and not yet released.
    pub fn live_handles(&self) -> usize {
        self.lock().live.len()
    }

    fn begin_activation(&self) -> Result<(), ActivationError> {
        let mut inner = self.lock();
        if inner.state != BridgeState::Uninitialized {
            return Err(ActivationError::InvalidState(inner.state));
        }
        inner.state = BridgeState::Activating;
        Ok(())
    }

    fn fail_activation(&self, err: ActivationError) -> ActivationError {
        self.lock().state = BridgeState::Unavailable;
        log::warn!("vector engine bridge {} unavailable: {err}", self.id);
        err
    }

    /// Loads the configuration named by `env`, starts the engine and performs the handshake.
    pub fn activate(&self, env: &BridgeEnv) -> Result<(), ActivationError> {
        self.begin_activation()?;
        let _timer = ScopedTimer::new(format!("bridge {} activation", self.id))
            .with_level(log::Level::Debug);
        let launched = launch(env);
        match launched {
            Ok((config, transport)) => self.handshake(config, transport),
            Err(err) => Err(self.fail_activation(err)),
        }
    }

    pub fn activate_with_transport(
        &self,
        config: BridgeConfig,
        transport: Box<dyn Transport>,
    ) -> Result<(), ActivationError> {
        self.begin_activation()?;
        self.handshake(config, transport)
    }

    fn handshake(
        &self,
        config: BridgeConfig,
        mut transport: Box<dyn Transport>,
    ) -> Result<(), ActivationError> {
        let hello = Request::Hello {
            protocol: PROTOCOL_VERSION,
        };
        let outcome = match transport.round_trip(&hello, config.handshake_timeout()) {
            Ok(Response::Ready { engine, protocol }) if protocol == PROTOCOL_VERSION => Ok(engine),
            Ok(Response::Ready { protocol, .. }) => Err(ActivationError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                found: protocol,
            }),
            Ok(other) => Err(ActivationError::Handshake(format!(
                "unexpected reply {other:?}"
            ))),
            Err(TransportError::Timeout(waited)) => Err(ActivationError::Timeout(waited)),
            Err(err) => Err(ActivationError::Handshake(err.to_string())),
        };
        match outcome {
            Ok(engine) => {
                log::info!("vector engine bridge {} active ({engine})", self.id);
                let mut inner = self.lock();
                inner.state = BridgeState::Active;
                inner.config = config;
                inner.link = Some(transport);
                inner.engine = Some(engine);
                Ok(())
            }
            Err(err) => {
                transport.close();
                Err(self.fail_activation(err))
            }
        }
    }

    fn degrade(&self, inner: &mut BridgeInner, reason: &str) {
        if inner.state == BridgeState::Unavailable {
            return;
        }
        log::warn!("vector engine bridge {} faulted: {reason}", self.id);
        inner.state = BridgeState::Unavailable;
        inner.live.clear();
        if let Some(mut link) = inner.link.take() {
            link.close();
        }
    }

    fn request(&self, request: Request) -> Result<Response, BridgeError> {
        let mut inner = self.lock();
        if inner.state != BridgeState::Active {
            return Err(BridgeError::Unavailable);
        }
        let timeout = inner.config.request_timeout();
        let Some(link) = inner.link.as_mut() else {
            return Err(BridgeError::Unavailable);
        };
        match link.round_trip(&request, timeout) {
            Ok(Response::Error { error }) => Err(BridgeError::Engine(error)),
            Ok(response) => Ok(response),
            Err(err) => {
                self.degrade(&mut inner, &format!("{} failed: {err}", request.name()));
                Err(BridgeError::Transport(err))
            }
        }
    }

    fn unexpected(&self, request: &'static str, response: Response) -> BridgeError {
        let response = format!("{response:?}");
        let mut inner = self.lock();
        self.degrade(&mut inner, &format!("unexpected reply to {request}"));
        BridgeError::Protocol { request, response }
    }

    fn track(&self, handle: RemoteHandle) -> RemoteHandle {
        self.lock().live.insert(handle);
        handle
    }

    pub fn allocate(&self, dtype: DType, shape: &Shape) -> Result<RemoteHandle, BridgeError> {
        match self.request(Request::Allocate {
            dtype,
            shape: shape.clone(),
        })? {
            Response::Allocated { handle } => Ok(self.track(handle)),
            other => Err(self.unexpected("allocate", other)),
        }
    }

    pub fn upload(&self, handle: RemoteHandle, payload: Payload) -> Result<(), BridgeError> {
        match self.request(Request::Upload { handle, payload })? {
            Response::Done => Ok(()),
            other => Err(self.unexpected("upload", other)),
        }
    }

    pub fn dispatch(
        &self,
        op: Opcode,
        dtype: DType,
        shape: &Shape,
        operands: Vec<RemoteOperand>,
    ) -> Result<RemoteHandle, BridgeError> {
        match self.request(Request::Dispatch {
            op,
            dtype,
            shape: shape.clone(),
            operands,
        })? {
            Response::Allocated { handle } => Ok(self.track(handle)),
            other => Err(self.unexpected("dispatch", other)),
        }
    }

    /// Sends `steps` as one request. Returns the allocations of the steps that completed and
    /// the failure that stopped the rest, if any.
    pub fn dispatch_batch(
        &self,
        dtype: DType,
        steps: Vec<BatchStep>,
    ) -> Result<(Vec<RemoteHandle>, Option<BatchFailure>), BridgeError> {
        match self.request(Request::Batch { dtype, steps })? {
            Response::Batched { handles, failure } => {
                self.lock().live.extend(handles.iter().copied());
                Ok((handles, failure))
            }
            other => Err(self.unexpected("batch", other)),
        }
    }

    pub fn fetch(&self, handle: RemoteHandle) -> Result<Payload, BridgeError> {
        match self.request(Request::Fetch { handle })? {
            Response::Data { payload } => Ok(payload),
            other => Err(self.unexpected("fetch", other)),
        }
    }

    pub fn read_element(&self, handle: RemoteHandle, offset: usize) -> Result<u64, BridgeError> {
        match self.request(Request::ReadElement { handle, offset })? {
            Response::Element { bits } => Ok(bits),
            other => Err(self.unexpected("read_element", other)),
        }
    }

    pub fn write_element(
        &self,
        handle: RemoteHandle,
        offset: usize,
        bits: u64,
    ) -> Result<(), BridgeError> {
        match self.request(Request::WriteElement {
            handle,
            offset,
            bits,
        })? {
            Response::Done => Ok(()),
            other => Err(self.unexpected("write_element", other)),
        }
    }

    /// Frees an engine allocation. A no-op once the bridge is unavailable.
    pub fn release(&self, handle: RemoteHandle) -> Result<(), BridgeError> {
        if !self.lock().live.remove(&handle) {
            return Ok(());
        }
        match self.request(Request::Release { handle }) {
            Ok(Response::Done) | Err(BridgeError::Unavailable) => Ok(()),
            Ok(other) => Err(self.unexpected("release", other)),
            Err(err) => Err(err),
        }
    }

    /// Asks the engine to exit and closes the link. The bridge ends up unavailable.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.state == BridgeState::Unavailable {
            return;
        }
        let timeout = inner.config.handshake_timeout();
        if let Some(link) = inner.link.as_mut() {
            if let Err(err) = link.round_trip(&Request::Shutdown, timeout) {
                log::debug!("engine shutdown request failed: {err}");
            }
            link.close();
        }
        inner.link = None;
        inner.live.clear();
        inner.state = BridgeState::Unavailable;
        log::info!("vector engine bridge {} shut down", self.id);
    }
}

fn launch(env: &BridgeEnv) -> Result<(BridgeConfig, Box<dyn Transport>), ActivationError> {
    let path = env
        .config_path
        .as_deref()
        .ok_or(ActivationError::MissingConfig)?;
    let config = BridgeConfig::load(path)?;
    let program =
        env.locate_engine(&config.engine)
            .ok_or_else(|| ActivationError::EngineNotFound {
                engine: config.engine.clone(),
                searched: env.search_path.len(),
            })?;
    log::debug!("starting vector engine {}", program.display());
    let transport =
        ProcessTransport::spawn(&program, &config.args).map_err(|err| ActivationError::Spawn {
            path: program.clone(),
            reason: err.to_string(),
        })?;
    Ok((config, Box::new(transport)))
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.state() == BridgeState::Active {
            self.shutdown();
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Bridge")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("engine", &inner.engine)
            .field("live", &inner.live.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Element;
    use crate::vem::transport::LoopbackTransport;

    #[test]
    fn loopback_bridge_round_trips_data() {
        let bridge =
            Bridge::connect(BridgeConfig::default(), Box::new(LoopbackTransport::default()))
                .unwrap();
        assert_eq!(bridge.state(), BridgeState::Active);
        let handle = bridge.allocate(DType::F32, &Shape::new([2])).unwrap();
        bridge.upload(handle, Payload::encode(&[1.5f32, -2.0])).unwrap();
        bridge
            .write_element(handle, 1, Element::to_bits(4.0f32))
            .unwrap();
        let values = bridge.fetch(handle).unwrap().decode::<f32>().unwrap();
        assert_eq!(values, vec![1.5, 4.0]);
        assert_eq!(bridge.live_handles(), 1);
        bridge.release(handle).unwrap();
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn activation_is_one_shot() {
        let bridge = Bridge::new();
        let err = bridge.activate(&BridgeEnv::default()).unwrap_err();
        assert!(matches!(err, ActivationError::MissingConfig));
        assert_eq!(bridge.state(), BridgeState::Unavailable);
        assert!(matches!(
            bridge.activate(&BridgeEnv::default()),
            Err(ActivationError::InvalidState(BridgeState::Unavailable))
        ));
        assert!(matches!(
            bridge.allocate(DType::I32, &Shape::new([1])),
            Err(BridgeError::Unavailable)
        ));
    }

    #[test]
    fn batched_results_are_tracked_as_live() {
        use crate::array::{Layout, Opcode};
        use crate::vem::protocol::{BatchOperand, BatchSource};

        let bridge =
            Bridge::connect(BridgeConfig::default(), Box::new(LoopbackTransport::default()))
                .unwrap();
        let input = bridge.allocate(DType::I64, &Shape::new([2])).unwrap();
        bridge.upload(input, Payload::encode(&[3i64, -4])).unwrap();
        let layout = Layout::contiguous(Shape::new([2]));
        let steps = vec![
            BatchStep {
                op: Opcode::Absolute,
                shape: Shape::new([2]),
                operands: vec![BatchOperand {
                    source: BatchSource::Handle(input),
                    layout: layout.clone(),
                }],
            },
            BatchStep {
                op: Opcode::Multiply,
                shape: Shape::new([2]),
                operands: vec![
                    BatchOperand {
                        source: BatchSource::Step(0),
                        layout: layout.clone(),
                    },
                    BatchOperand {
                        source: BatchSource::Handle(input),
                        layout,
                    },
                ],
            },
        ];
        let (handles, failure) = bridge.dispatch_batch(DType::I64, steps).unwrap();
        assert!(failure.is_none());
        assert_eq!(handles.len(), 2);
        assert_eq!(bridge.live_handles(), 3);
        let values = bridge.fetch(handles[1]).unwrap().decode::<i64>().unwrap();
        assert_eq!(values, vec![9, -16]);
    }

    #[test]
    fn engine_errors_keep_the_bridge_active() {
        let bridge =
            Bridge::connect(BridgeConfig::default(), Box::new(LoopbackTransport::default()))
                .unwrap();
        let err = bridge.fetch(RemoteHandle(404)).unwrap_err();
        assert!(!err.is_fault());
        assert!(bridge.is_active());
        bridge.shutdown();
        assert_eq!(bridge.state(), BridgeState::Unavailable);
    }
}
