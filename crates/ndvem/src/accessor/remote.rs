use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smallvec::SmallVec;

use crate::array::{Element, Layout, Opcode, Shape, StorageBuffer};
use crate::error::{ArrayError, ArrayResult};
use crate::vem::{
    BatchOperand, BatchSource, BatchStep, Bridge, BridgeError, FaultPolicy, Payload,
    RemoteBinding, RemoteHandle, RemoteOperand,
};

use super::{
    Accessor, AccessorKind, Capability, DirectAccessor, Operand, PlanInput, PlanOutcome, PlanStep,
};

enum Backing<T: Element> {
    Remote(RemoteHandle),
    /// Rebuilt from the shadow copy after a bridge fault.
    Local(Arc<dyn Accessor<T>>),
    /// Faulted with nothing to fall back to.
    Lost(String),
}

enum Staged<T: Element> {
    Bound(RemoteHandle),
    Host(Arc<StorageBuffer<T>>),
}

/// Accessor whose elements live in an allocation of the external engine.
///
/// The accessor owns its [`RemoteHandle`] and releases it on drop. Whenever data crosses to the
/// host it keeps a shadow copy, which the `rematerialize` fault policy uses to continue locally
/// once the bridge has failed.
pub struct RemoteAccessor<T: Element> {
    bridge: Arc<Bridge>,
    len: usize,
    policy: FaultPolicy,
    backing: Mutex<Backing<T>>,
    shadow: Mutex<Option<Arc<StorageBuffer<T>>>>,
}

fn bridge_error(err: BridgeError) -> ArrayError {
    match err {
        BridgeError::Engine(source) => ArrayError::eager(source),
        fault => ArrayError::backend(fault.to_string()),
    }
}

impl<T: Element> RemoteAccessor<T> {
    fn bound(
        bridge: Arc<Bridge>,
        handle: RemoteHandle,
        len: usize,
        shadow: Option<Arc<StorageBuffer<T>>>,
    ) -> Self {
        let policy = bridge.fault_policy();
        RemoteAccessor {
            bridge,
            len,
            policy,
            backing: Mutex::new(Backing::Remote(handle)),
            shadow: Mutex::new(shadow),
        }
    }

    /// Allocates a zero-filled array of `shape` inside the engine.
    pub fn allocate(bridge: Arc<Bridge>, shape: &Shape) -> ArrayResult<Self> {
        let handle = bridge.allocate(T::DTYPE, shape).map_err(bridge_error)?;
        Ok(Self::bound(bridge, handle, shape.num_elements(), None))
    }

    /// Copies row-major host data of `shape` into a new engine allocation.
    pub fn upload(bridge: Arc<Bridge>, shape: &Shape, data: Vec<T>) -> ArrayResult<Self> {
        if data.len() != shape.num_elements() {
            return Err(ArrayError::shape(format!(
                "{} values can not fill shape {shape}",
                data.len()
            )));
        }
        let handle = bridge.allocate(T::DTYPE, shape).map_err(bridge_error)?;
        let payload = Payload::encode(&data);
        if let Err(err) = bridge.upload(handle, payload) {
            let _ = bridge.release(handle);
            return Err(bridge_error(err));
        }
        let shadow = Arc::new(StorageBuffer::from_vec(data));
        Ok(Self::bound(bridge, handle, shape.num_elements(), Some(shadow)))
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    /// Engine handle while the accessor is still bound to the engine.
    pub fn handle(&self) -> Option<RemoteHandle> {
        match &*self.backing() {
            Backing::Remote(handle) => Some(*handle),
            _ => None,
        }
    }

    fn backing(&self) -> MutexGuard<'_, Backing<T>> {
        self.backing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shadow(&self) -> MutexGuard<'_, Option<Arc<StorageBuffer<T>>>> {
        self.shadow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current route for a call: the engine handle, or the local replacement.
    fn route(&self) -> ArrayResult<Result<RemoteHandle, Arc<dyn Accessor<T>>>> {
        match &*self.backing() {
            Backing::Remote(handle) => Ok(Ok(*handle)),
            Backing::Local(accessor) => Ok(Err(Arc::clone(accessor))),
            Backing::Lost(reason) => Err(ArrayError::backend(reason.clone())),
        }
    }

    /// Applies the fault policy. Returns the local accessor to continue with, if any.
    fn on_fault(&self, fault: BridgeError) -> ArrayResult<Arc<dyn Accessor<T>>> {
        let mut backing = self.backing();
        match &*backing {
            Backing::Local(accessor) => return Ok(Arc::clone(accessor)),
            Backing::Lost(reason) => return Err(ArrayError::backend(reason.clone())),
            Backing::Remote(_) => {}
        }
        let reason = fault.to_string();
        let shadow = self.shadow().clone();
        match (self.policy, shadow) {
            (FaultPolicy::Rematerialize, Some(buffer)) => {
                log::info!(
                    "rematerialising {} remote elements locally after fault: {reason}",
                    self.len
                );
                let local: Arc<dyn Accessor<T>> = Arc::new(DirectAccessor::new(buffer));
                *backing = Backing::Local(Arc::clone(&local));
                Ok(local)
            }
            _ => {
                *backing = Backing::Lost(reason.clone());
                Err(ArrayError::backend(reason))
            }
        }
    }

    fn check_offset(&self, layout: &Layout, index: &[usize]) -> ArrayResult<usize> {
        let offset = layout.checked_offset(index)?;
        if offset >= self.len {
            return Err(layout.index_error(index));
        }
        Ok(offset)
    }

    fn stage(&self, operands: &[Operand<'_, T>]) -> ArrayResult<SmallVec<[Staged<T>; 2]>> {
        operands
            .iter()
            .map(|operand| match operand.accessor.remote_binding() {
                Some(binding) if binding.bridge == self.bridge.id() => {
                    Ok(Staged::Bound(binding.handle))
                }
                _ => operand.accessor.evaluate().map(Staged::Host),
            })
            .collect()
    }

    fn dispatch(
        &self,
        op: Opcode,
        shape: &Shape,
        operands: &[Operand<'_, T>],
        staged: &[Staged<T>],
    ) -> Result<RemoteHandle, BridgeError> {
        let mut temps: SmallVec<[RemoteHandle; 2]> = SmallVec::new();
        let mut upload_all = || -> Result<Vec<RemoteOperand>, BridgeError> {
            let mut wire = Vec::with_capacity(staged.len());
            for (staged, operand) in staged.iter().zip(operands) {
                let handle = match staged {
                    Staged::Bound(handle) => *handle,
                    Staged::Host(buffer) => {
                        let data = buffer.to_vec();
                        let handle = self
                            .bridge
                            .allocate(T::DTYPE, &Shape::new([data.len()]))?;
                        temps.push(handle);
                        self.bridge.upload(handle, Payload::encode(&data))?;
                        handle
                    }
                };
                wire.push(RemoteOperand {
                    handle,
                    layout: operand.layout.clone(),
                });
            }
            Ok(wire)
        };
        let result = upload_all()
            .and_then(|wire| self.bridge.dispatch(op, T::DTYPE, shape, wire));
        for handle in temps {
            let _ = self.bridge.release(handle);
        }
        result
    }

    /// Wire form of a plan whose ready inputs all live in this accessor's engine.
    fn wire_plan(&self, steps: &[PlanStep<T>]) -> Option<Vec<BatchStep>> {
        steps
            .iter()
            .map(|step| {
                let operands = step
                    .inputs
                    .iter()
                    .map(|input| match input {
                        PlanInput::Step { index, layout } => Some(BatchOperand {
                            source: BatchSource::Step(*index),
                            layout: layout.clone(),
                        }),
                        PlanInput::Ready { accessor, layout } => {
                            let binding = accessor.remote_binding()?;
                            (binding.bridge == self.bridge.id()).then(|| BatchOperand {
                                source: BatchSource::Handle(binding.handle),
                                layout: layout.clone(),
                            })
                        }
                    })
                    .collect::<Option<Vec<_>>>()?;
                Some(BatchStep {
                    op: step.op,
                    shape: step.shape.clone(),
                    operands,
                })
            })
            .collect()
    }
}

impl<T: Element> Accessor<T> for RemoteAccessor<T> {
    fn kind(&self) -> AccessorKind {
        AccessorKind::Remote
    }

    fn supports(&self, capability: Capability) -> bool {
        capability == Capability::Remote && matches!(&*self.backing(), Backing::Remote(_))
    }

    fn get(&self, layout: &Layout, index: &[usize]) -> ArrayResult<T> {
        let offset = self.check_offset(layout, index)?;
        let handle = match self.route()? {
            Ok(handle) => handle,
            Err(local) => return local.get(layout, index),
        };
        match self.bridge.read_element(handle, offset) {
            Ok(bits) => Ok(T::from_bits(bits)),
            Err(BridgeError::Engine(source)) => Err(ArrayError::eager(source)),
            Err(fault) => self.on_fault(fault)?.get(layout, index),
        }
    }

    fn set(&self, layout: &Layout, index: &[usize], value: T) -> ArrayResult<()> {
        let offset = self.check_offset(layout, index)?;
        let handle = match self.route()? {
            Ok(handle) => handle,
            Err(local) => return local.set(layout, index, value),
        };
        match self.bridge.write_element(handle, offset, value.to_bits()) {
            Ok(()) => {
                if let Some(shadow) = &*self.shadow() {
                    shadow.set(offset, value);
                }
                Ok(())
            }
            Err(BridgeError::Engine(source)) => Err(ArrayError::eager(source)),
            Err(fault) => self.on_fault(fault)?.set(layout, index, value),
        }
    }

    fn evaluate(&self) -> ArrayResult<Arc<StorageBuffer<T>>> {
        let handle = match self.route()? {
            Ok(handle) => handle,
            Err(local) => return local.evaluate(),
        };
        match self.bridge.fetch(handle) {
            Ok(payload) => {
                let data = payload.decode::<T>().map_err(ArrayError::eager)?;
                // The caller may write into the returned buffer; the shadow must only follow
                // the engine.
                *self.shadow() = Some(Arc::new(StorageBuffer::from_vec(data.clone())));
                Ok(Arc::new(StorageBuffer::from_vec(data)))
            }
            Err(BridgeError::Engine(source)) => Err(ArrayError::eager(source)),
            Err(fault) => self.on_fault(fault)?.evaluate(),
        }
    }

    fn apply(
        &self,
        op: Opcode,
        shape: &Shape,
        operands: &[Operand<'_, T>],
    ) -> ArrayResult<Arc<dyn Accessor<T>>> {
        if let Err(local) = self.route()? {
            return local.apply(op, shape, operands);
        }
        let staged = self.stage(operands)?;
        match self.dispatch(op, shape, operands, &staged) {
            Ok(handle) => Ok(Arc::new(RemoteAccessor::<T>::bound(
                Arc::clone(&self.bridge),
                handle,
                shape.num_elements(),
                None,
            ))),
            Err(BridgeError::Engine(source)) => Err(ArrayError::eager(source)),
            Err(fault) => self.on_fault(fault)?.apply(op, shape, operands),
        }
    }

    fn apply_plan(&self, steps: &[PlanStep<T>]) -> Option<PlanOutcome<T>> {
        self.handle()?;
        let wire = self.wire_plan(steps)?;
        match self.bridge.dispatch_batch(T::DTYPE, wire) {
            Ok((handles, failure)) => {
                let results = handles
                    .into_iter()
                    .zip(steps)
                    .map(|(handle, step)| {
                        Arc::new(RemoteAccessor::<T>::bound(
                            Arc::clone(&self.bridge),
                            handle,
                            step.shape.num_elements(),
                            None,
                        )) as Arc<dyn Accessor<T>>
                    })
                    .collect();
                let failure =
                    failure.map(|failure| (failure.step, ArrayError::eager(failure.error)));
                Some(PlanOutcome { results, failure })
            }
            Err(err) => {
                log::debug!("batched dispatch of {} steps declined: {err}", steps.len());
                None
            }
        }
    }

    fn remote_binding(&self) -> Option<RemoteBinding> {
        self.handle().map(|handle| RemoteBinding {
            bridge: self.bridge.id(),
            handle,
        })
    }
}

impl<T: Element> Drop for RemoteAccessor<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle() {
            if let Err(err) = self.bridge.release(handle) {
                log::debug!("failed to release remote handle {}: {err}", handle.0);
            }
        }
    }
}

impl<T: Element> fmt::Debug for RemoteAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &*self.backing() {
            Backing::Remote(handle) => format!("remote({})", handle.0),
            Backing::Local(_) => "local".to_string(),
            Backing::Lost(_) => "lost".to_string(),
        };
        f.debug_struct("RemoteAccessor")
            .field("bridge", &self.bridge.id())
            .field("len", &self.len)
            .field("policy", &self.policy)
            .field("backing", &backing)
            .finish()
    }
}
