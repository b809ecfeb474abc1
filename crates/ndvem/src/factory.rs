//! Accessor factories and the context that selects one for new arrays.
//!
//! An [`ArrayContext`] pairs the active [`AccessorFactory`] with the [`Settings`] consulted while
//! constructing accessors. Changing either requires `&mut`, so a context shared by reference can
//! not have its factory swapped underneath a concurrent `create`. Existing arrays keep the
//! accessor they were built with.
//!
//! Construction never fails for the caller: a factory that can not build its preferred accessor
//! substitutes a weaker one and logs why.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::accessor::{Accessor, DirectAccessor, LazyAccessor, RemoteAccessor, UnsafeAccessor};
use crate::array::{Element, Shape, StorageBuffer};
use crate::lazy::{EvalMode, LazyGraph};
use crate::vem::{self, Bridge, BridgeEnv};

/// Knobs read while constructing accessors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    /// Refuse raw-memory accessors; factories fall back to checked ones.
    pub unsafe_disabled: bool,
}

impl Settings {
    /// Seeds the toggle from `NDVEM_DISABLE_UNSAFE`.
    pub fn from_env() -> Self {
        Settings {
            unsafe_disabled: crate::env::unsafe_disabled(),
        }
    }

    pub fn with_unsafe_disabled(mut self, disabled: bool) -> Self {
        self.unsafe_disabled = disabled;
        self
    }
}

/// Strategy that decides which accessor backs newly created arrays.
pub trait AccessorFactory<T: Element>: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Zero-filled contiguous storage for `shape`.
    fn create(&self, shape: &Shape, settings: &Settings) -> Arc<dyn Accessor<T>>;

    /// Storage of `shape` initialised from host data laid out row-major.
    ///
    /// `data` holds exactly `shape.num_elements()` values.
    fn wrap(&self, shape: &Shape, data: Vec<T>, settings: &Settings) -> Arc<dyn Accessor<T>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectAccessorFactory;

impl<T: Element> AccessorFactory<T> for DirectAccessorFactory {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn create(&self, shape: &Shape, _settings: &Settings) -> Arc<dyn Accessor<T>> {
        Arc::new(DirectAccessor::zeroed(shape))
    }

    fn wrap(&self, _shape: &Shape, data: Vec<T>, _settings: &Settings) -> Arc<dyn Accessor<T>> {
        Arc::new(DirectAccessor::from_vec(data))
    }
}

/// Prefers raw-memory accessors and falls back to Direct when they are unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsafeAccessorFactory;

impl UnsafeAccessorFactory {
    fn build<T: Element>(buffer: Arc<StorageBuffer<T>>, settings: &Settings) -> Arc<dyn Accessor<T>> {
        match UnsafeAccessor::new(Arc::clone(&buffer), settings) {
            Ok(accessor) => Arc::new(accessor),
            Err(err) => {
                log::debug!("using direct accessor: {err}");
                Arc::new(DirectAccessor::new(buffer))
            }
        }
    }
}

impl<T: Element> AccessorFactory<T> for UnsafeAccessorFactory {
    fn name(&self) -> &'static str {
        "unsafe"
    }

    fn create(&self, shape: &Shape, settings: &Settings) -> Arc<dyn Accessor<T>> {
        Self::build(
            Arc::new(StorageBuffer::zeroed(shape.num_elements())),
            settings,
        )
    }

    fn wrap(&self, _shape: &Shape, data: Vec<T>, settings: &Settings) -> Arc<dyn Accessor<T>> {
        Self::build(Arc::new(StorageBuffer::from_vec(data)), settings)
    }
}

/// Builds lazy accessors whose leaves come from `target`.
///
/// Every array created by one factory shares one [`LazyGraph`].
pub struct LazyAccessorFactory<T: Element> {
    target: Arc<dyn AccessorFactory<T>>,
    graph: Arc<LazyGraph<T>>,
}

impl<T: Element> LazyAccessorFactory<T> {
    pub fn new(target: Arc<dyn AccessorFactory<T>>) -> Self {
        Self::with_mode(target, EvalMode::from_env())
    }

    pub fn with_mode(target: Arc<dyn AccessorFactory<T>>, mode: EvalMode) -> Self {
        LazyAccessorFactory {
            target,
            graph: LazyGraph::with_mode(mode),
        }
    }

    /// Lazy evaluation over checked Direct storage.
    pub fn direct() -> Self {
        Self::new(Arc::new(DirectAccessorFactory))
    }

    pub fn graph(&self) -> &Arc<LazyGraph<T>> {
        &self.graph
    }

    pub fn target(&self) -> &Arc<dyn AccessorFactory<T>> {
        &self.target
    }
}

impl<T: Element> AccessorFactory<T> for LazyAccessorFactory<T> {
    fn name(&self) -> &'static str {
        "lazy"
    }

    fn create(&self, shape: &Shape, settings: &Settings) -> Arc<dyn Accessor<T>> {
        let leaf = self.target.create(shape, settings);
        Arc::new(LazyAccessor::new(self.graph.leaf(leaf, shape.clone())))
    }

    fn wrap(&self, shape: &Shape, data: Vec<T>, settings: &Settings) -> Arc<dyn Accessor<T>> {
        let leaf = self.target.wrap(shape, data, settings);
        Arc::new(LazyAccessor::new(self.graph.leaf(leaf, shape.clone())))
    }
}

impl<T: Element> fmt::Debug for LazyAccessorFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyAccessorFactory")
            .field("target", &self.target.name())
            .field("graph", &self.graph.id())
            .finish()
    }
}

/// Places arrays in the external engine while its bridge is active, otherwise uses `fallback`.
pub struct RemoteAccessorFactory<T: Element> {
    bridge: Option<Arc<Bridge>>,
    fallback: Arc<dyn AccessorFactory<T>>,
}

impl<T: Element> RemoteAccessorFactory<T> {
    /// Activates a bridge from `env`. Activation failures are logged and leave the factory
    /// serving `fallback`.
    pub fn activate(env: &BridgeEnv, fallback: Arc<dyn AccessorFactory<T>>) -> Self {
        let bridge = match vem::activate(env) {
            Ok(bridge) => Some(bridge),
            Err(err) => {
                log::warn!(
                    "remote arrays unavailable, using {} accessors: {err}",
                    fallback.name()
                );
                None
            }
        };
        RemoteAccessorFactory { bridge, fallback }
    }

    /// Reads the bridge environment from the process and falls back to Direct.
    pub fn from_env() -> Self {
        Self::activate(&BridgeEnv::from_env(), Arc::new(DirectAccessorFactory))
    }

    pub fn with_bridge(bridge: Arc<Bridge>, fallback: Arc<dyn AccessorFactory<T>>) -> Self {
        RemoteAccessorFactory {
            bridge: Some(bridge),
            fallback,
        }
    }

    pub fn bridge(&self) -> Option<&Arc<Bridge>> {
        self.bridge.as_ref()
    }

    /// `true` while new arrays are placed in the engine.
    pub fn is_remote(&self) -> bool {
        self.active_bridge().is_some()
    }

    fn active_bridge(&self) -> Option<&Arc<Bridge>> {
        self.bridge.as_ref().filter(|bridge| bridge.is_active())
    }
}

impl<T: Element> AccessorFactory<T> for RemoteAccessorFactory<T> {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn create(&self, shape: &Shape, settings: &Settings) -> Arc<dyn Accessor<T>> {
        if let Some(bridge) = self.active_bridge() {
            match RemoteAccessor::allocate(Arc::clone(bridge), shape) {
                Ok(accessor) => return Arc::new(accessor),
                Err(err) => log::warn!("remote allocation failed, using local storage: {err}"),
            }
        }
        self.fallback.create(shape, settings)
    }

    fn wrap(&self, shape: &Shape, data: Vec<T>, settings: &Settings) -> Arc<dyn Accessor<T>> {
        if let Some(bridge) = self.active_bridge() {
            match RemoteAccessor::upload(Arc::clone(bridge), shape, data.clone()) {
                Ok(accessor) => return Arc::new(accessor),
                Err(err) => log::warn!("remote upload failed, using local storage: {err}"),
            }
        }
        self.fallback.wrap(shape, data, settings)
    }
}

impl<T: Element> fmt::Debug for RemoteAccessorFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAccessorFactory")
            .field("bridge", &self.bridge)
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

/// Active factory plus construction settings for one element type.
pub struct ArrayContext<T: Element> {
    factory: Arc<dyn AccessorFactory<T>>,
    settings: Settings,
}

static GLOBAL_CONTEXTS: Lazy<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

impl<T: Element> ArrayContext<T> {
    /// Context using `factory` with settings read from the environment.
    pub fn new<F: AccessorFactory<T> + 'static>(factory: F) -> Self {
        Self::from_shared(Arc::new(factory))
    }

    pub fn from_shared(factory: Arc<dyn AccessorFactory<T>>) -> Self {
        ArrayContext {
            factory,
            settings: Settings::from_env(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn direct() -> Self {
        Self::new(DirectAccessorFactory)
    }

    /// Replaces the factory used by later `create`/`wrap` calls.
    pub fn set_active<F: AccessorFactory<T> + 'static>(&mut self, factory: F) {
        self.set_active_shared(Arc::new(factory));
    }

    pub fn set_active_shared(&mut self, factory: Arc<dyn AccessorFactory<T>>) {
        log::debug!(
            "{} arrays now use the {} factory",
            T::DTYPE,
            factory.name()
        );
        self.factory = factory;
    }

    pub fn active(&self) -> Arc<dyn AccessorFactory<T>> {
        Arc::clone(&self.factory)
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    pub fn create(&self, shape: &Shape) -> Arc<dyn Accessor<T>> {
        self.factory.create(shape, &self.settings)
    }

    pub fn wrap(&self, shape: &Shape, data: Vec<T>) -> Arc<dyn Accessor<T>> {
        self.factory.wrap(shape, data, &self.settings)
    }

    /// Snapshot of the process-wide context for `T`, Direct until replaced.
    pub fn global() -> Self {
        let contexts = GLOBAL_CONTEXTS
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        contexts
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<ArrayContext<T>>())
            .cloned()
            .unwrap_or_else(Self::direct)
    }

    pub fn set_global(context: ArrayContext<T>) {
        GLOBAL_CONTEXTS
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), Arc::new(context));
    }

    /// Replaces only the factory of the process-wide context for `T`.
    pub fn set_global_factory(factory: Arc<dyn AccessorFactory<T>>) {
        let mut context = Self::global();
        context.set_active_shared(factory);
        Self::set_global(context);
    }
}

impl<T: Element> Clone for ArrayContext<T> {
    fn clone(&self) -> Self {
        ArrayContext {
            factory: Arc::clone(&self.factory),
            settings: self.settings,
        }
    }
}

impl<T: Element> Default for ArrayContext<T> {
    fn default() -> Self {
        Self::direct()
    }
}

impl<T: Element> fmt::Debug for ArrayContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayContext")
            .field("factory", &self.factory.name())
            .field("settings", &self.settings)
            .finish()
    }
}
