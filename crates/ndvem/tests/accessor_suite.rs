use std::sync::Arc;

use ndvem::lazy::EvalMode;
use ndvem::vem::{Bridge, BridgeConfig, LoopbackTransport};
use ndvem::{
    ArrayContext, DirectAccessorFactory, Element, LazyAccessorFactory, RemoteAccessorFactory,
    Settings, UnsafeAccessorFactory,
};

fn direct_ctx<T: Element>() -> ArrayContext<T> {
    ArrayContext::new(DirectAccessorFactory).with_settings(Settings::default())
}

fn unsafe_ctx<T: Element>() -> ArrayContext<T> {
    ArrayContext::new(UnsafeAccessorFactory).with_settings(Settings::default())
}

fn lazy_ctx<T: Element>() -> ArrayContext<T> {
    let factory = LazyAccessorFactory::with_mode(Arc::new(DirectAccessorFactory), EvalMode::Deferred);
    ArrayContext::new(factory).with_settings(Settings::default())
}

fn eager_lazy_ctx<T: Element>() -> ArrayContext<T> {
    let factory = LazyAccessorFactory::with_mode(Arc::new(DirectAccessorFactory), EvalMode::Eager);
    ArrayContext::new(factory).with_settings(Settings::default())
}

fn lazy_over_unsafe_ctx<T: Element>() -> ArrayContext<T> {
    let factory = LazyAccessorFactory::with_mode(Arc::new(UnsafeAccessorFactory), EvalMode::Deferred);
    ArrayContext::new(factory).with_settings(Settings::default())
}

fn remote_ctx<T: Element>() -> ArrayContext<T> {
    let bridge = Bridge::connect(
        BridgeConfig::default(),
        Box::new(LoopbackTransport::default()),
    )
    .expect("loopback bridge activates");
    let factory = RemoteAccessorFactory::with_bridge(bridge, Arc::new(DirectAccessorFactory));
    ArrayContext::new(factory).with_settings(Settings::default())
}

ndvem_accessor_tests::define_accessor_tests!(direct, direct_ctx);
ndvem_accessor_tests::define_accessor_tests!(unchecked, unsafe_ctx);
ndvem_accessor_tests::define_accessor_tests!(lazy_deferred, lazy_ctx);
ndvem_accessor_tests::define_accessor_tests!(lazy_eager, eager_lazy_ctx);
ndvem_accessor_tests::define_accessor_tests!(lazy_over_unchecked, lazy_over_unsafe_ctx);
ndvem_accessor_tests::define_accessor_tests!(remote_loopback, remote_ctx);
