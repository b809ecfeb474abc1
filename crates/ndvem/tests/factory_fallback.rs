use std::env;
use std::sync::Arc;

use anyhow::Result;
use ndvem::accessor::{unsafe_supported, UnsafeAccessor};
use ndvem::array::StorageBuffer;
use ndvem::{
    AccessorKind, ArrayContext, ArrayError, DirectAccessorFactory, LazyAccessorFactory, NdArray,
    Settings, UnsafeAccessorFactory,
};
use serial_test::serial;

const DISABLE_UNSAFE: &str = "NDVEM_DISABLE_UNSAFE";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn expected_unsafe_kind() -> AccessorKind {
    if unsafe_supported() {
        AccessorKind::Unsafe
    } else {
        AccessorKind::Direct
    }
}

#[test]
fn disabled_unsafe_falls_back_to_direct() -> Result<()> {
    init_logging();
    let settings = Settings::default().with_unsafe_disabled(true);
    let ctx = ArrayContext::<f64>::new(UnsafeAccessorFactory).with_settings(settings);
    let array = NdArray::<f64>::arange(&ctx, [2, 3]);
    assert_eq!(array.kind(), AccessorKind::Direct);
    assert_eq!(array.transpose().get(&[2, 1])?, 5.0);

    let refused = UnsafeAccessor::new(Arc::new(StorageBuffer::<f64>::zeroed(4)), &settings);
    assert!(matches!(refused, Err(ArrayError::Unsupported(_))));
    Ok(())
}

#[test]
fn enabled_unsafe_builds_raw_accessors() -> Result<()> {
    init_logging();
    let ctx = ArrayContext::<i32>::new(UnsafeAccessorFactory).with_settings(Settings::default());
    let array = NdArray::from_vec(&ctx, [2, 2], vec![1, 2, 3, 4])?;
    assert_eq!(array.kind(), expected_unsafe_kind());
    let doubled = array.add(&array)?;
    assert_eq!(doubled.kind(), expected_unsafe_kind());
    assert_eq!(doubled.to_vec()?, vec![2, 4, 6, 8]);
    Ok(())
}

#[test]
#[serial]
fn environment_toggle_disables_unsafe() -> Result<()> {
    init_logging();
    env::set_var(DISABLE_UNSAFE, "yes");
    let disabled = ArrayContext::<f32>::new(UnsafeAccessorFactory);
    env::set_var(DISABLE_UNSAFE, "0");
    let enabled = ArrayContext::<f32>::new(UnsafeAccessorFactory);
    env::remove_var(DISABLE_UNSAFE);

    assert!(disabled.settings().unsafe_disabled);
    assert!(!enabled.settings().unsafe_disabled);
    assert_eq!(NdArray::<f32>::zeros(&disabled, [3]).kind(), AccessorKind::Direct);
    assert_eq!(NdArray::<f32>::zeros(&enabled, [3]).kind(), expected_unsafe_kind());
    Ok(())
}

#[test]
fn switching_factories_keeps_existing_arrays() -> Result<()> {
    init_logging();
    let mut ctx = ArrayContext::<f64>::direct().with_settings(Settings::default());
    let before = NdArray::from_vec(&ctx, [3], vec![1.0, 2.0, 3.0])?;

    ctx.set_active(UnsafeAccessorFactory);
    assert_eq!(ctx.active().name(), "unsafe");
    let after = NdArray::from_vec(&ctx, [3], vec![4.0, 5.0, 6.0])?;
    assert_eq!(before.kind(), AccessorKind::Direct);
    assert_eq!(after.kind(), expected_unsafe_kind());

    // Mixed operands: the left-hand accessor decides where the result lives.
    let sum = before.add(&after)?;
    assert_eq!(sum.kind(), AccessorKind::Direct);
    assert_eq!(sum.to_vec()?, vec![5.0, 7.0, 9.0]);
    assert_eq!(after.mul(&before)?.kind(), expected_unsafe_kind());

    ctx.set_active(LazyAccessorFactory::direct());
    let lazy = NdArray::from_vec(&ctx, [3], vec![1.0, 1.0, 1.0])?;
    let mixed = lazy.sub(&before)?;
    assert_eq!(mixed.kind(), AccessorKind::Lazy);
    assert_eq!(mixed.to_vec()?, vec![0.0, -1.0, -2.0]);
    Ok(())
}

#[test]
#[serial]
fn global_contexts_are_per_element_type() -> Result<()> {
    init_logging();
    assert_eq!(ArrayContext::<i64>::global().active().name(), "direct");

    ArrayContext::<i64>::set_global_factory(Arc::new(LazyAccessorFactory::direct()));
    let lazy = NdArray::from_vec(&ArrayContext::global(), [2], vec![3i64, 4])?;
    assert_eq!(lazy.kind(), AccessorKind::Lazy);
    assert_eq!(ArrayContext::<f32>::global().active().name(), "direct");

    ArrayContext::set_global(
        ArrayContext::<i64>::new(UnsafeAccessorFactory)
            .with_settings(Settings::default().with_unsafe_disabled(true)),
    );
    let global = ArrayContext::<i64>::global();
    assert!(global.settings().unsafe_disabled);
    assert_eq!(NdArray::<i64>::zeros(&global, [2]).kind(), AccessorKind::Direct);

    // Arrays built earlier keep their own accessors.
    assert_eq!(lazy.neg()?.to_vec()?, vec![-3, -4]);

    ArrayContext::<i64>::set_global(ArrayContext::new(DirectAccessorFactory));
    Ok(())
}
