use std::sync::Arc;

use anyhow::Result;
use ndvem::array::KernelError;
use ndvem::lazy::{EvalMode, LazyGraph, NodeId, NodeStatus};
use ndvem::{
    AccessorKind, ArrayContext, ArrayError, DirectAccessorFactory, Element, LazyAccessorFactory,
    NdArray, Settings, Shape,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn lazy_context<T: Element>(mode: EvalMode) -> (ArrayContext<T>, Arc<LazyGraph<T>>) {
    let factory = Arc::new(LazyAccessorFactory::with_mode(
        Arc::new(DirectAccessorFactory),
        mode,
    ));
    let graph = Arc::clone(factory.graph());
    let ctx = ArrayContext::from_shared(factory).with_settings(Settings::default());
    (ctx, graph)
}

fn node_of<T: Element>(array: &NdArray<T>) -> NodeId {
    array
        .accessor()
        .lazy_node()
        .map(|(_, id)| id)
        .expect("array is backed by a lazy node")
}

fn bits(values: &[f64]) -> Vec<u64> {
    values.iter().map(|v| v.to_bits()).collect()
}

#[test]
fn deferred_results_match_direct_evaluation() -> Result<()> {
    init_logging();
    let (lazy, _graph) = lazy_context::<f64>(EvalMode::Deferred);
    let direct = ArrayContext::<f64>::direct();
    let mut rng = StdRng::seed_from_u64(42);
    let a_values: Vec<f64> = (0..20).map(|_| rng.gen_range(-3.0..3.0)).collect();
    let b_values: Vec<f64> = (0..20).map(|_| rng.gen_range(0.5..4.0)).collect();

    let pipeline = |ctx: &ArrayContext<f64>| -> Result<Vec<f64>> {
        let a = NdArray::from_vec(ctx, [4, 5], a_values.clone())?;
        let b = NdArray::from_vec(ctx, [4, 5], b_values.clone())?;
        let bias = NdArray::from_vec(ctx, [5], vec![1.0, -1.0, 0.5, 0.25, 2.0])?;
        let out = a
            .mul(&b)?
            .add(&bias)?
            .div(&b.abs()?)?
            .minimum(&a.neg()?)?
            .transpose()
            .copy()?;
        Ok(out.to_vec()?)
    };

    assert_eq!(bits(&pipeline(&lazy)?), bits(&pipeline(&direct)?));
    Ok(())
}

#[test]
fn operations_are_recorded_until_observed() -> Result<()> {
    init_logging();
    let (ctx, graph) = lazy_context::<f64>(EvalMode::Deferred);
    let a = NdArray::<f64>::arange(&ctx, [2, 3]);
    let b = a.add(&a)?;
    let c = b.mul(&a)?;
    assert_eq!(c.kind(), AccessorKind::Lazy);
    assert_eq!(graph.status(node_of(&c)), NodeStatus::Pending);
    assert_eq!(graph.stats().evaluations, 0);

    assert_eq!(c.get(&[1, 2])?, 50.0);
    assert_eq!(graph.status(node_of(&c)), NodeStatus::Ready);
    assert_eq!(graph.stats().evaluations, 2);
    Ok(())
}

#[test]
fn leaves_record_the_array_shape() -> Result<()> {
    init_logging();
    let (ctx, graph) = lazy_context::<i32>(EvalMode::Deferred);
    let wrapped = NdArray::from_vec(&ctx, [2, 3], vec![1, 2, 3, 4, 5, 6])?;
    let filled = NdArray::full(&ctx, [3, 1], 7);
    let created = NdArray::<i32>::zeros(&ctx, [4, 2]);
    assert_eq!(graph.shape_of(node_of(&wrapped)), Some(Shape::new([2, 3])));
    assert_eq!(graph.shape_of(node_of(&filled)), Some(Shape::new([3, 1])));
    assert_eq!(graph.shape_of(node_of(&created)), Some(Shape::new([4, 2])));

    let row = NdArray::full(&ctx, [3], 1);
    let sum = wrapped.add(&row)?;
    assert_eq!(graph.shape_of(node_of(&sum)), Some(Shape::new([2, 3])));
    assert_eq!(sum.to_vec()?, vec![2, 3, 4, 5, 6, 7]);
    Ok(())
}

#[test]
fn materialisation_is_idempotent() -> Result<()> {
    init_logging();
    let (ctx, graph) = lazy_context::<f64>(EvalMode::Deferred);
    let a = NdArray::<f64>::arange(&ctx, [3, 3]);
    let b = a.add(&a)?.neg()?;
    let first = b.to_vec()?;
    let evaluations = graph.stats().evaluations;
    let second = b.to_vec()?;
    assert_eq!(first, second);
    assert_eq!(b.get(&[2, 2])?, -16.0);
    assert_eq!(graph.stats().evaluations, evaluations);
    Ok(())
}

#[test]
fn shared_subexpressions_are_evaluated_once() -> Result<()> {
    init_logging();
    let (ctx, graph) = lazy_context::<f64>(EvalMode::Deferred);
    let a = NdArray::<f64>::arange(&ctx, [4]);
    let b = NdArray::<f64>::full(&ctx, [4], 2.0);
    let shared = a.add(&b)?;
    let left = shared.mul(&shared)?;
    let right = shared.sub(&b)?;
    let joined = left.add(&right)?;

    assert_eq!(joined.to_vec()?, vec![4.0, 10.0, 18.0, 28.0]);
    // shared, left, right and joined.
    assert_eq!(graph.stats().evaluations, 4);
    assert_eq!(graph.status(node_of(&shared)), NodeStatus::Ready);
    Ok(())
}

#[test]
fn failures_name_the_node_and_spare_siblings() -> Result<()> {
    init_logging();
    let (ctx, graph) = lazy_context::<i32>(EvalMode::Deferred);
    let a = NdArray::from_vec(&ctx, [3], vec![6, 9, 12])?;
    let b = NdArray::from_vec(&ctx, [3], vec![3, 0, 4])?;
    let sum = a.add(&b)?;
    assert_eq!(sum.to_vec()?, vec![9, 9, 16]);
    let evaluations = graph.stats().evaluations;

    // Recording never evaluates, so the bad division is accepted here.
    let quotient = a.div(&b)?;
    let downstream = quotient.add(&sum)?;
    let err = downstream.to_vec().unwrap_err();
    match &err {
        ArrayError::Computation { node, source } => {
            assert_eq!(*node, Some(node_of(&quotient)));
            assert_eq!(*source, KernelError::DivisionByZero);
        }
        other => panic!("expected a computation error, got {other:?}"),
    }
    assert_eq!(graph.status(node_of(&quotient)), NodeStatus::Failed);
    assert_eq!(graph.status(node_of(&sum)), NodeStatus::Ready);

    // The failure is sticky and the cached sibling is reused as is.
    assert_eq!(quotient.get(&[0]).unwrap_err(), err);
    assert_eq!(sum.get(&[2])?, 16);
    assert_eq!(graph.stats().evaluations, evaluations);
    Ok(())
}

#[test]
fn eager_mode_surfaces_errors_at_the_call() -> Result<()> {
    init_logging();
    let (ctx, graph) = lazy_context::<i64>(EvalMode::Eager);
    let a = NdArray::from_vec(&ctx, [2], vec![4, 5])?;
    let b = NdArray::from_vec(&ctx, [2], vec![2, 0])?;
    let product = a.mul(&b)?;
    assert_eq!(graph.status(node_of(&product)), NodeStatus::Ready);
    let err = a.div(&b).unwrap_err();
    assert!(err.failed_node().is_some(), "{err:?}");
    Ok(())
}

#[test]
fn dropped_intermediates_are_collected() -> Result<()> {
    init_logging();
    let (ctx, graph) = lazy_context::<f64>(EvalMode::Deferred);
    let a = NdArray::<f64>::arange(&ctx, [2, 2]);
    let result = {
        let doubled = a.add(&a)?;
        let squared = doubled.mul(&doubled)?;
        squared.sub(&a)?
    };
    // Only `result` and `a` are referenced; pending intermediates stay reachable through it.
    assert_eq!(graph.collect(), 0);
    assert_eq!(result.to_vec()?, vec![0.0, 3.0, 14.0, 33.0]);

    let stats = graph.stats();
    assert_eq!(stats.collected, 2);
    assert_eq!(stats.ready, 2);
    assert_eq!(stats.pending, 0);
    assert_eq!(graph.collect(), 0);
    Ok(())
}

#[test]
fn long_running_loops_reuse_arena_slots() -> Result<()> {
    init_logging();
    let (ctx, graph) = lazy_context::<i64>(EvalMode::Deferred);
    let a = NdArray::from_vec(&ctx, [4], vec![1, 2, 3, 4])?;
    for _ in 0..10_000 {
        let doubled = a.add(&a)?;
        assert_eq!(doubled.get(&[3])?, 8);
    }
    graph.collect();

    let stats = graph.stats();
    assert!(stats.slots <= 3, "{stats:?}");
    assert_eq!(stats.nodes, 1);
    assert_eq!(stats.collected, 10_000);
    assert_eq!(stats.evaluations, 10_000);
    assert_eq!(a.to_vec()?, vec![1, 2, 3, 4]);
    Ok(())
}

#[test]
fn writes_reach_pending_dependents() -> Result<()> {
    init_logging();
    let (ctx, _graph) = lazy_context::<f64>(EvalMode::Deferred);
    let a = NdArray::<f64>::zeros(&ctx, [2, 2]);
    let shifted = a.add(&NdArray::full(&ctx, [2, 2], 1.0))?;
    a.transpose().set(&[1, 0], 5.0)?;
    assert_eq!(a.get(&[0, 1])?, 5.0);
    assert_eq!(shifted.to_vec()?, vec![1.0, 6.0, 1.0, 1.0]);
    Ok(())
}

#[test]
fn operands_from_other_graphs_are_imported() -> Result<()> {
    init_logging();
    let (left_ctx, left_graph) = lazy_context::<f32>(EvalMode::Deferred);
    let (right_ctx, right_graph) = lazy_context::<f32>(EvalMode::Deferred);
    let left = NdArray::<f32>::arange(&left_ctx, [3]);
    let right = NdArray::<f32>::full(&right_ctx, [3], 2.0).mul(&NdArray::full(&right_ctx, [3], 3.0))?;
    let direct = NdArray::from_vec(&ArrayContext::direct(), [3], vec![1.0f32, 1.0, 1.0])?;

    let sum = left.add(&right)?.add(&direct)?;
    assert!(Arc::ptr_eq(
        sum.accessor().lazy_node().map(|(graph, _)| graph).expect("lazy"),
        &left_graph
    ));
    assert_eq!(right_graph.stats().evaluations, 0);
    assert_eq!(sum.to_vec()?, vec![7.0, 8.0, 9.0]);
    assert_eq!(right_graph.stats().evaluations, 1);
    Ok(())
}
