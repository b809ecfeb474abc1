//! Behaviour every accessor strategy must share.
//!
//! Each check builds its arrays through the supplied context, so the same assertions run
//! against Direct, Unsafe, Lazy and Remote storage.

use ndvem::array::KernelError;
use ndvem::{ArrayContext, ArrayError, Element, NdArray, Opcode, Shape};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_values<T: Element>(rng: &mut StdRng, len: usize, low: f64, high: f64) -> Vec<T> {
    (0..len)
        .map(|_| T::from_f64(rng.gen_range(low..high)))
        .collect()
}

fn bits<T: Element>(values: &[T]) -> Vec<u64> {
    values.iter().map(|v| v.to_bits()).collect()
}

pub fn set_get_round_trip<T: Element>(ctx: &ArrayContext<T>) {
    let mut rng = StdRng::seed_from_u64(11);
    let array = NdArray::zeros(ctx, [3, 5]);
    let values: Vec<T> = random_values(&mut rng, 15, -100.0, 100.0);
    for (flat, value) in values.iter().enumerate() {
        array.set(&[flat / 5, flat % 5], *value).unwrap();
    }
    for (flat, value) in values.iter().enumerate() {
        let read = array.get(&[flat / 5, flat % 5]).unwrap();
        assert_eq!(read.to_bits(), value.to_bits(), "element {flat}");
    }
    assert_eq!(bits(&array.to_vec().unwrap()), bits(&values));
}

pub fn out_of_range_index_is_rejected<T: Element>(ctx: &ArrayContext<T>) {
    let array = NdArray::<T>::zeros(ctx, [3, 4]);
    assert!(matches!(
        array.get(&[3, 0]),
        Err(ArrayError::Index { .. })
    ));
    assert!(matches!(
        array.set(&[2, 4], T::one()),
        Err(ArrayError::Index { .. })
    ));
    assert!(matches!(array.get(&[1]), Err(ArrayError::Index { .. })));
    assert!(matches!(
        array.get(&[usize::MAX / 2, 0]),
        Err(ArrayError::Index { .. })
    ));
}

/// The (3, 4) arange example: the transpose is a (4, 3) view of the same storage.
pub fn transpose_is_a_view<T: Element>(ctx: &ArrayContext<T>) {
    let original = NdArray::<T>::arange(ctx, [3, 4]);
    let view = original.transpose();
    assert_eq!(view.shape().dims(), &[4, 3]);
    for i in 0..4 {
        for j in 0..3 {
            assert_eq!(view.get(&[i, j]).unwrap(), original.get(&[j, i]).unwrap());
        }
    }
    assert!(view.shares_storage(&original));
    assert_eq!(view.kind(), original.kind());
}

pub fn writes_through_views_are_shared<T: Element>(ctx: &ArrayContext<T>) {
    let base = NdArray::<T>::zeros(ctx, [2, 3]);
    let column = base.slice(1, 2, 3, 1).unwrap();
    let seven = T::from_f64(7.0);
    column.set(&[1, 0], seven).unwrap();
    assert_eq!(base.get(&[1, 2]).unwrap(), seven);
    assert_eq!(base.transpose().get(&[2, 1]).unwrap(), seven);
}

/// Every opcode agrees with the scalar definition on random operands.
pub fn elementwise_matches_scalar_reference<T: Element>(ctx: &ArrayContext<T>) {
    let mut rng = StdRng::seed_from_u64(7);
    let shape = Shape::new([2, 3, 4]);
    let a_values: Vec<T> = random_values(&mut rng, 24, -50.0, 50.0);
    // Strictly positive divisors keep integer division defined.
    let b_values: Vec<T> = random_values(&mut rng, 24, 1.0, 9.0);
    let a = NdArray::from_vec(ctx, shape.clone(), a_values.clone()).unwrap();
    let b = NdArray::from_vec(ctx, shape, b_values.clone()).unwrap();

    for op in Opcode::ALL {
        let (result, expected): (NdArray<T>, Vec<T>) = if op.arity() == 1 {
            let expected = a_values.iter().map(|&x| T::unary(op, x).unwrap()).collect();
            (a.apply(op, &[]).unwrap(), expected)
        } else {
            let expected = a_values
                .iter()
                .zip(&b_values)
                .map(|(&x, &y)| T::binary(op, x, y).unwrap())
                .collect();
            (a.apply(op, &[&b]).unwrap(), expected)
        };
        assert_eq!(result.shape().dims(), &[2, 3, 4], "{}", op.name());
        assert_eq!(
            bits(&result.to_vec().unwrap()),
            bits(&expected),
            "{}",
            op.name()
        );
    }
}

/// Runs every opcode over `lhs`/`rhs` in `ctx` and in a Direct context and compares result bits.
///
/// Operands are laid out as (2, n/2) and consumed through their transposes, so strided reads go
/// through the same path as contiguous ones.
fn edge_values_match_direct<T: Element>(ctx: &ArrayContext<T>, lhs: Vec<T>, rhs: Vec<T>) {
    assert_eq!(lhs.len(), rhs.len());
    assert_eq!(lhs.len() % 2, 0);
    let shape = Shape::new([2, lhs.len() / 2]);
    let direct = ArrayContext::<T>::direct();
    let run = |ctx: &ArrayContext<T>, op: Opcode| -> Vec<u64> {
        let a = NdArray::from_vec(ctx, shape.clone(), lhs.clone()).unwrap().transpose();
        let b = NdArray::from_vec(ctx, shape.clone(), rhs.clone()).unwrap().transpose();
        let others: Vec<&NdArray<T>> = if op.arity() == 1 { Vec::new() } else { vec![&b] };
        bits(&a.apply(op, &others).unwrap().to_vec().unwrap())
    };
    for op in Opcode::ALL {
        assert_eq!(run(ctx, op), run(&direct, op), "{}", op.name());
    }
}

/// Wrapping integer arithmetic: overflow, `MIN / -1` and `abs(MIN)`.
pub fn integer_edge_values_match_direct(ctx: &ArrayContext<i32>) {
    edge_values_match_direct(
        ctx,
        vec![i32::MAX, i32::MIN, i32::MIN, -1, 7, 0],
        vec![1, -1, i32::MAX, i32::MIN, -2, i32::MAX],
    );
    let a = NdArray::from_vec(ctx, [2], vec![i32::MAX, i32::MIN]).unwrap();
    let one = NdArray::from_vec(ctx, [2], vec![1, -1]).unwrap();
    assert_eq!(a.add(&one).unwrap().to_vec().unwrap(), vec![i32::MIN, i32::MAX]);
    assert_eq!(a.div(&one).unwrap().to_vec().unwrap(), vec![i32::MAX, i32::MIN]);
}

pub fn wide_integer_edge_values_match_direct(ctx: &ArrayContext<i64>) {
    edge_values_match_direct(
        ctx,
        vec![i64::MIN, i64::MAX, -1, i64::MIN],
        vec![-1, i64::MAX, i64::MIN, 3],
    );
    let min = NdArray::from_vec(ctx, [1], vec![i64::MIN]).unwrap();
    assert_eq!(min.abs().unwrap().to_vec().unwrap(), vec![i64::MIN]);
    assert_eq!(min.neg().unwrap().to_vec().unwrap(), vec![i64::MIN]);
}

/// NaN propagation, signed zeros, infinities and rounding.
pub fn float_edge_values_match_direct(ctx: &ArrayContext<f64>) {
    edge_values_match_direct(
        ctx,
        vec![f64::NAN, -0.0, 0.0, f64::INFINITY, f64::INFINITY, 0.1, 1.0, f64::MAX],
        vec![1.0, 0.0, -0.0, f64::INFINITY, 0.0, 0.2, f64::NAN, f64::MAX],
    );
    let a = NdArray::from_vec(ctx, [4], vec![f64::NAN, -0.0, 0.0, f64::INFINITY]).unwrap();
    let b = NdArray::from_vec(ctx, [4], vec![2.0, 0.0, -0.0, f64::INFINITY]).unwrap();
    let max = a.maximum(&b).unwrap().to_vec().unwrap();
    assert!(max[0].is_nan());
    assert_eq!(max[1].to_bits(), (-0.0f64).to_bits());
    let min = b.minimum(&a).unwrap().to_vec().unwrap();
    assert!(min[0].is_nan());
    assert_eq!(min[2].to_bits(), (-0.0f64).to_bits());
    let ratio = a.div(&b).unwrap().to_vec().unwrap();
    assert!(ratio[3].is_nan());
    let sum = NdArray::from_vec(ctx, [1], vec![0.1])
        .unwrap()
        .add(&NdArray::from_vec(ctx, [1], vec![0.2]).unwrap())
        .unwrap();
    assert_eq!(sum.get(&[0]).unwrap().to_bits(), (0.1f64 + 0.2).to_bits());
}

pub fn single_float_edge_values_match_direct(ctx: &ArrayContext<f32>) {
    edge_values_match_direct(
        ctx,
        vec![f32::NAN, -0.0, f32::MIN_POSITIVE, f32::MAX, 0.1, f32::NEG_INFINITY],
        vec![-0.0, f32::NAN, 3.0, f32::MAX, 0.2, f32::INFINITY],
    );
}

pub fn broadcast_and_strided_operands<T: Element>(ctx: &ArrayContext<T>) {
    let matrix = NdArray::<T>::arange(ctx, [3, 4]);
    let row = NdArray::from_vec(
        ctx,
        [4],
        vec![T::from_f64(10.0), T::from_f64(20.0), T::from_f64(30.0), T::from_f64(40.0)],
    )
    .unwrap();
    let sum = matrix.add(&row).unwrap();
    assert_eq!(sum.shape().dims(), &[3, 4]);
    assert_eq!(sum.get(&[2, 3]).unwrap(), T::from_f64(51.0));

    // Every other column of the transpose, against itself reversed in role.
    let strided = matrix.transpose().slice(0, 0, 4, 2).unwrap();
    assert_eq!(strided.shape().dims(), &[2, 3]);
    let product = strided.mul(&strided).unwrap();
    let expected: Vec<T> = [0.0, 16.0, 64.0, 4.0, 36.0, 100.0]
        .iter()
        .map(|&v| T::from_f64(v))
        .collect();
    assert_eq!(product.to_vec().unwrap(), expected);

    let column = NdArray::from_vec(ctx, [3, 1], vec![T::one(), T::zero(), T::one()]).unwrap();
    let masked = matrix.mul(&column).unwrap();
    assert_eq!(masked.get(&[1, 3]).unwrap(), T::zero());
    assert_eq!(masked.get(&[2, 3]).unwrap(), T::from_f64(11.0));

    let incompatible = NdArray::<T>::zeros(ctx, [3]);
    assert!(matches!(
        matrix.add(&incompatible),
        Err(ArrayError::Shape(_))
    ));
}

/// Integer division by zero fails with a computation error, whenever the result is observed.
pub fn integer_division_by_zero_fails(ctx: &ArrayContext<i32>) {
    let numerator = NdArray::from_vec(ctx, [3], vec![6, 7, 8]).unwrap();
    let divisor = NdArray::from_vec(ctx, [3], vec![2, 0, 1]).unwrap();
    let err = numerator
        .div(&divisor)
        .and_then(|quotient| quotient.to_vec())
        .unwrap_err();
    assert!(
        matches!(
            err,
            ArrayError::Computation {
                source: KernelError::DivisionByZero,
                ..
            }
        ),
        "{err:?}"
    );
    // The operands are untouched and still usable.
    assert_eq!(numerator.add(&divisor).unwrap().to_vec().unwrap(), vec![8, 7, 9]);
}

pub fn chained_operations_match_direct_copies<T: Element>(ctx: &ArrayContext<T>) {
    let mut rng = StdRng::seed_from_u64(23);
    let a = NdArray::from_vec(ctx, [4, 3], random_values(&mut rng, 12, -5.0, 5.0)).unwrap();
    let b = NdArray::from_vec(ctx, [4, 3], random_values(&mut rng, 12, -5.0, 5.0)).unwrap();
    let chained = a
        .add(&b)
        .and_then(|s| s.mul(&a))
        .and_then(|p| p.sub(&b.abs()?))
        .and_then(|d| d.maximum(&a.neg()?))
        .unwrap();

    let da = a.to_direct().unwrap();
    let db = b.to_direct().unwrap();
    let reference = da
        .add(&db)
        .and_then(|s| s.mul(&da))
        .and_then(|p| p.sub(&db.abs()?))
        .and_then(|d| d.maximum(&da.neg()?))
        .unwrap();
    assert_eq!(bits(&chained.to_vec().unwrap()), bits(&reference.to_vec().unwrap()));
}

pub fn copies_are_independent<T: Element>(ctx: &ArrayContext<T>) {
    let original = NdArray::<T>::arange(ctx, [2, 3]);
    let copy = original.transpose().copy().unwrap();
    assert_eq!(copy.shape().dims(), &[3, 2]);
    assert!(!copy.shares_storage(&original));
    copy.set(&[0, 0], T::from_f64(-1.0)).unwrap();
    assert_eq!(original.get(&[0, 0]).unwrap(), T::zero());

    let detached = original.to_direct().unwrap();
    assert_eq!(detached.kind(), ndvem::AccessorKind::Direct);
    original.set(&[1, 1], T::from_f64(9.0)).unwrap();
    assert_eq!(detached.get(&[1, 1]).unwrap(), T::from_f64(4.0));
}

pub fn scalar_and_empty_shapes<T: Element>(ctx: &ArrayContext<T>) {
    let scalar = NdArray::from_vec(ctx, Shape::scalar(), vec![T::from_f64(5.0)]).unwrap();
    assert_eq!(scalar.rank(), 0);
    assert_eq!(scalar.len(), 1);
    assert_eq!(scalar.get(&[]).unwrap(), T::from_f64(5.0));
    let doubled = scalar.add(&scalar).unwrap();
    assert_eq!(doubled.to_vec().unwrap(), vec![T::from_f64(10.0)]);

    let empty = NdArray::<T>::zeros(ctx, [2, 0]);
    assert!(empty.is_empty());
    assert!(empty.to_vec().unwrap().is_empty());
    assert!(empty.neg().unwrap().to_vec().unwrap().is_empty());
}
