pub mod conformance;

/// Expands the conformance suite for one accessor strategy.
///
/// `$context` names a function in the calling module with the signature
/// `fn<T: ndvem::Element>() -> ndvem::ArrayContext<T>`.
#[macro_export]
macro_rules! define_accessor_tests {
    ($module:ident, $context:ident) => {
        #[cfg(test)]
        mod $module {
            use super::*;

            use $crate::conformance;

            #[test]
            fn set_get_round_trip_f64() {
                conformance::set_get_round_trip(&$context::<f64>());
            }

            #[test]
            fn set_get_round_trip_i32() {
                conformance::set_get_round_trip(&$context::<i32>());
            }

            #[test]
            fn out_of_range_index_is_rejected() {
                conformance::out_of_range_index_is_rejected(&$context::<f32>());
            }

            #[test]
            fn transpose_is_a_view() {
                conformance::transpose_is_a_view(&$context::<f64>());
            }

            #[test]
            fn writes_through_views_are_shared() {
                conformance::writes_through_views_are_shared(&$context::<i64>());
            }

            #[test]
            fn elementwise_matches_scalar_reference_f32() {
                conformance::elementwise_matches_scalar_reference(&$context::<f32>());
            }

            #[test]
            fn elementwise_matches_scalar_reference_i64() {
                conformance::elementwise_matches_scalar_reference(&$context::<i64>());
            }

            #[test]
            fn integer_edge_values_match_direct() {
                conformance::integer_edge_values_match_direct(&$context::<i32>());
            }

            #[test]
            fn wide_integer_edge_values_match_direct() {
                conformance::wide_integer_edge_values_match_direct(&$context::<i64>());
            }

            #[test]
            fn float_edge_values_match_direct() {
                conformance::float_edge_values_match_direct(&$context::<f64>());
            }

            #[test]
            fn single_float_edge_values_match_direct() {
                conformance::single_float_edge_values_match_direct(&$context::<f32>());
            }

            #[test]
            fn broadcast_and_strided_operands() {
                conformance::broadcast_and_strided_operands(&$context::<f64>());
            }

            #[test]
            fn integer_division_by_zero_fails() {
                conformance::integer_division_by_zero_fails(&$context::<i32>());
            }

            #[test]
            fn chained_operations_match_direct_copies() {
                conformance::chained_operations_match_direct_copies(&$context::<f64>());
            }

            #[test]
            fn copies_are_independent() {
                conformance::copies_are_independent(&$context::<i32>());
            }

            #[test]
            fn scalar_and_empty_shapes() {
                conformance::scalar_and_empty_shapes(&$context::<f32>());
            }
        }
    };
}
