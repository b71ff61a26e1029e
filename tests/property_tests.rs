//! Property-based tests for haversine-udf
//!
//! Mathematical invariants of the formula and of the aggregation:
//! - self-distance is zero
//! - distance is symmetric
//! - partial aggregate states merge associatively
//! - morsel size never changes the per-row output
//!
//! Run with `ProptestConfig::with_cases(100)` to stay fast.

use arrow::array::Float64Array;
use haversine_udf::formula::{haversine, haversine_expr, CoordinatePair};
use haversine_udf::query::AggregateState;
use haversine_udf::session::Session;
use haversine_udf::storage::StorageEngine;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn arb_lon() -> impl Strategy<Value = f64> {
    -180.0f64..180.0
}

fn arb_lat() -> impl Strategy<Value = f64> {
    -90.0f64..90.0
}

fn arb_pair() -> impl Strategy<Value = CoordinatePair> {
    (arb_lon(), arb_lat(), arb_lon(), arb_lat()).prop_map(|(x0, y0, x1, y1)| CoordinatePair::new(x0, y0, x1, y1))
}

fn arb_values() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(0.0f64..20_000.0, 0..200)
}

fn state_of(values: &[f64]) -> AggregateState {
    let mut state = AggregateState::new();
    state.update(&Float64Array::from(values.to_vec()));
    state
}

// ============================================================================
// Formula invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_self_distance_is_zero(x in arb_lon(), y in arb_lat()) {
        let d = haversine(x, y, x, y);
        prop_assert!(d.abs() <= 1e-12, "d = {d}");
    }

    #[test]
    fn prop_distance_is_symmetric(pair in arb_pair()) {
        let forward = pair.distance();
        let backward = pair.reversed().distance();
        let scale = forward.abs().max(1.0);
        prop_assert!((forward - backward).abs() <= 1e-9 * scale);
    }

    #[test]
    fn prop_distance_bounded_by_half_circumference(pair in arb_pair()) {
        let d = pair.distance();
        prop_assert!(d >= 0.0);
        prop_assert!(d <= std::f64::consts::PI * haversine_udf::EARTH_RADIUS_KM + 1e-9);
    }

    #[test]
    fn prop_expression_tree_matches_formula(pair in arb_pair()) {
        let tree = haversine_expr();
        let walked = tree.eval(&[pair.x0, pair.y0, pair.x1, pair.y1]);
        let direct = pair.distance();
        prop_assert!((walked - direct).abs() <= 1e-9 * direct.max(1.0));
    }
}

// ============================================================================
// Aggregation invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_merge_is_associative(a in arb_values(), b in arb_values(), c in arb_values()) {
        let (sa, sb, sc) = (state_of(&a), state_of(&b), state_of(&c));
        let left = sa.merge(sb).merge(sc);
        let right = sa.merge(sb.merge(sc));

        prop_assert_eq!(left.count, right.count);
        prop_assert!((left.sum - right.sum).abs() <= 1e-9 * left.sum.abs().max(1.0));
    }

    #[test]
    fn prop_merge_is_commutative(a in arb_values(), b in arb_values()) {
        let (sa, sb) = (state_of(&a), state_of(&b));
        prop_assert_eq!(sa.merge(sb), sb.merge(sa));
    }

    #[test]
    fn prop_split_state_matches_whole(values in arb_values(), split in 0usize..200) {
        let split = split.min(values.len());
        let whole = state_of(&values);
        let parts = state_of(&values[..split]).merge(state_of(&values[split..]));

        prop_assert_eq!(whole.count, parts.count);
        prop_assert!((whole.sum - parts.sum).abs() <= 1e-9 * whole.sum.abs().max(1.0));
    }
}

// ============================================================================
// Execution invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_morsel_size_does_not_change_output(
        pairs in proptest::collection::vec(arb_pair(), 1..300),
        morsel_rows in 1usize..64,
    ) {
        let storage = StorageEngine::from_pairs(&pairs).unwrap();
        let session = Session::builder().morsel_rows(morsel_rows).build();
        let out = session.distances("vectorized", &storage).unwrap();

        prop_assert_eq!(out.len(), pairs.len());
        for (row, pair) in pairs.iter().enumerate() {
            prop_assert_eq!(out.value(row), pair.distance());
        }
    }
}
