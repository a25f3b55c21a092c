//! Property-based tests for the cache contract
//!
//! Tests verify:
//! - Round trip: `get` right after `put` returns an equal value
//! - Deduplication: results share a blob exactly when their encoded bytes match
//! - Convergence: counts always match live entries; no orphaned blobs

use std::collections::{HashMap, HashSet};

use memento_test_utils::assertions::*;
use memento_test_utils::fixtures::TestCache;
use memento_test_utils::generators::*;
use memento_test_utils::Serializer;
use proptest::prelude::*;
use serde_json::Value;

#[derive(Debug, Clone)]
enum Op {
    Put { request: u8, result: u8 },
    Invalidate { request: u8 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..6, 0u8..4).prop_map(|(request, result)| Op::Put { request, result }),
        1 => (0u8..6).prop_map(|request| Op::Invalidate { request }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_round_trip_typed_results(
        request in arb_request(),
        result in arb_result(),
        serializer in arb_serializer(),
    ) {
        let cache = TestCache::with_serializer(serializer);
        cache.put(&request, &result).expect("put should succeed");

        let cached: Option<(String, Vec<i64>)> = cache.get(&request);
        prop_assert_eq!(cached, Some(result));
    }

    #[test]
    fn prop_round_trip_json_results(
        request in arb_request(),
        result in arb_json_value(),
        serializer in arb_serializer(),
    ) {
        let cache = TestCache::with_serializer(serializer);
        cache.put(&request, &result).expect("put should succeed");

        let cached: Option<Value> = cache.get(&request);
        prop_assert_eq!(cached, Some(result));
    }

    #[test]
    fn prop_round_trip_numbers_of_any_width(
        request in arb_request(),
        result in arb_number(),
        serializer in arb_binary_serializer(),
    ) {
        let cache = TestCache::with_serializer(serializer);
        cache.put(&request, &result).expect("put should succeed");

        let cached: Number = cache.get(&request).expect("result should be cached");
        prop_assert_eq!(
            serializer.encode(&cached).expect("encode cached"),
            serializer.encode(&result).expect("encode original")
        );
    }

    #[test]
    fn prop_blobs_shared_only_for_equal_bytes(
        results in prop::collection::vec(arb_number(), 1..8),
        serializer in arb_binary_serializer(),
    ) {
        let cache = TestCache::with_serializer(serializer);
        let encoded: Vec<Vec<u8>> = results
            .iter()
            .map(|result| serializer.encode(result).expect("encode"))
            .collect();
        for (slot, result) in results.iter().enumerate() {
            cache
                .put(&serde_json::json!({ "slot": slot }), result)
                .expect("put should succeed");
        }

        let distinct: HashSet<&Vec<u8>> = encoded.iter().collect();
        prop_assert_eq!(cache.blob_count(), distinct.len());
        for (slot, result) in results.iter().enumerate() {
            let cached: Number = cache
                .get(&serde_json::json!({ "slot": slot }))
                .expect("every slot should be cached");
            prop_assert_eq!(&serializer.encode(&cached).expect("encode"), &encoded[slot]);

            let sharing = encoded.iter().filter(|bytes| **bytes == encoded[slot]).count();
            assert_reference_count(&cache, result, sharing as u64);
        }
        assert_converged(&cache);
    }

    #[test]
    fn prop_equal_results_share_one_blob(
        ops in prop::collection::btree_set("[a-z]{1,8}", 2..5),
        result in arb_result(),
    ) {
        let cache = TestCache::new();
        let requests: Vec<Value> = ops.iter().map(|op| serde_json::json!({ "op": op })).collect();
        for request in &requests {
            cache.put(request, &result).expect("put should succeed");
        }

        prop_assert_eq!(cache.blob_count(), 1);
        assert_reference_count(&cache, &result, requests.len() as u64);
    }

    #[test]
    fn prop_counts_converge_under_any_history(ops in prop::collection::vec(arb_op(), 1..40)) {
        let cache = TestCache::new();
        let mut model: HashMap<u8, u8> = HashMap::new();

        for op in &ops {
            match *op {
                Op::Put { request, result } => {
                    cache.put(&request, &i64::from(result)).expect("put should succeed");
                    model.insert(request, result);
                }
                Op::Invalidate { request } => {
                    let removed = cache.invalidate(&request).expect("invalidate should succeed");
                    prop_assert_eq!(removed, model.remove(&request).is_some());
                }
            }
        }

        for result in 0u8..4 {
            let live = model.values().filter(|r| **r == result).count() as u64;
            assert_reference_count(&cache, &i64::from(result), live);
            if live == 0 {
                assert_blob_absent(&cache, &i64::from(result));
            } else {
                assert_blob_exists(&cache, &i64::from(result));
            }
        }
        for (request, result) in &model {
            prop_assert_eq!(cache.get::<_, i64>(request), Some(i64::from(*result)));
        }
        assert_converged(&cache);
    }
}
