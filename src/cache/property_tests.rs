//! Property tests for key prefix semantics and prefix invalidation.

use std::time::Duration;

use proptest::prelude::*;

use super::entry::QueryOptions;
use super::key::{KeySegment, QueryKey};
use super::store::QueryStore;

fn segment_strategy() -> impl Strategy<Value = KeySegment> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(KeySegment::from),
        any::<i64>().prop_map(KeySegment::from),
    ]
}

fn key_strategy(max_segments: usize) -> impl Strategy<Value = QueryKey> {
    prop::collection::vec(segment_strategy(), 1..max_segments).prop_map(QueryKey::from)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Every key is a prefix of itself.
    #[test]
    fn prop_key_is_prefix_of_itself(key in key_strategy(5)) {
        prop_assert!(key.starts_with(&key));
    }

    /// Truncating a key to any length yields a matching prefix.
    #[test]
    fn prop_truncation_yields_prefix(key in key_strategy(5), cut in 0usize..5) {
        let cut = cut.min(key.len());
        let prefix = QueryKey::from(key.segments()[..cut].to_vec());
        prop_assert!(key.starts_with(&prefix));
    }

    /// Joining a segment preserves the prefix relation one way only:
    /// the extended key matches the original, never the reverse.
    #[test]
    fn prop_extension_is_one_way(key in key_strategy(5), segment in segment_strategy()) {
        let extended = key.clone().join(segment);
        prop_assert!(extended.starts_with(&key));
        prop_assert!(!key.starts_with(&extended));
    }

    /// Serializing a key to JSON and back preserves it exactly.
    #[test]
    fn prop_serde_roundtrip(key in key_strategy(5)) {
        let json = serde_json::to_string(&key).expect("serialize");
        let back: QueryKey = serde_json::from_str(&json).expect("deserialize");
        prop_assert_eq!(key, back);
    }

    /// `invalidate(prefix)` reports the number of matching entries and
    /// marks exactly those stale; everything else stays fresh.
    #[test]
    fn prop_invalidate_marks_exactly_matching(
        keys in prop::collection::hash_set(key_strategy(4), 1..8),
        prefix in key_strategy(3),
    ) {
        let (store, _events) = QueryStore::new();
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(3600));
        let mut subscriptions = Vec::new();
        for key in &keys {
            store.put(key, serde_json::json!({"k": key.to_string()}));
            subscriptions.push(store.subscribe(key, options.clone(), None));
        }

        let matched = store.invalidate(&prefix);
        let expected = keys.iter().filter(|k| k.starts_with(&prefix)).count();
        prop_assert_eq!(matched, expected);

        for key in &keys {
            prop_assert_eq!(
                store.is_stale(key),
                key.starts_with(&prefix),
                "staleness must track prefix matching for {}",
                key
            );
        }
    }
}
