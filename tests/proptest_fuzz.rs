// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for the parsers and persisted cursors.
//!
//! Uses proptest to generate random/malformed inputs and verify nothing
//! panics and cursors never move backwards.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{Map, Value};

use mirror_sync::audit::parse_line;
use mirror_sync::bulk::slugify;
use mirror_sync::change::decode_change_data;
use mirror_sync::storage::mirror::merge_record;
use mirror_sync::storage::sql::normalize_timestamp;
use mirror_sync::storage::state::{CursorStore, ProcessingStateStore};
use mirror_sync::{AuditAction, AuditEvent};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn record_id_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{1,24}"
}

fn action_strategy() -> impl Strategy<Value = AuditAction> {
    prop_oneof![Just(AuditAction::Create), Just(AuditAction::Update), Just(AuditAction::Delete)]
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        3,  // depth
        32, // max nodes
        8,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::hash_map("[a-z]{1,8}", inner, 0..8)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

// =============================================================================
// Audit line parser
// =============================================================================

proptest! {
    /// Arbitrary text never panics the parser
    #[test]
    fn fuzz_parse_line_arbitrary_text(line in ".*") {
        let _ = parse_line(&line);
    }

    /// Arbitrary bytes (lossily decoded) never panic the parser
    #[test]
    fn fuzz_parse_line_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = parse_line(&String::from_utf8_lossy(&bytes));
    }

    /// JSON-looking lines of any shape fail cleanly
    #[test]
    fn fuzz_parse_line_arbitrary_json(json in arbitrary_json_strategy()) {
        let _ = parse_line(&json.to_string());
    }

    /// Prose lines recover the tagged id and the delete marker
    #[test]
    fn prop_prose_line_yields_tagged_id(
        id in record_id_strategy(),
        name in "[0-9 ]{0,20}",
        delete in any::<bool>(),
    ) {
        let verb = if delete { "deleted" } else { "updated" };
        let line = format!("2025-01-01T10:00:00.000Z - Product {}: {} (ID: {})", verb, name, id);
        let parsed = parse_line(&line).unwrap();
        prop_assert_eq!(parsed.id, id);
        prop_assert_eq!(parsed.action.is_delete(), delete);
        prop_assert!(parsed.entity.is_none());
    }

    /// Structured events written by the write path parse back unchanged
    #[test]
    fn prop_structured_event_parses_back(
        entity in "[a-z]{1,12}",
        id in record_id_strategy(),
        action in action_strategy(),
    ) {
        let line = AuditEvent::new(entity.clone(), id.clone(), action).to_line().unwrap();
        let parsed = parse_line(&line).unwrap();
        prop_assert_eq!(parsed.id, id);
        prop_assert_eq!(parsed.action, action);
        prop_assert_eq!(parsed.entity, Some(entity));
    }
}

// =============================================================================
// Ledger payloads and values
// =============================================================================

proptest! {
    /// change_data decoding never panics on arbitrary text
    #[test]
    fn fuzz_decode_change_data(raw in ".*") {
        let _ = decode_change_data(&raw);
    }

    /// Timestamp normalization never panics and only accepts RFC 3339
    #[test]
    fn fuzz_normalize_timestamp(raw in ".*") {
        if let Some(normalized) = normalize_timestamp(&raw) {
            prop_assert_eq!(normalized.len(), "2025-01-01 10:00:00.000".len());
        }
    }

    /// Category slugs are lowercase and free of whitespace
    #[test]
    fn prop_slugify_has_no_whitespace(name in "[A-Za-z \t]{0,30}") {
        let slug = slugify(&name);
        prop_assert!(!slug.chars().any(char::is_whitespace));
        prop_assert_eq!(slug.clone(), slug.to_lowercase());
    }

    /// Merging keeps mirror-only fields and takes every canonical scalar
    #[test]
    fn prop_merge_keeps_mirror_fields(
        mirror_only in prop::collection::hash_map("m_[a-z]{1,6}", ".*", 0..5),
        canonical in prop::collection::hash_map("c_[a-z]{1,6}", any::<i64>(), 0..5),
    ) {
        let existing: Map<String, Value> =
            mirror_only.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
        let fresh: Map<String, Value> =
            canonical.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect();

        let merged = merge_record(&Value::Object(existing), Value::Object(fresh), &[]);

        for (k, v) in &mirror_only {
            prop_assert_eq!(&merged[k], &Value::String(v.clone()));
        }
        for (k, v) in &canonical {
            prop_assert_eq!(&merged[k], &Value::from(*v));
        }
    }
}

// =============================================================================
// Cursor monotonicity
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever order saves arrive in, the ledger cursor ends at the maximum
    #[test]
    fn prop_ledger_cursor_never_decreases(ids in prop::collection::vec(0i64..10_000, 1..20)) {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("sync_state.json"));
        let rt = runtime();

        let mut high = 0;
        for id in &ids {
            rt.block_on(store.advance(*id)).unwrap();
            high = high.max(*id);
            prop_assert_eq!(rt.block_on(store.load()).unwrap(), high);
        }
    }

    /// Per-file cursors are independent of each other
    #[test]
    fn prop_file_cursors_are_independent(a in 0usize..500, b in 0usize..500) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessingStateStore::new(dir.path().join("processing_state.json"));
        let rt = runtime();

        rt.block_on(store.set("products.json.log", a)).unwrap();
        rt.block_on(store.set("stores.json.log", b)).unwrap();
        prop_assert_eq!(rt.block_on(store.get("products.json.log")).unwrap(), a);
        prop_assert_eq!(rt.block_on(store.get("stores.json.log")).unwrap(), b);
        prop_assert_eq!(rt.block_on(store.get("users.json.log")).unwrap(), 0);
    }
}
