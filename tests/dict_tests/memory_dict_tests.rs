//! MemoryDict Tests
//!
//! Tests verify:
//! - Lookups in the shared and private namespaces
//! - Iteration flags, limits and batch-wise async delivery
//! - Transactions: atomic apply, ATOMIC_INC semantics, rollback, expiry

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use dictkv::dict::{
    CommitResult, Dict, DictIterator, DictRow, DictTransaction, IterateFlags, LookupResult, MemoryDict, OpSettings,
    Timestamp,
};

fn lookup(dict: &MemoryDict, key: &str, user: Option<&str>) -> LookupResult {
    let slot = Arc::new(Mutex::new(None));
    let out = Arc::clone(&slot);
    dict.lookup_async(
        &OpSettings::for_user(user.map(str::to_string)),
        key.as_bytes(),
        Box::new(move |result| *out.lock() = Some(result)),
    );
    let result = slot.lock().take();
    result.expect("lookup callback not called")
}

fn commit(dict: &MemoryDict, set: &OpSettings, build: impl FnOnce(&mut dyn DictTransaction)) -> CommitResult {
    let mut tx = dict.transaction_begin(set);
    build(tx.as_mut());
    let slot = Arc::new(Mutex::new(None));
    let out = Arc::clone(&slot);
    tx.commit_async(Box::new(move |result| *out.lock() = Some(result)));
    let result = slot.lock().take();
    result.expect("commit callback not called")
}

fn collect_rows(iter: &mut Box<dyn DictIterator>) -> Vec<DictRow> {
    let mut rows = Vec::new();
    while let Some(row) = iter.next_row() {
        rows.push(row);
    }
    rows
}

fn keys(rows: &[DictRow]) -> Vec<String> {
    rows.iter().map(|r| String::from_utf8_lossy(&r.key).into_owned()).collect()
}

fn populated() -> MemoryDict {
    let dict = MemoryDict::new();
    dict.insert(b"shared/a", b"3", None);
    dict.insert(b"shared/b", b"1", None);
    dict.insert(b"shared/c", b"2", None);
    dict.insert(b"shared/sub/x", b"9", None);
    dict.insert(b"shared/sub/y", b"8", None);
    dict.insert(b"other/z", b"0", None);
    dict
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[test]
fn test_new_dict_is_empty() {
    let dict = MemoryDict::new();
    assert!(dict.is_empty());
    assert_eq!(dict.entry_count(), 0);
}

#[test]
fn test_lookup_found_and_missing() {
    let dict = populated();
    assert_eq!(lookup(&dict, "shared/a", None), LookupResult::Found(vec![b"3".to_vec()]));
    assert_eq!(lookup(&dict, "shared/nope", None), LookupResult::NotFound);
}

#[test]
fn test_private_keys_are_per_user() {
    let dict = MemoryDict::new();
    assert!(dict.insert(b"priv/quota", b"10", Some("alice")));
    assert!(dict.insert(b"priv/quota", b"20", Some("bob")));

    assert_eq!(lookup(&dict, "priv/quota", Some("alice")), LookupResult::Found(vec![b"10".to_vec()]));
    assert_eq!(lookup(&dict, "priv/quota", Some("bob")), LookupResult::Found(vec![b"20".to_vec()]));
    assert_eq!(lookup(&dict, "priv/quota", Some("carol")), LookupResult::NotFound);
}

#[test]
fn test_private_lookup_without_user_fails() {
    let dict = MemoryDict::new();
    assert!(!dict.insert(b"priv/quota", b"10", None));
    match lookup(&dict, "priv/quota", None) {
        LookupResult::Failed(error) => assert!(error.contains("requires username")),
        other => panic!("Expected failure, got {other:?}"),
    }
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_iterate_direct_children_only() {
    let dict = populated();
    let mut iter = dict.iterate_init(&OpSettings::default(), b"shared/", IterateFlags::empty());
    let rows = collect_rows(&mut iter);
    assert_eq!(keys(&rows), vec!["shared/a", "shared/b", "shared/c"]);
    assert!(!iter.has_more());
    assert!(iter.deinit().is_ok());
}

#[test]
fn test_iterate_recurse() {
    let dict = populated();
    let mut iter = dict.iterate_init(&OpSettings::default(), b"shared/", IterateFlags::RECURSE);
    let rows = collect_rows(&mut iter);
    assert_eq!(rows.len(), 5);
    assert_eq!(keys(&rows)[3..], ["shared/sub/x", "shared/sub/y"]);
}

#[test]
fn test_iterate_exact_key() {
    let dict = populated();
    let mut iter = dict.iterate_init(&OpSettings::default(), b"shared/b", IterateFlags::EXACT_KEY);
    let rows = collect_rows(&mut iter);
    assert_eq!(rows, vec![DictRow { key: b"shared/b".to_vec(), values: vec![b"1".to_vec()] }]);
}

#[test]
fn test_iterate_sort_by_value() {
    let dict = populated();
    let mut iter = dict.iterate_init(&OpSettings::default(), b"shared/", IterateFlags::SORT_BY_VALUE);
    let rows = collect_rows(&mut iter);
    assert_eq!(keys(&rows), vec!["shared/b", "shared/c", "shared/a"]);
}

#[test]
fn test_iterate_no_value() {
    let dict = populated();
    let mut iter = dict.iterate_init(&OpSettings::default(), b"shared/", IterateFlags::NO_VALUE);
    let rows = collect_rows(&mut iter);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.values.is_empty()));
}

#[test]
fn test_iterate_limit() {
    let dict = populated();
    let mut iter = dict.iterate_init(&OpSettings::default(), b"shared/", IterateFlags::RECURSE);
    iter.set_limit(2);
    let rows = collect_rows(&mut iter);
    assert_eq!(rows.len(), 2);
    assert!(!iter.has_more());
}

#[test]
fn test_iterate_private_without_user_fails_on_deinit() {
    let dict = MemoryDict::new();
    let mut iter = dict.iterate_init(&OpSettings::default(), b"priv/", IterateFlags::empty());
    assert!(iter.next_row().is_none());
    assert!(!iter.has_more());
    assert!(iter.deinit().unwrap_err().contains("requires username"));
}

#[test]
fn test_async_iteration_releases_batches() {
    let dict = MemoryDict::with_batch_size(2);
    for i in 0..5 {
        dict.insert(format!("shared/k{i}").as_bytes(), b"v", None);
    }
    let mut iter = dict.iterate_init(&OpSettings::default(), b"shared/", IterateFlags::ASYNC);
    // nothing is ready before a callback is registered
    assert!(iter.has_more());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    iter.set_async_callback(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut rows = Vec::new();
    loop {
        let batch = collect_rows(&mut iter);
        rows.extend(batch);
        if !iter.has_more() {
            break;
        }
    }
    assert_eq!(rows.len(), 5);
    // first batch on registration, then one per exhausted batch
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Transaction Tests
// =============================================================================

#[test]
fn test_commit_applies_all_changes() {
    let dict = populated();
    let result = commit(&dict, &OpSettings::default(), |tx| {
        tx.set(b"shared/new", b"hello");
        tx.unset(b"shared/a");
        tx.atomic_inc(b"shared/b", 41);
    });
    assert_eq!(result, CommitResult::Ok);
    assert_eq!(dict.get(b"shared/new", None), Some(b"hello".to_vec()));
    assert_eq!(dict.get(b"shared/a", None), None);
    assert_eq!(dict.get(b"shared/b", None), Some(b"42".to_vec()));
}

#[test]
fn test_changes_invisible_until_commit() {
    let dict = MemoryDict::new();
    let mut tx = dict.transaction_begin(&OpSettings::default());
    tx.set(b"shared/k", b"v");
    assert_eq!(dict.get(b"shared/k", None), None);
    tx.rollback();
    assert_eq!(dict.get(b"shared/k", None), None);
}

#[test]
fn test_atomic_inc_missing_key_reports_not_found() {
    let dict = MemoryDict::new();
    let result = commit(&dict, &OpSettings::default(), |tx| {
        tx.atomic_inc(b"shared/counter", 1);
        tx.set(b"shared/other", b"x");
    });
    assert_eq!(result, CommitResult::NotFound);
    assert_eq!(dict.get(b"shared/counter", None), None);
    assert_eq!(dict.get(b"shared/other", None), Some(b"x".to_vec()));
}

#[test]
fn test_atomic_inc_after_set_in_same_transaction() {
    let dict = MemoryDict::new();
    let result = commit(&dict, &OpSettings::default(), |tx| {
        tx.set(b"shared/counter", b"10");
        tx.atomic_inc(b"shared/counter", -3);
    });
    assert_eq!(result, CommitResult::Ok);
    assert_eq!(dict.get(b"shared/counter", None), Some(b"7".to_vec()));
}

#[test]
fn test_atomic_inc_non_numeric_fails_whole_commit() {
    let dict = MemoryDict::new();
    dict.insert(b"shared/text", b"abc", None);
    let result = commit(&dict, &OpSettings::default(), |tx| {
        tx.set(b"shared/first", b"1");
        tx.atomic_inc(b"shared/text", 1);
    });
    assert!(matches!(result, CommitResult::Failed(_)));
    assert_eq!(dict.get(b"shared/first", None), None);
}

#[test]
fn test_private_write_needs_user() {
    let dict = MemoryDict::new();
    let result = commit(&dict, &OpSettings::default(), |tx| tx.set(b"priv/k", b"v"));
    assert!(matches!(result, CommitResult::Failed(_)));

    let alice = OpSettings::for_user(Some("alice".to_string()));
    assert_eq!(commit(&dict, &alice, |tx| tx.set(b"priv/k", b"v")), CommitResult::Ok);
    assert_eq!(dict.get(b"priv/k", Some("alice")), Some(b"v".to_vec()));
}

#[test]
fn test_timestamp_recorded_on_write() {
    let dict = MemoryDict::new();
    let ts = Timestamp { secs: 1_700_000_000, nsecs: 5 };
    commit(&dict, &OpSettings::default(), |tx| {
        tx.set_timestamp(ts);
        tx.set_hide_log_values(true);
        tx.set(b"shared/k", b"secret");
    });
    assert_eq!(dict.written_at(b"shared/k", None), Some(ts));
}

#[test]
fn test_expired_values_disappear() {
    let dict = MemoryDict::new();
    let set = OpSettings {
        username: None,
        expire_secs: 1,
    };
    assert_eq!(commit(&dict, &set, |tx| tx.set(b"shared/tmp", b"v")), CommitResult::Ok);
    assert_eq!(dict.get(b"shared/tmp", None), Some(b"v".to_vec()));
    std::thread::sleep(std::time::Duration::from_millis(1100));
    assert_eq!(dict.get(b"shared/tmp", None), None);
}
