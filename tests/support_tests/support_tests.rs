//! Support Module Tests
//!
//! Tests verify:
//! - Latency distributions and the process-title line
//! - Debug filter parsing, matching and generation caching
//! - Config defaults, builder and validation
//! - Transaction id bookkeeping

use dictkv::config::Config;
use dictkv::connection::{TransactionLookupError, TransactionTable};
use dictkv::dict::{Dict, MemoryDict, OpSettings};
use dictkv::log_filter::{
    debug_enabled, filter_generation, set_global_debug_filter, unset_global_debug_filter, CachedDecision,
    DebugFilter, FilterInput,
};
use dictkv::stats::{CommandStats, StatKind, StatsDist, STATS_SAMPLE_LEN};
use dictkv::DictError;

// =============================================================================
// Stats Tests
// =============================================================================

#[test]
fn test_empty_dist_reports_zeroes() {
    let dist = StatsDist::new();
    assert_eq!(dist.count(), 0);
    assert_eq!(dist.min(), 0);
    assert_eq!(dist.avg(), 0);
    assert_eq!(dist.percentile(0.95), 0);
}

#[test]
fn test_dist_min_max_avg() {
    let mut dist = StatsDist::new();
    for usecs in [40, 10, 30, 20] {
        dist.add(usecs);
    }
    assert_eq!(dist.count(), 4);
    assert_eq!(dist.sum(), 100);
    assert_eq!(dist.min(), 10);
    assert_eq!(dist.max(), 40);
    assert_eq!(dist.avg(), 25);
}

#[test]
fn test_dist_percentile_nearest_rank() {
    let mut dist = StatsDist::new();
    for usecs in 1..=100 {
        dist.add(usecs);
    }
    assert_eq!(dist.percentile(0.5), 50);
    assert_eq!(dist.percentile(0.95), 95);
    assert_eq!(dist.percentile(1.0), 100);
    assert_eq!(dist.percentile(0.0), 1);
}

#[test]
fn test_dist_percentile_uses_recent_samples() {
    let mut dist = StatsDist::new();
    dist.add(1_000_000);
    for _ in 0..STATS_SAMPLE_LEN {
        dist.add(5);
    }
    // the outlier has left the sample window but still counts for max
    assert_eq!(dist.percentile(1.0), 5);
    assert_eq!(dist.max(), 1_000_000);
    assert_eq!(dist.count(), STATS_SAMPLE_LEN as u64 + 1);
}

#[test]
fn test_proctitle_format() {
    let stats = CommandStats::new();
    stats.client_connected();
    stats.client_connected();
    stats.record(StatKind::Lookup, 100);
    stats.record(StatKind::Lookup, 300);
    stats.record(StatKind::Commit, 7);

    assert_eq!(
        stats.proctitle(),
        "[2 clients, 2 lookups:100/200/300/300, 0 iters:0/0/0/0, 1 commits:7/7/7/7]"
    );
}

#[test]
fn test_client_count_never_underflows() {
    let stats = CommandStats::new();
    stats.client_disconnected();
    assert_eq!(stats.clients(), 0);
    stats.client_connected();
    stats.client_disconnected();
    assert_eq!(stats.clients(), 0);
}

// =============================================================================
// Debug Filter Tests
// =============================================================================

fn input<'a>(command: &'a str, user: Option<&'a str>, key: &'a str) -> FilterInput<'a> {
    FilterInput {
        command: Some(command),
        dict: Some("main"),
        user,
        key: Some(key),
    }
}

#[test]
fn test_filter_parse_errors() {
    assert!(matches!(DebugFilter::parse(""), Err(DictError::Config(_))));
    assert!(matches!(DebugFilter::parse("command"), Err(DictError::Config(_))));
    assert!(matches!(DebugFilter::parse("color=red"), Err(DictError::Config(_))));
}

#[test]
fn test_filter_all_terms_must_match() {
    let filter = DebugFilter::parse("command=LOOKUP user=alice").unwrap();
    assert!(filter.matches(&input("LOOKUP", Some("alice"), "shared/a")));
    assert!(!filter.matches(&input("LOOKUP", Some("bob"), "shared/a")));
    assert!(!filter.matches(&input("SET", Some("alice"), "shared/a")));
    // a field the command doesn't have never matches
    assert!(!filter.matches(&input("LOOKUP", None, "shared/a")));
}

#[test]
fn test_filter_prefix_pattern() {
    let filter = DebugFilter::parse("dict=main key=priv/*").unwrap();
    assert!(filter.matches(&input("SET", None, "priv/quota")));
    assert!(!filter.matches(&input("SET", None, "shared/quota")));
}

#[test]
fn test_global_filter_and_cached_decision() {
    // the only test in this binary touching the process-wide filter
    let mut cached = CachedDecision::default();
    let mut evaluations = 0;

    let start = filter_generation();
    let lookup = input("LOOKUP", None, "shared/a");
    let commit = input("COMMIT", None, "shared/a");

    set_global_debug_filter(DebugFilter::parse("command=LOOKUP").unwrap());
    assert!(filter_generation() > start);
    assert!(debug_enabled(&lookup));
    assert!(!debug_enabled(&commit));

    assert!(cached.get(|| {
        evaluations += 1;
        debug_enabled(&lookup)
    }));
    assert!(cached.get(|| {
        evaluations += 1;
        false
    }));
    assert_eq!(evaluations, 1);

    unset_global_debug_filter();
    assert!(debug_enabled(&commit));
    assert!(!cached.get(|| false));

    cached.invalidate();
    assert!(cached.get(|| true));
}

// =============================================================================
// Config Tests
// =============================================================================

#[test]
fn test_config_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.output_optimal_size, 1024);
    assert!(!config.verbose_proctitle);
    assert!(config.debug_filter.is_none());
}

#[test]
fn test_config_builder() {
    let config = Config::builder()
        .dict_name("quota")
        .iterate_batch_size(16)
        .max_pending_commands(8)
        .output_optimal_size(512)
        .output_buffer_limit(4096)
        .listen_addr("0.0.0.0:9000")
        .max_connections(4)
        .read_timeout_ms(250)
        .write_timeout_ms(100)
        .verbose_proctitle(true)
        .debug_filter(Some("user=alice".to_string()))
        .build();

    assert_eq!(config.dict_name, "quota");
    assert_eq!(config.iterate_batch_size, 16);
    assert_eq!(config.max_pending_commands, 8);
    assert_eq!(config.listen_addr, "0.0.0.0:9000");
    assert_eq!(config.read_timeout_ms, 250);
    assert!(config.verbose_proctitle);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation_errors() {
    let invalid = [
        Config::builder().dict_name("").build(),
        Config::builder().max_pending_commands(0).build(),
        Config::builder().iterate_batch_size(0).build(),
        Config::builder().max_connections(0).build(),
        Config::builder().output_optimal_size(2048).output_buffer_limit(1024).build(),
        Config::builder().debug_filter(Some("bogus".to_string())).build(),
    ];
    for config in invalid {
        assert!(
            matches!(config.validate(), Err(DictError::Config(_))),
            "accepted {config:?}"
        );
    }
}

// =============================================================================
// Transaction Table Tests
// =============================================================================

fn open(dict: &MemoryDict) -> Box<dyn dictkv::dict::DictTransaction> {
    dict.transaction_begin(&OpSettings::default())
}

#[test]
fn test_table_insert_rejects_duplicate_id() {
    let dict = MemoryDict::new();
    let mut table = TransactionTable::new();
    assert!(table.insert(1, open(&dict)).is_ok());
    assert!(table.insert(2, open(&dict)).is_ok());
    assert!(table.insert(1, open(&dict)).is_err());
    assert_eq!(table.ids(), vec![1, 2]);
}

#[test]
fn test_table_id_reserved_while_committing() {
    let dict = MemoryDict::new();
    let mut table = TransactionTable::new();
    table.insert(5, open(&dict)).ok();

    let ctx = table.take_for_commit(5).unwrap();
    assert!(table.contains(5));
    assert_eq!(table.get_mut(5).err(), Some(TransactionLookupError::Committing));
    assert_eq!(table.take_for_commit(5).err(), Some(TransactionLookupError::Committing));
    assert!(table.insert(5, open(&dict)).is_err());
    ctx.rollback();

    // the slot had no open transaction left
    assert!(table.remove(5).is_none());
    assert!(!table.contains(5));
    assert!(table.is_empty());
}

#[test]
fn test_table_missing_ids() {
    let mut table = TransactionTable::new();
    assert_eq!(table.get_mut(3).err(), Some(TransactionLookupError::Missing));
    assert_eq!(table.take_for_commit(3).err(), Some(TransactionLookupError::Missing));
    assert!(table.remove(3).is_none());
}

#[test]
fn test_table_drain_skips_committing() {
    let dict = MemoryDict::new();
    let mut table = TransactionTable::new();
    table.insert(1, open(&dict)).ok();
    table.insert(2, open(&dict)).ok();
    let committing = table.take_for_commit(1).unwrap();

    let open_ids: Vec<u32> = table.drain().into_iter().map(|(id, ctx)| {
        ctx.rollback();
        id
    }).collect();
    assert_eq!(open_ids, vec![2]);
    assert_eq!(table.len(), 0);
    committing.rollback();
}
