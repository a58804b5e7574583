//! Flow Control Tests
//!
//! Tests verify:
//! - Iteration output pauses under backpressure and resumes without losing
//!   or repeating rows
//! - Row limits hold for batch-delivered iterations
//! - Input halts at the pending-command limit and resumes
//! - Teardown waits for outstanding commands and rolls back transactions

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use common::*;
use dictkv::connection::{ConnectionSettings, DictConnection, Event};
use dictkv::dict::{CommitResult, Dict, LookupResult, MemoryDict};
use dictkv::stats::{CommandStats, StatKind};
use dictkv::stream::{MemoryOutput, OutputStream};
use dictkv::DictError;
use proptest::prelude::*;

const ROW_COUNT: usize = 60;

fn big_dict(batch_size: usize) -> Arc<MemoryDict> {
    let dict = MemoryDict::with_batch_size(batch_size);
    for i in 0..ROW_COUNT {
        let key = format!("shared/key{i:03}");
        let value = format!("value-{i:03}-{}", "x".repeat(32));
        dict.insert(key.as_bytes(), value.as_bytes(), None);
    }
    Arc::new(dict)
}

fn small_buffer_settings() -> ConnectionSettings {
    ConnectionSettings {
        output_optimal_size: 128,
        ..settings()
    }
}

/// Run one iteration to completion, granting `grant` bytes of output room
/// whenever the connection waits for the peer
fn run_iteration(dict: Arc<MemoryDict>, output: MemoryOutput, grant: usize) -> Vec<String> {
    let mut conn = connect_with(dict, small_buffer_settings(), output);
    request(&mut conn, "I0\t0\tshared/").unwrap();

    let mut rounds = 0;
    loop {
        drain(&mut conn);
        if conn.pending_commands() == 0 {
            break;
        }
        assert!(conn.output().flush_pending(), "iteration stalled without waiting for output");
        conn.output_mut().grant(grant);
        conn.handle_event(Event::OutputReady);
        rounds += 1;
        assert!(rounds < 10_000, "iteration never finished");
    }
    conn.output_mut().unthrottle();
    take_lines(&mut conn)
}

fn row_lines(lines: &[String]) -> Vec<String> {
    lines.iter().filter(|l| l.starts_with("+1\tO")).cloned().collect()
}

// =============================================================================
// Backpressure Tests
// =============================================================================

#[test]
fn test_unthrottled_iteration_emits_all_rows() {
    let lines = run_iteration(big_dict(7), MemoryOutput::new(), 0);
    assert_eq!(lines[0], "*1");
    let rows = row_lines(&lines);
    assert_eq!(rows.len(), ROW_COUNT);
    assert!(rows[0].starts_with("+1\tOshared/key000\tvalue-000-"));
    assert_eq!(strip_timings(lines.last().unwrap()), format!("+1\t\t{ROW_COUNT}"));
}

#[test]
fn test_throttled_iteration_matches_unthrottled() {
    let expected = run_iteration(big_dict(7), MemoryOutput::new(), 0);
    let throttled = run_iteration(big_dict(7), MemoryOutput::with_window(100), 150);

    assert_eq!(row_lines(&throttled), row_lines(&expected));
    assert_eq!(
        strip_timings(throttled.last().unwrap()),
        strip_timings(expected.last().unwrap())
    );
    assert_eq!(throttled.len(), expected.len());
}

#[test]
fn test_throttled_iteration_with_tiny_grants() {
    let expected = run_iteration(big_dict(3), MemoryOutput::new(), 0);
    let throttled = run_iteration(big_dict(3), MemoryOutput::with_window(0), 17);
    assert_eq!(row_lines(&throttled), row_lines(&expected));
}

#[test]
fn test_iteration_pauses_while_output_is_full() {
    let mut conn = connect_with(big_dict(ROW_COUNT), small_buffer_settings(), MemoryOutput::with_window(0));
    request(&mut conn, "I0\t0\tshared/").unwrap();
    drain(&mut conn);

    assert!(conn.iter_flush_pending());
    assert!(conn.output().flush_pending());
    assert_eq!(conn.pending_commands(), 1);
    // paused right after crossing the threshold
    assert!(conn.output().buffer_used_size() <= 128 + 200);

    conn.output_mut().unthrottle();
    conn.handle_event(Event::OutputReady);
    drain(&mut conn);
    assert_eq!(conn.pending_commands(), 0);
    assert!(!conn.iter_flush_pending());
    assert_eq!(row_lines(&take_lines(&mut conn)).len(), ROW_COUNT);
}

#[test]
fn test_output_ready_without_pending_iteration_is_harmless() {
    let dict = ScriptedDict::new();
    let mut conn = connect(dict.clone() as Arc<dyn Dict>);
    conn.handle_event(Event::OutputReady);
    request(&mut conn, "Lshared/k").unwrap();
    dict.complete_lookup(LookupResult::NotFound);
    drain(&mut conn);
    assert_eq!(take_lines(&mut conn).len(), 2);
}

#[test]
fn test_iteration_uncorks_output_when_done() {
    let mut conn = connect_with(big_dict(4), small_buffer_settings(), MemoryOutput::new());
    request(&mut conn, "I0\t0\tshared/").unwrap();
    drain(&mut conn);
    assert_eq!(conn.pending_commands(), 0);
    assert!(!conn.output().is_corked());
    assert_eq!(conn.output().buffer_used_size(), 0);
}

// =============================================================================
// Row Limit Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_prop_max_rows_bounds_row_replies(
        total in 0usize..40,
        max_rows in 1u64..50,
        batch in 1usize..6,
    ) {
        let dict = MemoryDict::with_batch_size(batch);
        for i in 0..total {
            dict.insert(format!("shared/k{i:02}").as_bytes(), b"v", None);
        }
        let mut conn = connect(Arc::new(dict));
        request(&mut conn, &format!("I0\t{max_rows}\tshared/")).unwrap();
        drain(&mut conn);
        prop_assert_eq!(conn.pending_commands(), 0);

        let lines = take_lines(&mut conn);
        let rows = row_lines(&lines).len();
        prop_assert!(rows as u64 <= max_rows);
        prop_assert_eq!(rows, total.min(max_rows as usize));
        prop_assert_eq!(strip_timings(lines.last().unwrap()), format!("+1\t\t{rows}"));
    }
}

#[test]
fn test_scenario_iterate_two_rows() {
    let dict = MemoryDict::new();
    for key in ["shared/a", "shared/b", "shared/c"] {
        dict.insert(key.as_bytes(), b"v", None);
    }
    let mut conn = connect(Arc::new(dict));
    request(&mut conn, "I0\t2\tshared/").unwrap();
    drain(&mut conn);

    let lines = take_lines(&mut conn);
    assert_eq!(lines[1], "+1\tOshared/a\tv");
    assert_eq!(lines[2], "+1\tOshared/b\tv");
    assert_eq!(strip_timings(&lines[3]), "+1\t\t2");
    assert_eq!(lines.len(), 4);
}

// =============================================================================
// Input Flow Tests
// =============================================================================

#[test]
fn test_input_halts_at_pending_limit() {
    let dict = ScriptedDict::new();
    let settings = ConnectionSettings {
        max_pending_commands: 2,
        ..settings()
    };
    let mut conn = connect_with(dict.clone() as Arc<dyn Dict>, settings, MemoryOutput::new());

    request(&mut conn, "Lshared/a").unwrap();
    assert!(conn.wants_input());
    request(&mut conn, "Lshared/b").unwrap();
    assert!(!conn.wants_input());

    dict.complete_lookup(LookupResult::NotFound);
    drain(&mut conn);
    assert!(conn.wants_input());
    assert_eq!(conn.pending_commands(), 1);
}

#[test]
fn test_synchronous_commands_never_halt_input() {
    let dict = ScriptedDict::new();
    let settings = ConnectionSettings {
        max_pending_commands: 1,
        ..settings()
    };
    let mut conn = connect_with(dict.clone() as Arc<dyn Dict>, settings, MemoryOutput::new());

    for line in ["B1", "S1\tshared/a\t1", "U1\tshared/b", "T1\t1\t0", "V1\tno", "R1"] {
        request(&mut conn, line).unwrap();
        assert_eq!(conn.pending_commands(), 0, "{line:?} stayed live");
        assert!(conn.wants_input(), "{line:?} halted input");
    }
    assert!(request(&mut conn, "Sx\tshared/a\t1").is_err());
    assert!(conn.wants_input());
    assert_eq!(conn.refcount(), 1);

    request(&mut conn, "Lshared/a").unwrap();
    assert_eq!(conn.pending_commands(), 1);
    assert!(!conn.wants_input());
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[test]
fn test_destroy_rolls_back_open_transactions() {
    let dict = ScriptedDict::new();
    let mut conn = connect(dict.clone() as Arc<dyn Dict>);
    request(&mut conn, "B1").unwrap();
    request(&mut conn, "B2").unwrap();

    conn.destroy();
    assert!(conn.is_destroyed());
    assert!(conn.is_finished());
    assert!(conn.transactions().is_empty());
    let rollbacks = dict.ops().iter().filter(|op| *op == "rollback").count();
    assert_eq!(rollbacks, 2);
}

#[test]
fn test_destroy_waits_for_pending_lookup() {
    let dict = ScriptedDict::new();
    let mut conn = connect(dict.clone() as Arc<dyn Dict>);
    request(&mut conn, "Lshared/k").unwrap();
    request(&mut conn, "B1").unwrap();

    conn.destroy();
    assert!(!conn.is_finished());
    assert!(conn.has_transaction(1));
    assert!(!conn.wants_input());

    dict.complete_lookup(LookupResult::Found(vec![b"late".to_vec()]));
    drain(&mut conn);
    assert!(conn.is_finished());
    assert!(!conn.has_transaction(1));
    // the reply is discarded with the closed output
    assert_eq!(take_lines(&mut conn), vec!["*1"]);
}

#[test]
fn test_destroy_waits_for_pending_commit() {
    let dict = ScriptedDict::new();
    let mut conn = connect(dict.clone() as Arc<dyn Dict>);
    request(&mut conn, "B1").unwrap();
    request(&mut conn, "C1").unwrap();

    conn.destroy();
    assert!(!conn.is_finished());
    dict.complete_commit(CommitResult::Ok);
    drain(&mut conn);
    assert!(conn.is_finished());
    assert_eq!(dict.ops(), vec!["begin user=- expire=0", "commit"]);
}

#[test]
fn test_destroy_finishes_live_iteration() {
    let mut conn = connect_with(big_dict(5), small_buffer_settings(), MemoryOutput::with_window(0));
    request(&mut conn, "I0\t0\tshared/").unwrap();
    drain(&mut conn);
    assert_eq!(conn.pending_commands(), 1);

    conn.destroy();
    assert_eq!(conn.pending_commands(), 0);
    assert!(conn.is_finished());
    assert!(conn.output().is_closed());
}

#[test]
fn test_line_after_destroy_rejected() {
    let mut conn = connect(Arc::new(MemoryDict::new()));
    conn.destroy();
    assert!(matches!(
        request(&mut conn, "Lshared/k"),
        Err(DictError::ConnectionClosed)
    ));
}

#[test]
fn test_stale_events_after_completion_ignored() {
    let mut conn = connect(Arc::new(MemoryDict::new()));
    conn.handle_event(Event::IterateReady { cmd: 99 });
    conn.handle_event(Event::LookupDone {
        cmd: 99,
        result: LookupResult::NotFound,
    });
    conn.handle_event(Event::CommitDone {
        cmd: 99,
        result: CommitResult::Ok,
    });
    assert!(take_lines(&mut conn).is_empty());
    assert_eq!(conn.refcount(), 1);
}

// =============================================================================
// Stats Tests
// =============================================================================

#[test]
fn test_stats_recorded_with_verbose_proctitle() {
    let stats = Arc::new(CommandStats::new());
    let settings = ConnectionSettings {
        verbose_proctitle: true,
        ..settings()
    };
    let dict = Arc::new(MemoryDict::new());
    let mut conn = DictConnection::new(settings, dict, MemoryOutput::new(), Arc::clone(&stats));
    assert_eq!(stats.clients(), 1);

    request(&mut conn, "Lshared/k").unwrap();
    request(&mut conn, "I0\t0\tshared/").unwrap();
    request(&mut conn, "B1").unwrap();
    request(&mut conn, "C1").unwrap();
    drain(&mut conn);

    assert_eq!(stats.snapshot(StatKind::Lookup).count(), 1);
    assert_eq!(stats.snapshot(StatKind::Iteration).count(), 1);
    assert_eq!(stats.snapshot(StatKind::Commit).count(), 1);

    drop(conn);
    assert_eq!(stats.clients(), 0);
}

#[test]
fn test_stats_not_recorded_by_default() {
    let stats = Arc::new(CommandStats::new());
    let dict = Arc::new(MemoryDict::new());
    let mut conn = DictConnection::new(settings(), dict, MemoryOutput::new(), Arc::clone(&stats));
    request(&mut conn, "Lshared/k").unwrap();
    drain(&mut conn);
    assert_eq!(stats.snapshot(StatKind::Lookup).count(), 0);
}
