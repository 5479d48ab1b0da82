//! End-to-end leak check scenarios over a synthetic address space.

mod common;

use common::{sim_config, Sim, GLOBALS, WORD};
use leakwatch_runtime::{ChunkState, ChunkTag, DetectorConfig, IgnoreOutcome, LeakKind, RegistryError};

#[test]
fn test_pointer_in_global_is_not_a_leak() {
    let sim = Sim::new();
    let a = sim.alloc(64);
    sim.set_global(0, a);
    let report = sim.check();
    assert!(!report.has_leaks());
    assert_eq!(report.summary.reachable_chunks, 1);
}

#[test]
fn test_cleared_pointer_is_a_direct_leak() {
    let sim = Sim::new();
    let a = sim.alloc(40);
    sim.set_global(0, a);
    assert!(!sim.check().has_leaks());

    sim.set_global(0, 0);
    let report = sim.check();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].kind, LeakKind::Direct);
    assert_eq!(report.entries[0].total_bytes, 40);
    assert_eq!(report.entries[0].object_count, 1);
    assert_eq!(report.total_leaked_bytes, 40);
}

#[test]
fn test_indirect_leak_chain() {
    let sim = Sim::new();
    let a = sim.alloc_at(32, 0xa);
    let b = sim.alloc_at(24, 0xb);
    sim.store(a, b);
    let report = sim.check();

    assert_eq!(report.summary.direct_leaks, 1);
    assert_eq!(report.summary.indirect_leaks, 1);
    assert_eq!(report.bytes_of(LeakKind::Direct), 32);
    assert_eq!(report.bytes_of(LeakKind::Indirect), 24);
}

#[test]
fn test_cycle_terminates_and_leaks_both() {
    let sim = Sim::new();
    let a = sim.alloc(48);
    let b = sim.alloc(80);
    sim.store(a, b);
    sim.store(b + WORD, a);
    let report = sim.check();

    assert_eq!(report.total_leaked_objects, 2);
    assert_eq!(report.total_leaked_bytes, 128);
    // Each member is referenced by the other.
    assert_eq!(report.summary.direct_leaks, 0);
    assert_eq!(report.summary.indirect_leaks, 2);
}

#[test]
fn test_reachable_cycle_is_not_a_leak() {
    let sim = Sim::new();
    let a = sim.alloc(16);
    let b = sim.alloc(16);
    sim.store(a, b);
    sim.store(b, a);
    sim.set_global(3, b);
    assert!(!sim.check().has_leaks());
}

#[test]
fn test_long_chain_from_global() {
    let sim = Sim::new();
    let head = sim.alloc(16);
    let mut tail = head;
    for _ in 0..5000 {
        let next = sim.alloc(16);
        sim.store(tail, next);
        tail = next;
    }
    sim.set_global(0, head);
    let report = sim.check();
    assert!(!report.has_leaks());
    assert_eq!(report.summary.reachable_chunks, 5001);
}

#[test]
fn test_interior_pointer_keeps_chunk_alive() {
    let sim = Sim::new();
    let a = sim.alloc(256);
    sim.set_global(0, a + 200);
    assert!(!sim.check().has_leaks());

    // One past the end does not count.
    sim.set_global(0, a + 256);
    assert!(sim.check().has_leaks());
}

#[test]
fn test_classification_partitions_live_chunks() {
    let sim = Sim::new();
    let reachable = sim.alloc(16);
    let child = sim.alloc(16);
    let leaked = sim.alloc(16);
    let leaked_child = sim.alloc(16);
    sim.alloc_with(16, 1, ChunkState::IgnoreRequested, ChunkTag::GENERIC);
    sim.set_global(0, reachable);
    sim.store(reachable, child);
    sim.store(leaked, leaked_child);

    let report = sim.check();
    let s = report.summary;
    assert_eq!(s.reachable_chunks, 2);
    assert_eq!(s.direct_leaks, 1);
    assert_eq!(s.indirect_leaks, 1);
    assert_eq!(s.ignored_chunks, 1);
    assert_eq!(
        s.reachable_chunks + s.direct_leaks + s.indirect_leaks + s.ignored_chunks,
        s.live_chunks
    );
}

#[test]
fn test_free_then_lookup_and_double_free() {
    let sim = Sim::new();
    let a = sim.alloc(32);
    assert!(sim.detector.chunks().find_containing(a + 8).is_some());
    assert!(sim.free(a));
    assert!(sim.detector.chunks().find_containing(a).is_none());
    assert_eq!(
        sim.detector.chunks().on_free(a),
        Err(RegistryError::UntrackedFree { address: a })
    );
    assert!(!sim.free(a));
    assert_eq!(sim.detector.stats().untracked_frees, 1);
}

#[test]
fn test_freed_chunk_is_never_reported() {
    let sim = Sim::new();
    let a = sim.alloc(32);
    sim.free(a);
    assert!(!sim.check().has_leaks());
}

#[test]
fn test_ignored_object_is_exempt() {
    let sim = Sim::new();
    let a = sim.alloc(32);
    assert_eq!(sim.detector.ignore_object(a), Ok(IgnoreOutcome::Ignored));
    let report = sim.check();
    assert!(!report.has_leaks());
    assert_eq!(report.summary.ignored_chunks, 1);
}

#[test]
fn test_ignored_object_as_root_keeps_children_alive() {
    let sim = Sim::new();
    let a = sim.alloc(32);
    let b = sim.alloc(16);
    sim.store(a, b);
    sim.detector.ignore_object(a).unwrap();
    assert!(!sim.check().has_leaks());
}

#[test]
fn test_ignored_object_children_leak_when_not_roots() {
    let config = DetectorConfig {
        scan: leakwatch_runtime::config::ScanConfig {
            ignored_objects_are_roots: false,
            ..sim_config().scan
        },
        ..sim_config()
    };
    let sim = Sim::with_config(config);
    let a = sim.alloc_at(32, 0xa);
    let b = sim.alloc_at(16, 0xb);
    sim.store(a, b);
    sim.detector.ignore_object(a).unwrap();

    let report = sim.check();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.total_leaked_bytes, 16);
    assert_eq!(report.summary.ignored_chunks, 1);

    // Once the ignored object is reachable, so is everything it points to.
    sim.set_global(0, a);
    assert!(!sim.check().has_leaks());
}

#[test]
fn test_root_region_is_scanned() {
    let sim = Sim::new();
    let a = sim.alloc(32);
    let region = 0x40_0000;
    sim.memory.map_zeroed(region, 128).unwrap();
    sim.store(region + 64, a);
    assert!(sim.check().has_leaks());

    sim.detector.register_root_region(region, 128).unwrap();
    assert!(!sim.check().has_leaks());
}

#[test]
fn test_unreadable_root_is_skipped() {
    let sim = Sim::new();
    let a = sim.alloc(32);
    sim.set_global(0, a);
    sim.detector.register_root_region(0x7000_0000, 4096).unwrap();
    let report = sim.check();
    assert!(!report.has_leaks());
    assert_eq!(report.summary.skipped_ranges, 1);
    assert_eq!(sim.detector.stats().skipped_ranges, 1);
}

#[test]
fn test_unreadable_chunk_does_not_abort_scan() {
    let sim = Sim::new();
    let a = sim.alloc(32);
    let b = sim.alloc(32);
    sim.set_global(0, a);
    sim.set_global(1, b);
    sim.memory.unmap(a);
    let report = sim.check();
    assert!(!report.has_leaks());
    assert_eq!(report.summary.reachable_chunks, 2);
    assert_eq!(report.summary.skipped_ranges, 1);
}

#[test]
fn test_unaligned_pointer_needs_unaligned_scan() {
    let sim = Sim::new();
    let a = sim.alloc(32);
    sim.memory.write(GLOBALS + 3, &a.to_ne_bytes()).unwrap();
    assert!(sim.check().has_leaks());

    let mut config = sim.detector.config();
    config.scan.use_unaligned = true;
    sim.detector.set_config(config);
    assert!(!sim.check().has_leaks());
}

#[test]
fn test_leaks_grouped_by_site_and_sorted() {
    let sim = Sim::new();
    for _ in 0..3 {
        sim.alloc_at(10, 0x100);
    }
    sim.alloc_at(100, 0x200);
    sim.alloc_at(5, 0x300);
    let report = sim.check();

    let sizes: Vec<(usize, usize)> = report
        .entries
        .iter()
        .map(|e| (e.total_bytes, e.object_count))
        .collect();
    assert_eq!(sizes, vec![(100, 1), (30, 3), (5, 1)]);
    assert_eq!(
        report.entries[1].frames[0].function.as_deref(),
        Some("site_100")
    );
    assert_eq!(report.total_leaked_objects, 5);
}

#[test]
fn test_suppressions_drop_entries_but_count_them() {
    let sim = Sim::new();
    sim.alloc_at(10, 0xdead);
    sim.alloc_at(10, 0xdead);
    sim.alloc_at(7, 0xbeef);
    sim.detector.add_suppressions("leak:^site_dead$").unwrap();

    let report = sim.check();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.total_leaked_bytes, 7);
    assert_eq!(report.suppressed_bytes, 20);
    assert_eq!(report.suppressed_objects, 2);
    assert_eq!(report.suppressed[0].pattern, "^site_dead$");
    assert_eq!(report.suppressed[0].object_count, 2);
}

#[test]
fn test_fully_suppressed_check_is_clean() {
    let sim = Sim::new();
    sim.alloc_at(10, 0xdead);
    sim.detector.add_suppressions("leak:site_dead").unwrap();
    assert!(!sim.detector.do_leak_check());
    // Suppression statistics are still emitted.
    assert_eq!(sim.emitted.lock().len(), 1);
}

#[test]
fn test_tags_and_objects_in_report() {
    let mut config = sim_config();
    config.report.report_objects = true;
    let sim = Sim::with_config(config);
    let a = sim.alloc_with(16, 0x5, ChunkState::Unmarked, ChunkTag::new("cache"));
    let b = sim.alloc_with(16, 0x5, ChunkState::Unmarked, ChunkTag::new("parser"));
    let report = sim.check();

    assert_eq!(report.entries.len(), 1);
    let entry = &report.entries[0];
    assert_eq!(entry.objects, vec![a, b]);
    let tags: Vec<&str> = entry.tags.iter().map(|t| t.as_str()).collect();
    assert_eq!(tags, vec!["cache", "parser"]);
}

#[test]
fn test_rendered_report() {
    let sim = Sim::new();
    let a = sim.alloc_at(32, 0xa);
    let b = sim.alloc_at(24, 0xb);
    sim.store(a, b);
    let text = sim.check().to_string();
    assert!(text.contains("Direct leak of 32 byte(s) in 1 object(s) allocated from:"));
    assert!(text.contains("Indirect leak of 24 byte(s) in 1 object(s) allocated from:"));
    assert!(text.contains("#0 0xa in site_a sim.rs:1"));
    assert!(text.contains("SUMMARY: LeakSanitizer: 56 byte(s) leaked in 2 allocation(s)."));
}

#[test]
fn test_globals_disabled() {
    let mut config = sim_config();
    config.scan.use_globals = false;
    let sim = Sim::with_config(config);
    let a = sim.alloc(16);
    sim.set_global(0, a);
    assert!(sim.check().has_leaks());
}
