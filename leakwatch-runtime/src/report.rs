//! Leak reports.
//!
//! Leaked chunks are grouped by `(allocation stack, kind)`, symbolized,
//! filtered through suppressions and sorted largest first. The rendered form
//! follows the familiar sanitizer layout:
//!
//! ```text
//! =================================================================
//! ==4242==ERROR: LeakSanitizer: detected memory leaks
//!
//! Direct leak of 64 byte(s) in 1 object(s) allocated from:
//!     #0 0x55d1c0 in demo::make_leak src/main.rs:12
//!
//! SUMMARY: LeakSanitizer: 64 byte(s) leaked in 1 allocation(s).
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write;
use std::time::Duration;

use crate::chunk::ChunkTag;
use crate::classify::{LeakKind, LeakedChunk};
use crate::config::ReportConfig;
use crate::stack::{StackDepot, StackId};
use crate::suppression::SuppressionContext;
use crate::symbolize::{SymbolizedFrame, Symbolizer};

const TOOL_NAME: &str = "LeakSanitizer";
const BANNER: &str = "=================================================================";

/// One group of leaks sharing an allocation stack and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LeakReportEntry {
    /// Shared allocation stack.
    pub stack_id: StackId,
    /// Shared kind.
    pub kind: LeakKind,
    /// Sum of object sizes.
    pub total_bytes: usize,
    /// Number of objects.
    pub object_count: usize,
    /// Object addresses, ascending. Empty unless `report_objects` is set.
    pub objects: Vec<usize>,
    /// Distinct tags of the objects.
    pub tags: Vec<ChunkTag>,
    /// Symbolized allocation stack.
    pub frames: Vec<SymbolizedFrame>,
}

/// Usage of one suppression rule.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SuppressionStat {
    /// The rule's pattern.
    pub pattern: String,
    /// Objects it suppressed.
    pub object_count: usize,
    /// Bytes it suppressed.
    pub total_bytes: usize,
}

/// Chunk and scan counters for one check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CheckSummary {
    /// Chunks tracked when the check ran.
    pub live_chunks: usize,
    /// Chunks proven reachable.
    pub reachable_chunks: usize,
    /// Chunks exempt via ignore requests.
    pub ignored_chunks: usize,
    /// Direct leaks, before suppression.
    pub direct_leaks: usize,
    /// Indirect leaks, before suppression.
    pub indirect_leaks: usize,
    /// Root ranges scanned.
    pub root_ranges: usize,
    /// Ranges abandoned as unreadable.
    pub skipped_ranges: usize,
    /// Bytes scanned.
    pub bytes_scanned: usize,
    /// Time the world was stopped.
    pub stopped_for: Duration,
}

/// Result of one leak check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LeakReport {
    /// Reporting process.
    pub pid: u32,
    /// Unsuppressed leak groups, largest first.
    pub entries: Vec<LeakReportEntry>,
    /// Rules that suppressed something, in rule order.
    pub suppressed: Vec<SuppressionStat>,
    /// Unsuppressed leaked bytes.
    pub total_leaked_bytes: usize,
    /// Unsuppressed leaked objects.
    pub total_leaked_objects: usize,
    /// Suppressed bytes.
    pub suppressed_bytes: usize,
    /// Suppressed objects.
    pub suppressed_objects: usize,
    /// Counters.
    pub summary: CheckSummary,
    /// Entries rendered by `Display` (0 = all).
    #[cfg_attr(feature = "serde", serde(skip))]
    pub max_printed: usize,
    /// Render suppression statistics.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub print_suppressions: bool,
}

impl LeakReport {
    /// Whether any unsuppressed leak was found.
    pub fn has_leaks(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Entries of one kind.
    pub fn entries_of(&self, kind: LeakKind) -> impl Iterator<Item = &LeakReportEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    /// Unsuppressed bytes of one kind.
    pub fn bytes_of(&self, kind: LeakKind) -> usize {
        self.entries_of(kind).map(|entry| entry.total_bytes).sum()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_leaks() {
            writeln!(f, "{}", BANNER)?;
            writeln!(f, "=={}==ERROR: {}: detected memory leaks", self.pid, TOOL_NAME)?;
            let shown = if self.max_printed == 0 {
                self.entries.len()
            } else {
                self.max_printed.min(self.entries.len())
            };
            for entry in &self.entries[..shown] {
                writeln!(f)?;
                writeln!(
                    f,
                    "{} leak of {} byte(s) in {} object(s) allocated from:",
                    entry.kind, entry.total_bytes, entry.object_count
                )?;
                if entry.frames.is_empty() {
                    writeln!(f, "    <empty stack>")?;
                }
                for (index, frame) in entry.frames.iter().enumerate() {
                    writeln!(f, "    #{} {}", index, frame)?;
                }
                if !entry.objects.is_empty() {
                    writeln!(f, "Objects leaked above:")?;
                    for address in &entry.objects {
                        writeln!(f, "{:#x} ({} bytes)", address, entry.total_bytes / entry.object_count.max(1))?;
                    }
                }
            }
            if shown < self.entries.len() {
                writeln!(f)?;
                writeln!(
                    f,
                    "Too many leaks! Only the first {} leaks encountered will be reported.",
                    shown
                )?;
            }
        }

        if self.print_suppressions && !self.suppressed.is_empty() {
            writeln!(f, "-----------------------------------------------------")?;
            writeln!(f, "Suppressions used:")?;
            writeln!(f, "  count      bytes template")?;
            for stat in &self.suppressed {
                writeln!(f, "{:7} {:10} {}", stat.object_count, stat.total_bytes, stat.pattern)?;
            }
            writeln!(f, "-----------------------------------------------------")?;
        }

        if self.has_leaks() {
            writeln!(f)?;
            writeln!(
                f,
                "SUMMARY: {}: {} byte(s) leaked in {} allocation(s).",
                TOOL_NAME, self.total_leaked_bytes, self.total_leaked_objects
            )?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Group {
    total_bytes: usize,
    object_count: usize,
    objects: Vec<usize>,
    tags: Vec<ChunkTag>,
}

/// Turns classified chunks into a [`LeakReport`].
pub struct ReportBuilder<'a> {
    depot: &'a StackDepot,
    symbolizer: &'a dyn Symbolizer,
    suppressions: &'a SuppressionContext,
    config: &'a ReportConfig,
}

impl<'a> ReportBuilder<'a> {
    /// Create a builder.
    pub fn new(
        depot: &'a StackDepot,
        symbolizer: &'a dyn Symbolizer,
        suppressions: &'a SuppressionContext,
        config: &'a ReportConfig,
    ) -> Self {
        Self {
            depot,
            symbolizer,
            suppressions,
            config,
        }
    }

    /// Build the report.
    pub fn build(&self, leaked: &[LeakedChunk], summary: CheckSummary) -> LeakReport {
        let mut groups: BTreeMap<(StackId, LeakKind), Group> = BTreeMap::new();
        for chunk in leaked {
            let group = groups.entry((chunk.stack_id, chunk.kind)).or_default();
            group.total_bytes += chunk.size;
            group.object_count += 1;
            if self.config.report_objects {
                group.objects.push(chunk.address);
            }
            if !group.tags.contains(&chunk.tag) {
                group.tags.push(chunk.tag);
            }
        }

        let mut symbolized: HashMap<StackId, (Vec<SymbolizedFrame>, Option<usize>)> = HashMap::new();
        let mut hits = vec![(0usize, 0usize); self.suppressions.len()];
        let mut report = LeakReport {
            pid: std::process::id(),
            summary,
            max_printed: self.config.max_leaks,
            print_suppressions: self.config.print_suppressions,
            ..LeakReport::default()
        };

        for ((stack_id, kind), mut group) in groups {
            let (frames, rule) = symbolized
                .entry(stack_id)
                .or_insert_with(|| {
                    let frames = self.symbolize_stack(stack_id);
                    let rule = self.suppressions.match_frames(&frames);
                    (frames, rule)
                })
                .clone();

            if let Some(rule) = rule {
                hits[rule].0 += group.object_count;
                hits[rule].1 += group.total_bytes;
                report.suppressed_objects += group.object_count;
                report.suppressed_bytes += group.total_bytes;
                continue;
            }

            report.total_leaked_bytes += group.total_bytes;
            report.total_leaked_objects += group.object_count;
            group.objects.sort_unstable();
            group.tags.sort();
            report.entries.push(LeakReportEntry {
                stack_id,
                kind,
                total_bytes: group.total_bytes,
                object_count: group.object_count,
                objects: group.objects,
                tags: group.tags,
                frames,
            });
        }

        report.entries.sort_by(|a, b| {
            b.total_bytes
                .cmp(&a.total_bytes)
                .then(a.kind.cmp(&b.kind))
                .then(a.stack_id.cmp(&b.stack_id))
        });

        report.suppressed = self
            .suppressions
            .rules()
            .iter()
            .zip(hits)
            .filter(|(_, (count, _))| *count > 0)
            .map(|(rule, (object_count, total_bytes))| SuppressionStat {
                pattern: rule.pattern.clone(),
                object_count,
                total_bytes,
            })
            .collect();

        report
    }

    fn symbolize_stack(&self, stack_id: StackId) -> Vec<SymbolizedFrame> {
        self.depot
            .get(stack_id)
            .map(|trace| {
                trace
                    .iter()
                    .flat_map(|&address| self.symbolizer.symbolize(address))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Where finished reports go.
pub trait ReportSink: Send + Sync {
    /// Deliver a report with at least one unsuppressed leak, or with
    /// suppression statistics to show.
    fn emit(&self, report: &LeakReport);
}

/// Writes rendered reports to standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl ReportSink for StderrSink {
    fn emit(&self, report: &LeakReport) {
        let rendered = report.to_string();
        let _ = std::io::stderr().lock().write_all(rendered.as_bytes());
    }
}

impl<F> ReportSink for F
where
    F: Fn(&LeakReport) + Send + Sync,
{
    fn emit(&self, report: &LeakReport) {
        self(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolize::NullSymbolizer;
    use crate::thread::ThreadId;

    struct NamedSymbolizer;

    impl Symbolizer for NamedSymbolizer {
        fn symbolize(&self, address: usize) -> Vec<SymbolizedFrame> {
            vec![SymbolizedFrame {
                function: Some(format!("fn_{:x}", address)),
                ..SymbolizedFrame::unknown(address)
            }]
        }
    }

    fn leak(address: usize, size: usize, stack_id: StackId, kind: LeakKind) -> LeakedChunk {
        LeakedChunk {
            address,
            size,
            stack_id,
            thread_id: ThreadId(1),
            tag: ChunkTag::GENERIC,
            kind,
        }
    }

    #[test]
    fn test_grouping_and_order() {
        let depot = StackDepot::new();
        let a = depot.intern(&[0xa]);
        let b = depot.intern(&[0xb]);
        let leaks = [
            leak(0x1000, 10, a, LeakKind::Direct),
            leak(0x2000, 10, a, LeakKind::Direct),
            leak(0x3000, 50, b, LeakKind::Indirect),
            leak(0x4000, 20, a, LeakKind::Indirect),
            leak(0x5000, 20, b, LeakKind::Direct),
        ];
        let config = ReportConfig::default();
        let suppressions = SuppressionContext::new();
        let report = ReportBuilder::new(&depot, &NullSymbolizer, &suppressions, &config)
            .build(&leaks, CheckSummary::default());

        let order: Vec<(StackId, LeakKind, usize)> = report
            .entries
            .iter()
            .map(|e| (e.stack_id, e.kind, e.total_bytes))
            .collect();
        assert_eq!(
            order,
            vec![
                (b, LeakKind::Indirect, 50),
                (a, LeakKind::Direct, 20),
                (b, LeakKind::Direct, 20),
                (a, LeakKind::Indirect, 20),
            ]
        );
        assert_eq!(report.entries[1].object_count, 2);
        assert!(report.entries[1].objects.is_empty());
        assert_eq!(report.total_leaked_bytes, 110);
        assert_eq!(report.total_leaked_objects, 5);
        assert_eq!(report.bytes_of(LeakKind::Direct), 40);
    }

    #[test]
    fn test_report_objects() {
        let depot = StackDepot::new();
        let a = depot.intern(&[0xa]);
        let leaks = [leak(0x2000, 8, a, LeakKind::Direct), leak(0x1000, 8, a, LeakKind::Direct)];
        let config = ReportConfig {
            report_objects: true,
            ..ReportConfig::default()
        };
        let suppressions = SuppressionContext::new();
        let report = ReportBuilder::new(&depot, &NullSymbolizer, &suppressions, &config)
            .build(&leaks, CheckSummary::default());
        assert_eq!(report.entries[0].objects, vec![0x1000, 0x2000]);
        assert!(report.to_string().contains("0x1000 (8 bytes)"));
    }

    #[test]
    fn test_suppression_accounting() {
        let depot = StackDepot::new();
        let noisy = depot.intern(&[0xbad]);
        let real = depot.intern(&[0x600d]);
        let leaks = [
            leak(0x1000, 100, noisy, LeakKind::Direct),
            leak(0x2000, 28, noisy, LeakKind::Indirect),
            leak(0x3000, 7, real, LeakKind::Direct),
        ];
        let config = ReportConfig::default();
        let suppressions = SuppressionContext::parse("leak:unused\nleak:fn_bad").unwrap();
        let report = ReportBuilder::new(&depot, &NamedSymbolizer, &suppressions, &config)
            .build(&leaks, CheckSummary::default());

        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.total_leaked_bytes, 7);
        assert_eq!(report.suppressed_bytes, 128);
        assert_eq!(report.suppressed_objects, 2);
        assert_eq!(
            report.suppressed,
            vec![SuppressionStat {
                pattern: "fn_bad".into(),
                object_count: 2,
                total_bytes: 128
            }]
        );
        let text = report.to_string();
        assert!(text.contains("Suppressions used:"));
        assert!(text.contains("fn_bad"));
    }

    #[test]
    fn test_all_suppressed_has_no_leaks() {
        let depot = StackDepot::new();
        let noisy = depot.intern(&[0xbad]);
        let config = ReportConfig::default();
        let suppressions = SuppressionContext::parse("leak:fn_bad").unwrap();
        let report = ReportBuilder::new(&depot, &NamedSymbolizer, &suppressions, &config)
            .build(&[leak(0x1000, 4, noisy, LeakKind::Direct)], CheckSummary::default());
        assert!(!report.has_leaks());
        assert!(!report.to_string().contains("SUMMARY"));
    }

    #[test]
    fn test_render_layout_and_limit() {
        let depot = StackDepot::new();
        let leaks: Vec<LeakedChunk> = (0..3)
            .map(|i| leak(0x1000 * (i + 1), 8 * (i + 1), depot.intern(&[0x100 + i]), LeakKind::Direct))
            .collect();
        let config = ReportConfig {
            max_leaks: 2,
            ..ReportConfig::default()
        };
        let suppressions = SuppressionContext::new();
        let report = ReportBuilder::new(&depot, &NamedSymbolizer, &suppressions, &config)
            .build(&leaks, CheckSummary::default());
        let text = report.to_string();

        assert!(text.contains("ERROR: LeakSanitizer: detected memory leaks"));
        assert!(text.contains("Direct leak of 24 byte(s) in 1 object(s) allocated from:"));
        assert!(text.contains("    #0 0x102 in fn_102"));
        assert!(text.contains("Direct leak of 16 byte(s)"));
        assert!(!text.contains("Direct leak of 8 byte(s)"));
        assert!(text.contains("Too many leaks!"));
        // Totals still cover everything.
        assert!(text.contains("SUMMARY: LeakSanitizer: 48 byte(s) leaked in 3 allocation(s)."));
    }

    #[test]
    fn test_empty_stack_renders_placeholder() {
        let depot = StackDepot::new();
        let config = ReportConfig::default();
        let suppressions = SuppressionContext::new();
        let report = ReportBuilder::new(&depot, &NullSymbolizer, &suppressions, &config)
            .build(&[leak(0x1000, 4, StackId::EMPTY, LeakKind::Direct)], CheckSummary::default());
        assert!(report.to_string().contains("<empty stack>"));
    }

    #[test]
    fn test_closure_sink() {
        let seen = std::sync::Mutex::new(0);
        let sink = |report: &LeakReport| *seen.lock().unwrap() += report.entries.len();
        sink.emit(&LeakReport::default());
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
