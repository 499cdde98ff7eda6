// =============================================================================
// Profiling — per-node execution timing and compile statistics
// =============================================================================
//
// A Session with profiling enabled times every step of every `run` through
// the engine clock and keeps the events here. Reading time through the
// `Clock` trait keeps reports reproducible under a `ScriptedClock`.
//
// COMPONENTS:
//
//   ProfileEvent   — one timed step (node name, algorithm, duration)
//   Profiler       — collects events
//   ProfileReport  — events aggregated per node, printed with Display
//   CompileStats   — what the compilation pipeline did
//   Stopwatch      — manual timer over a Clock

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use vole_core::Clock;

// ---------------------------------------------------------------------------
// ProfileEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEvent {
    /// Node name.
    pub name: String,
    /// Algorithm that ran it (e.g. "conv2d_direct").
    pub category: String,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Profiler
// ---------------------------------------------------------------------------

/// Collects named timing events.
#[derive(Debug, Default)]
pub struct Profiler {
    events: Vec<ProfileEvent>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time `f` on `clock` and record it.
    pub fn measure<F, R>(&mut self, clock: &dyn Clock, name: &str, category: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = clock.now();
        let result = f();
        let duration = clock.now().saturating_sub(start);
        self.record(name, category, duration);
        result
    }

    pub fn record(&mut self, name: &str, category: &str, duration: Duration) {
        self.events.push(ProfileEvent {
            name: name.to_string(),
            category: category.to_string(),
            duration,
        });
    }

    pub fn events(&self) -> &[ProfileEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn total_time(&self) -> Duration {
        self.events.iter().map(|e| e.duration).sum()
    }

    /// Aggregate events by node name, slowest first.
    pub fn report(&self) -> ProfileReport {
        let mut by_name: HashMap<(&str, &str), Vec<Duration>> = HashMap::new();
        for ev in &self.events {
            by_name
                .entry((ev.name.as_str(), ev.category.as_str()))
                .or_default()
                .push(ev.duration);
        }

        let mut entries: Vec<ProfileEntry> = by_name
            .into_iter()
            .map(|((name, category), durations)| {
                let count = durations.len();
                let total: Duration = durations.iter().sum();
                ProfileEntry {
                    name: name.to_string(),
                    category: category.to_string(),
                    count,
                    total,
                    min: durations.iter().min().copied().unwrap_or_default(),
                    max: durations.iter().max().copied().unwrap_or_default(),
                    avg: total / count.max(1) as u32,
                }
            })
            .collect();
        entries.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));

        ProfileReport {
            entries,
            total: self.total_time(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProfileReport
// ---------------------------------------------------------------------------

/// Aggregated statistics for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEntry {
    pub name: String,
    pub category: String,
    pub count: usize,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileReport {
    pub entries: Vec<ProfileEntry>,
    pub total: Duration,
}

impl ProfileReport {
    pub fn entry(&self, name: &str) -> Option<&ProfileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

const RULE: &str =
    "══════════════════════════════════════════════════════════════════════════════════════════";

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔{RULE}╗")?;
        writeln!(f, "║{:^90}║", "Vole Profile Report")?;
        writeln!(f, "╠{RULE}╣")?;
        writeln!(
            f,
            "║ {:<20} {:<18} {:>6} {:>12} {:>12} {:>8} {:>7} ║",
            "Node", "Algorithm", "Count", "Total", "Avg", "Max", "%"
        )?;
        writeln!(f, "╠{RULE}╣")?;
        for e in &self.entries {
            let pct = if self.total.as_nanos() > 0 {
                e.total.as_nanos() as f64 / self.total.as_nanos() as f64 * 100.0
            } else {
                0.0
            };
            writeln!(
                f,
                "║ {:<20} {:<18} {:>6} {:>12} {:>12} {:>8} {:>6.1}% ║",
                truncate_str(&e.name, 20),
                truncate_str(&e.category, 18),
                e.count,
                format_duration(e.total),
                format_duration(e.avg),
                format_duration(e.max),
                pct
            )?;
        }
        writeln!(f, "╠{RULE}╣")?;
        writeln!(f, "║ Total: {:<82}║", format_duration(self.total))?;
        write!(f, "╚{RULE}╝")
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}…")
    } else {
        s.to_string()
    }
}

/// Human-readable byte count (B, KB, MB, GB).
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Human-readable duration with a unit suited to its size.
pub fn format_duration(d: Duration) -> String {
    let ns = d.as_nanos();
    if ns >= 1_000_000_000 {
        format!("{:.2}s", d.as_secs_f64())
    } else if ns >= 1_000_000 {
        format!("{:.2}ms", ns as f64 / 1e6)
    } else if ns >= 1_000 {
        format!("{:.2}µs", ns as f64 / 1e3)
    } else {
        format!("{ns}ns")
    }
}

// ---------------------------------------------------------------------------
// CompileStats
// ---------------------------------------------------------------------------

/// Statistics from one `Engine::compile`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Nodes in the graph handed to the compiler.
    pub num_source_nodes: usize,
    /// Steps in the compiled session.
    pub num_nodes: usize,
    /// Converter nodes left after identity bridges were removed.
    pub num_bridges: usize,
    /// Nodes folded into a convolution.
    pub num_fused: usize,
    /// Nodes whose schedule came from autotuning.
    pub num_tuned: usize,
    /// Buffers placed in the arena (tensors and scratch).
    pub num_buffers: usize,
    pub arena_bytes: usize,
    pub compile_time_us: u64,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session: {} steps ({} source nodes), {} bridges, {} fused, {} tuned, {} buffers in {}, compiled in {}μs",
            self.num_nodes,
            self.num_source_nodes,
            self.num_bridges,
            self.num_fused,
            self.num_tuned,
            self.num_buffers,
            format_bytes(self.arena_bytes),
            self.compile_time_us,
        )
    }
}

// ---------------------------------------------------------------------------
// Stopwatch
// ---------------------------------------------------------------------------

/// Manual timer reading a [`Clock`].
#[derive(Debug)]
pub struct Stopwatch<'a> {
    clock: &'a dyn Clock,
    start: Option<Duration>,
    laps: Vec<Duration>,
}

impl<'a> Stopwatch<'a> {
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self {
            clock,
            start: None,
            laps: Vec::new(),
        }
    }

    /// Start (or restart) the stopwatch.
    pub fn start(&mut self) {
        self.start = Some(self.clock.now());
        self.laps.clear();
    }

    fn elapsed(&self) -> Duration {
        self.start
            .map(|s| self.clock.now().saturating_sub(s))
            .unwrap_or_default()
    }

    /// Record a split without stopping.
    pub fn lap(&mut self) -> Duration {
        let elapsed = self.elapsed();
        self.laps.push(elapsed);
        elapsed
    }

    /// Stop and return the total elapsed time.
    pub fn stop(&mut self) -> Duration {
        let elapsed = self.elapsed();
        self.start = None;
        elapsed
    }

    pub fn laps(&self) -> &[Duration] {
        &self.laps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::ScriptedClock;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_measure_uses_the_clock() {
        let clock = ScriptedClock::new(vec![ms(2)]);
        let mut prof = Profiler::new();
        let out = prof.measure(&clock, "conv1", "conv2d_direct", || 7);
        assert_eq!(out, 7);
        assert_eq!(prof.events()[0].duration, ms(2));
        assert_eq!(clock.reads(), 2);
    }

    #[test]
    fn test_report_aggregates_and_sorts() {
        let mut prof = Profiler::new();
        prof.record("relu", "eltwise", ms(1));
        prof.record("conv", "conv2d_im2col", ms(5));
        prof.record("conv", "conv2d_im2col", ms(3));
        let r = prof.report();
        assert_eq!(r.entries[0].name, "conv");
        let conv = r.entry("conv").unwrap();
        assert_eq!((conv.count, conv.total, conv.avg), (2, ms(8), ms(4)));
        assert_eq!((conv.min, conv.max), (ms(3), ms(5)));
        assert_eq!(r.total, ms(9));
        let text = r.to_string();
        assert!(text.contains("Vole Profile Report"));
        assert!(text.contains("conv2d_im2col"));
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_duration(Duration::from_nanos(15)), "15ns");
        assert_eq!(format_duration(ms(12)), "12.00ms");
    }

    #[test]
    fn test_stopwatch_laps() {
        let clock = ScriptedClock::new(vec![ms(1)]);
        let mut sw = Stopwatch::new(&clock);
        sw.start();
        assert_eq!(sw.lap(), ms(1));
        assert_eq!(sw.stop(), ms(2));
        assert_eq!(sw.laps().len(), 1);
        assert_eq!(sw.stop(), Duration::ZERO);
    }

    #[test]
    fn test_stats_display() {
        let s = CompileStats {
            num_source_nodes: 4,
            num_nodes: 3,
            num_fused: 1,
            arena_bytes: 4096,
            ..CompileStats::default()
        };
        let text = s.to_string();
        assert!(text.contains("3 steps (4 source nodes)"));
        assert!(text.contains("4.00 KB"));
    }
}
