//! Bad-condition detection and the event journal.
//!
//! Each target carries a [`BadStateTracker`]; once per metrics refresh the
//! [`EventLog`] evaluates the target's metrics against the thresholds and
//! drives the tracker. A condition must persist for
//! [`BAD_CONDITION_DURATION_S`] seconds before an event fires, and a
//! contiguous bad period emits at most one event no matter how long it lasts.
//!
//! Emitted events land in an in-memory ring (for snapshot replay to new
//! observers) and are appended to a line-delimited journal file. The journal
//! is best-effort: an append failure is logged and otherwise ignored.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::config::{Thresholds, BAD_CONDITION_DURATION_S};
use crate::ring::RingBuffer;
use crate::stats::Metrics;

/// Capacity of the in-memory event ring.
pub const EVENT_BUFFER_SIZE: usize = 100;

/// Which threshold a bad period was classified under. When several exceed at
/// once, loss wins over p95, p95 over jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    BadLoss,
    BadP95,
    BadJitter,
}

impl EventType {
    /// The metric key used in journal and wire payloads.
    pub fn metric_field(self) -> &'static str {
        match self {
            EventType::BadLoss => "loss_pct",
            EventType::BadP95 => "p95_ms",
            EventType::BadJitter => "jitter_ms",
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            EventType::BadLoss => "loss_pct exceeded threshold",
            EventType::BadP95 => "p95_ms exceeded threshold",
            EventType::BadJitter => "jitter_ms exceeded threshold",
        }
    }
}

/// One sustained-degradation record.
#[derive(Debug, Clone)]
pub struct Event {
    /// Wall-clock stamp for display.
    pub timestamp_wall_ms: u64,
    pub target_id: String,
    pub event_type: EventType,
    pub reason: String,
    /// The offending metric's value at emission time.
    pub value: f64,
    pub threshold: f64,
    /// Whole seconds the condition had persisted when the event fired.
    pub duration_s: u32,
}

/// Per-target hysteresis state.
#[derive(Debug, Clone, Copy, Default)]
pub struct BadStateTracker {
    is_bad: bool,
    bad_start_monotonic_ms: u64,
    event_emitted: bool,
    last_bad_type: Option<EventType>,
}

impl BadStateTracker {
    pub fn is_bad(&self) -> bool {
        self.is_bad
    }

    pub fn last_bad_type(&self) -> Option<EventType> {
        self.last_bad_type
    }
}

/// In-memory event ring plus the append-only journal.
pub struct EventLog {
    events: RingBuffer<Event>,
    journal_path: Option<PathBuf>,
}

impl EventLog {
    /// `journal_path` is typically `<data_dir>/events.jsonl`; pass `None` to
    /// keep events in memory only.
    pub fn new(journal_path: Option<PathBuf>) -> Self {
        Self {
            events: RingBuffer::new(EVENT_BUFFER_SIZE),
            journal_path,
        }
    }

    /// Recent events, oldest first.
    pub fn recent(&self) -> &RingBuffer<Event> {
        &self.events
    }

    /// Evaluates one metrics refresh for one target and advances its tracker.
    /// Returns the emitted event, if this refresh crossed the dwell time.
    pub fn check(
        &mut self,
        state: &mut BadStateTracker,
        target_id: &str,
        metrics: &Metrics,
        thresholds: &Thresholds,
        now_monotonic_ms: u64,
        now_wall_ms: u64,
    ) -> Option<Event> {
        let exceeded = classify(metrics, thresholds);

        let (bad_type, value, threshold) = match exceeded {
            Some(hit) => hit,
            None => {
                // Conditions cleared; the next bad period starts fresh.
                state.is_bad = false;
                state.event_emitted = false;
                return None;
            }
        };

        if !state.is_bad {
            state.is_bad = true;
            state.bad_start_monotonic_ms = now_monotonic_ms;
            state.event_emitted = false;
            state.last_bad_type = Some(bad_type);
        }

        let duration_s = ((now_monotonic_ms - state.bad_start_monotonic_ms) / 1000) as u32;
        if duration_s < BAD_CONDITION_DURATION_S || state.event_emitted {
            return None;
        }

        let event = Event {
            timestamp_wall_ms: now_wall_ms,
            target_id: target_id.to_string(),
            event_type: bad_type,
            reason: bad_type.reason().to_string(),
            value,
            threshold,
            duration_s,
        };

        self.events.push(event.clone());
        self.append_journal(&event);
        state.event_emitted = true;

        Some(event)
    }

    /// Appends one journal line. Failures are swallowed; the in-memory ring
    /// still holds the event for observers.
    fn append_journal(&self, event: &Event) {
        let Some(path) = self.journal_path.as_ref() else {
            return;
        };
        let line = journal_line(event);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::debug!("event journal append failed: {e}");
        }
    }
}

/// Renders the journal record. Formatted by hand so the value and threshold
/// always carry exactly two decimals.
fn journal_line(event: &Event) -> String {
    format!(
        "{{\"ts\":{},\"target_id\":\"{}\",\"reason\":\"{}\",\"details\":{{\"{}\":{:.2},\"threshold\":{:.2},\"duration_s\":{}}}}}",
        event.timestamp_wall_ms,
        event.target_id,
        event.reason,
        event.event_type.metric_field(),
        event.value,
        event.threshold,
        event.duration_s,
    )
}

/// First exceeded threshold in priority order, with its value and limit.
fn classify(metrics: &Metrics, thresholds: &Thresholds) -> Option<(EventType, f64, f64)> {
    if metrics.loss_pct > thresholds.loss_pct {
        Some((EventType::BadLoss, metrics.loss_pct, thresholds.loss_pct))
    } else if metrics.p95_ms > thresholds.p95_ms {
        Some((EventType::BadP95, metrics.p95_ms, thresholds.p95_ms))
    } else if metrics.jitter_ms > thresholds.jitter_ms {
        Some((EventType::BadJitter, metrics.jitter_ms, thresholds.jitter_ms))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with_p95(p95_ms: f64) -> Metrics {
        Metrics {
            p95_ms,
            ..Metrics::default()
        }
    }

    fn check_at(
        log: &mut EventLog,
        state: &mut BadStateTracker,
        metrics: &Metrics,
        now_ms: u64,
    ) -> Option<Event> {
        log.check(
            state,
            "test-target",
            metrics,
            &Thresholds::default(),
            now_ms,
            1_000_000 + now_ms,
        )
    }

    #[test]
    fn test_no_event_below_thresholds() {
        let mut log = EventLog::new(None);
        let mut state = BadStateTracker::default();
        let m = metrics_with_p95(50.0);
        for t in (0..20_000).step_by(1000) {
            assert!(check_at(&mut log, &mut state, &m, t).is_none());
        }
        assert!(!state.is_bad());
    }

    #[test]
    fn test_short_degradation_is_suppressed() {
        let mut log = EventLog::new(None);
        let mut state = BadStateTracker::default();
        let bad = metrics_with_p95(500.0);
        let good = metrics_with_p95(10.0);

        // Bad for 9 seconds, then recovery: no event.
        for t in (0..=9_000).step_by(1000) {
            assert!(check_at(&mut log, &mut state, &bad, t).is_none());
        }
        assert!(check_at(&mut log, &mut state, &good, 10_000).is_none());
        assert!(!state.is_bad());
        assert_eq!(log.recent().count(), 0);
    }

    #[test]
    fn test_sustained_degradation_emits_once() {
        let mut log = EventLog::new(None);
        let mut state = BadStateTracker::default();
        let bad = metrics_with_p95(500.0);

        let mut emitted = Vec::new();
        for t in (0..=30_000).step_by(1000) {
            if let Some(e) = check_at(&mut log, &mut state, &bad, t) {
                emitted.push((t, e));
            }
        }

        assert_eq!(emitted.len(), 1);
        let (t, event) = &emitted[0];
        assert_eq!(*t, 10_000);
        assert_eq!(event.event_type, EventType::BadP95);
        assert_eq!(event.value, 500.0);
        assert_eq!(event.threshold, 100.0);
        assert_eq!(event.duration_s, 10);
        assert_eq!(log.recent().count(), 1);
        assert!(state.is_bad());
        assert_eq!(state.last_bad_type(), Some(EventType::BadP95));
    }

    #[test]
    fn test_recovery_rearms_the_tracker() {
        let mut log = EventLog::new(None);
        let mut state = BadStateTracker::default();
        let bad = metrics_with_p95(500.0);
        let good = metrics_with_p95(10.0);

        let mut count = 0;
        for t in (0..=12_000).step_by(1000) {
            count += check_at(&mut log, &mut state, &bad, t).is_some() as usize;
        }
        assert_eq!(count, 1);

        check_at(&mut log, &mut state, &good, 13_000);

        // A second bad period fires again after its own dwell.
        for t in (14_000..=24_000).step_by(1000) {
            count += check_at(&mut log, &mut state, &bad, t).is_some() as usize;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_classification_priority() {
        let thresholds = Thresholds::default();
        let all_bad = Metrics {
            loss_pct: 50.0,
            p95_ms: 500.0,
            jitter_ms: 100.0,
            ..Metrics::default()
        };
        let (t, value, limit) = classify(&all_bad, &thresholds).unwrap();
        assert_eq!(t, EventType::BadLoss);
        assert_eq!(value, 50.0);
        assert_eq!(limit, 5.0);

        let p95_and_jitter = Metrics {
            p95_ms: 500.0,
            jitter_ms: 100.0,
            ..Metrics::default()
        };
        let (t, _, _) = classify(&p95_and_jitter, &thresholds).unwrap();
        assert_eq!(t, EventType::BadP95);

        let jitter_only = Metrics {
            jitter_ms: 100.0,
            ..Metrics::default()
        };
        let (t, _, _) = classify(&jitter_only, &thresholds).unwrap();
        assert_eq!(t, EventType::BadJitter);
    }

    #[test]
    fn test_journal_line_format() {
        let event = Event {
            timestamp_wall_ms: 1700000000123,
            target_id: "cloudflare".into(),
            event_type: EventType::BadP95,
            reason: EventType::BadP95.reason().to_string(),
            value: 500.0,
            threshold: 100.0,
            duration_s: 11,
        };
        assert_eq!(
            journal_line(&event),
            "{\"ts\":1700000000123,\"target_id\":\"cloudflare\",\"reason\":\"p95_ms exceeded threshold\",\
             \"details\":{\"p95_ms\":500.00,\"threshold\":100.00,\"duration_s\":11}}"
        );
    }

    #[test]
    fn test_journal_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut log = EventLog::new(Some(path.clone()));
        let mut state = BadStateTracker::default();
        let bad = Metrics {
            loss_pct: 42.5,
            ..Metrics::default()
        };

        for t in (0..=10_000).step_by(1000) {
            check_at(&mut log, &mut state, &bad, t);
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"loss_pct\":42.50"));
        assert!(lines[0].contains("\"threshold\":5.00"));
        assert!(lines[0].contains("\"duration_s\":10"));
    }
}
