//! Cooperative probe scheduler.
//!
//! Owns all per-target runtime state and drives it from a single thread. One
//! [`Scheduler::tick`] walks every target's probe state machine, records
//! finished probes as samples, refreshes metrics on a fixed one-second
//! cadence, and reports how long the embedding event loop may sleep before
//! the next piece of useful work.
//!
//! Samples, metrics and events leave the scheduler only through the three
//! registered callbacks. Callbacks run synchronously on the scheduler's
//! thread and receive borrowed arguments; an embedder that fans out to other
//! threads must copy them before returning.

use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{Config, ConfigUpdate, Target, DEFAULT_WINDOW_SIZE};
use crate::error::CoreError;
use crate::event::{BadStateTracker, Event, EventLog};
use crate::probe::{PendingProbe, ProbeDriver, ProbeOutcome};
use crate::ring::RingBuffer;
use crate::stats::{self, Metrics, Sample};

pub type SampleCallback = Box<dyn FnMut(&str, &Sample) + Send>;
pub type MetricsCallback = Box<dyn FnMut(&str, &Metrics) + Send>;
pub type EventCallback = Box<dyn FnMut(&Event) + Send>;

/// Metrics are recomputed at this cadence, independent of probe cadence.
const METRICS_REFRESH_MS: u64 = 1000;
/// Upper bound on the wait suggested by [`Scheduler::tick`].
const DEFAULT_TICK_WAIT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Idle,
    /// A non-blocking connect is in flight (TCP mode only).
    Connecting,
    /// Transient; completion paths normally reset straight to `Idle`.
    Done,
}

/// Everything the scheduler holds for one target.
pub struct TargetRuntime {
    target: Target,
    samples: RingBuffer<Sample>,
    metrics: Metrics,
    bad_state: BadStateTracker,
    probe_state: ProbeState,
    in_flight: Option<Box<dyn PendingProbe>>,
    probe_start_ms: u64,
    next_probe_ms: u64,
    scratch: Vec<f64>,
}

impl TargetRuntime {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn samples(&self) -> &RingBuffer<Sample> {
        &self.samples
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn bad_state(&self) -> &BadStateTracker {
        &self.bad_state
    }
}

enum StartResult {
    InFlight(Box<dyn PendingProbe>),
    Finished { success: bool, rtt_ms: f64 },
}

pub struct Scheduler {
    config: Config,
    driver: ProbeDriver,
    clock: Arc<dyn Clock>,
    targets: Vec<TargetRuntime>,
    event_log: EventLog,
    last_metrics_update_ms: u64,
    running: bool,
    on_sample: Option<SampleCallback>,
    on_metrics: Option<MetricsCallback>,
    on_event: Option<EventCallback>,
}

impl Scheduler {
    /// Builds the scheduler and performs the initial target sync; every
    /// configured target fires on the first tick.
    pub fn new(
        config: Config,
        driver: ProbeDriver,
        clock: Arc<dyn Clock>,
        journal_path: Option<PathBuf>,
    ) -> Self {
        let mut scheduler = Self {
            config,
            driver,
            clock,
            targets: Vec::new(),
            event_log: EventLog::new(journal_path),
            last_metrics_update_ms: 0,
            running: true,
            on_sample: None,
            on_metrics: None,
            on_event: None,
        };
        scheduler.sync_targets();
        scheduler
    }

    /// Called with the target id and the freshly recorded sample, in strict
    /// recording order per target.
    pub fn set_on_sample(&mut self, cb: SampleCallback) {
        self.on_sample = Some(cb);
    }

    /// Called per target on every metrics refresh, before any event callback
    /// from the same refresh.
    pub fn set_on_metrics(&mut self, cb: MetricsCallback) {
        self.on_metrics = Some(cb);
    }

    pub fn set_on_event(&mut self, cb: EventCallback) {
        self.on_event = Some(cb);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &RingBuffer<Event> {
        self.event_log.recent()
    }

    pub fn get_target(&self, id: &str) -> Option<&TargetRuntime> {
        self.targets.iter().find(|rt| rt.target.id == id)
    }

    /// Applies a partial settings patch. Takes effect on the next probe or
    /// metrics cycle; no target state is touched.
    pub fn update_config(&mut self, update: &ConfigUpdate) {
        self.config.apply_update(update);
    }

    /// Adds a target to the configuration and re-syncs. Returns the new
    /// target (with its derived id) on success; the configuration is
    /// unchanged on error.
    pub fn add_target(&mut self, host: &str, port: u16, label: &str) -> Result<Target, CoreError> {
        let target = self.config.add_target(host, port, label)?.clone();
        self.sync_targets();
        Ok(target)
    }

    pub fn remove_target(&mut self, id: &str) -> Result<(), CoreError> {
        self.config.remove_target(id)?;
        self.sync_targets();
        Ok(())
    }

    /// Destructive re-sync from the configuration: releases every in-flight
    /// handle, discards every sample window, and rebuilds the target list.
    /// Each new target's first probe fires on the next tick.
    // TODO: preserve sample history for targets that survive a re-sync.
    pub fn sync_targets(&mut self) {
        let now = self.clock.monotonic_ms();
        self.targets.clear();
        for target in self.config.targets().iter().filter(|t| t.enabled) {
            self.targets.push(TargetRuntime {
                target: target.clone(),
                samples: RingBuffer::new(DEFAULT_WINDOW_SIZE),
                metrics: Metrics::default(),
                bad_state: BadStateTracker::default(),
                probe_state: ProbeState::Idle,
                in_flight: None,
                probe_start_ms: 0,
                next_probe_ms: now,
                scratch: vec![0.0; DEFAULT_WINDOW_SIZE],
            });
        }
    }

    /// Releases every probe handle and sample window. Idempotent; the
    /// scheduler stays constructed but does no further work.
    pub fn free(&mut self) {
        self.targets.clear();
        self.running = false;
    }

    /// Runs one scheduling pass and returns how many milliseconds may pass
    /// before the next call would find work: the minimum of one second, all
    /// idle targets' time-to-next-probe, and all in-flight probes' remaining
    /// timeout. Never returns 0.
    pub fn tick(&mut self) -> u64 {
        if !self.running {
            return DEFAULT_TICK_WAIT_MS;
        }

        let now = self.clock.monotonic_ms();
        let mut min_wait = DEFAULT_TICK_WAIT_MS as i64;

        for i in 0..self.targets.len() {
            match self.targets[i].probe_state {
                ProbeState::Idle => {
                    if now >= self.targets[i].next_probe_ms {
                        self.start_probe(i, now);
                    } else {
                        min_wait = min_wait.min((self.targets[i].next_probe_ms - now) as i64);
                    }
                }
                ProbeState::Connecting => {
                    let elapsed = now - self.targets[i].probe_start_ms;
                    let remaining = self.config.probe_timeout_ms as i64 - elapsed as i64;

                    if remaining <= 0 {
                        self.targets[i].in_flight = None;
                        self.record_sample(i, false, 0.0);
                        continue;
                    }

                    let outcome = match self.targets[i].in_flight.as_mut() {
                        Some(probe) => probe.poll(),
                        None => ProbeOutcome::Error,
                    };
                    match outcome {
                        ProbeOutcome::Pending => {
                            min_wait = min_wait.min(remaining);
                        }
                        ProbeOutcome::Success => {
                            let rtt_ms = (now - self.targets[i].probe_start_ms) as f64;
                            self.targets[i].in_flight = None;
                            self.record_sample(i, true, rtt_ms);
                        }
                        ProbeOutcome::Error => {
                            self.targets[i].in_flight = None;
                            self.record_sample(i, false, 0.0);
                        }
                    }
                }
                ProbeState::Done => {
                    self.targets[i].probe_state = ProbeState::Idle;
                }
            }
        }

        if now - self.last_metrics_update_ms >= METRICS_REFRESH_MS {
            self.last_metrics_update_ms = now;
            self.refresh_metrics(now);
        }

        if min_wait <= 0 {
            1
        } else {
            min_wait as u64
        }
    }

    fn start_probe(&mut self, idx: usize, now: u64) {
        let host = self.targets[idx].target.host.clone();
        let port = self.targets[idx].target.port;
        let timeout_ms = self.config.probe_timeout_ms as u64;

        let started = match &mut self.driver {
            ProbeDriver::Tcp(factory) => match factory.start(&host, port) {
                Ok(probe) => StartResult::InFlight(probe),
                Err(e) => {
                    // DNS or socket setup failure: a failed sample, not an error.
                    tracing::debug!(host = %host, port, "probe start failed: {e}");
                    StartResult::Finished {
                        success: false,
                        rtt_ms: 0.0,
                    }
                }
            },
            ProbeDriver::Icmp(pinger) => match pinger.ping(&host, timeout_ms) {
                Some(rtt_ms) => StartResult::Finished {
                    success: true,
                    rtt_ms,
                },
                None => StartResult::Finished {
                    success: false,
                    rtt_ms: 0.0,
                },
            },
        };

        match started {
            StartResult::InFlight(probe) => {
                let rt = &mut self.targets[idx];
                rt.in_flight = Some(probe);
                rt.probe_start_ms = now;
                rt.probe_state = ProbeState::Connecting;
            }
            StartResult::Finished { success, rtt_ms } => {
                self.record_sample(idx, success, rtt_ms);
            }
        }
    }

    fn record_sample(&mut self, idx: usize, success: bool, rtt_ms: f64) {
        let now = self.clock.monotonic_ms();
        let sample = Sample {
            timestamp_wall_ms: self.clock.wall_ms(),
            rtt_ms: if success { rtt_ms } else { 0.0 },
            success,
        };

        let rt = &mut self.targets[idx];
        rt.samples.push(sample);
        rt.probe_state = ProbeState::Idle;
        rt.next_probe_ms = now + self.config.probe_interval_ms as u64;

        if let Some(cb) = self.on_sample.as_mut() {
            cb(&self.targets[idx].target.id, &sample);
        }
    }

    fn refresh_metrics(&mut self, now: u64) {
        let now_wall = self.clock.wall_ms();
        for i in 0..self.targets.len() {
            let rt = &mut self.targets[i];
            rt.metrics = stats::compute(&rt.samples, &mut rt.scratch, now);
            let metrics = rt.metrics;
            let id = rt.target.id.clone();

            let event = self.event_log.check(
                &mut self.targets[i].bad_state,
                &id,
                &metrics,
                &self.config.thresholds,
                now,
                now_wall,
            );

            if let Some(cb) = self.on_metrics.as_mut() {
                cb(&id, &metrics);
            }
            if let Some(event) = event {
                if let Some(cb) = self.on_event.as_mut() {
                    cb(&event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::probe::ConnectProbe;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::Mutex;

    /// Connects succeed on the first poll after `start`.
    struct InstantConnect;

    struct InstantPending;

    impl PendingProbe for InstantPending {
        fn poll(&mut self) -> ProbeOutcome {
            ProbeOutcome::Success
        }
    }

    impl ConnectProbe for InstantConnect {
        fn start(&mut self, _host: &str, _port: u16) -> std::io::Result<Box<dyn PendingProbe>> {
            Ok(Box::new(InstantPending))
        }
    }

    /// Probes that never complete; only the timeout path ends them.
    struct NeverConnect;

    struct NeverPending;

    impl PendingProbe for NeverPending {
        fn poll(&mut self) -> ProbeOutcome {
            ProbeOutcome::Pending
        }
    }

    impl ConnectProbe for NeverConnect {
        fn start(&mut self, _host: &str, _port: u16) -> std::io::Result<Box<dyn PendingProbe>> {
            Ok(Box::new(NeverPending))
        }
    }

    /// `start` itself fails, as with a DNS error.
    struct FailingStart;

    impl ConnectProbe for FailingStart {
        fn start(&mut self, _host: &str, _port: u16) -> std::io::Result<Box<dyn PendingProbe>> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn one_target_config(interval_ms: u32, timeout_ms: u32) -> Config {
        let mut cfg = Config::empty();
        cfg.probe_interval_ms = interval_ms;
        cfg.probe_timeout_ms = timeout_ms;
        cfg.add_target("127.0.0.1", 80, "Local").unwrap();
        cfg
    }

    fn scheduler_with(
        cfg: Config,
        transport: Box<dyn ConnectProbe>,
        clock: Arc<ManualClock>,
    ) -> Scheduler {
        Scheduler::new(cfg, ProbeDriver::Tcp(transport), clock, None)
    }

    #[test]
    fn test_probe_cadence() {
        // Instant transport, 100 ms interval, 1050 ms of simulated time:
        // the sample count stays within one of T / interval.
        let clock = Arc::new(ManualClock::new());
        let mut sched = scheduler_with(
            one_target_config(100, 1000),
            Box::new(InstantConnect),
            clock.clone(),
        );

        let samples = Arc::new(AtomicUsize::new(0));
        let counter = samples.clone();
        sched.set_on_sample(Box::new(move |_, s| {
            assert!(s.success);
            counter.fetch_add(1, Relaxed);
        }));

        for _ in 0..1050 {
            let wait = sched.tick();
            assert!(wait >= 1);
            clock.advance(1);
        }

        let n = samples.load(Relaxed);
        assert!((9..=11).contains(&n), "expected ~10 samples, got {n}");
    }

    #[test]
    fn test_failed_start_records_failure_and_reschedules() {
        let clock = Arc::new(ManualClock::new());
        let mut sched = scheduler_with(
            one_target_config(500, 1500),
            Box::new(FailingStart),
            clock.clone(),
        );

        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        sched.set_on_sample(Box::new(move |_, s| sink.lock().unwrap().push(*s)));

        sched.tick();
        {
            let recorded = samples.lock().unwrap();
            assert_eq!(recorded.len(), 1);
            assert!(!recorded[0].success);
            assert_eq!(recorded[0].rtt_ms, 0.0);
        }

        // Not retried before the interval elapses.
        clock.advance(499);
        sched.tick();
        assert_eq!(samples.lock().unwrap().len(), 1);
        clock.advance(1);
        sched.tick();
        assert_eq!(samples.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_connect_timeout() {
        let clock = Arc::new(ManualClock::new());
        let mut sched = scheduler_with(
            one_target_config(500, 300),
            Box::new(NeverConnect),
            clock.clone(),
        );

        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        sched.set_on_sample(Box::new(move |_, s| sink.lock().unwrap().push(*s)));

        sched.tick(); // probe starts
        clock.advance(299);
        let wait = sched.tick();
        assert!(samples.lock().unwrap().is_empty());
        assert!(wait <= 1, "remaining timeout should bound the wait, got {wait}");

        clock.advance(1);
        sched.tick(); // deadline reached
        let recorded = samples.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(!recorded[0].success);
    }

    #[test]
    fn test_tick_wait_bounds() {
        let clock = Arc::new(ManualClock::new());
        let mut sched = scheduler_with(
            one_target_config(400, 1500),
            Box::new(InstantConnect),
            clock.clone(),
        );

        // First tick starts the probe; the wait never hits zero.
        for _ in 0..2000 {
            let wait = sched.tick();
            assert!(wait >= 1);
            assert!(wait <= 1000);
            clock.advance(1);
        }

        // With no targets at all the default wait applies.
        let mut empty = scheduler_with(Config::empty(), Box::new(InstantConnect), clock);
        assert_eq!(empty.tick(), 1000);
    }

    #[test]
    fn test_sustained_bad_p95_emits_single_event() {
        // 500 ms RTT on every sample: each probe completes one simulated
        // 500 ms step after it starts, so p95 sits at 500 from the first
        // metrics refresh on. Exactly one event over a 14 s bad period.
        let clock = Arc::new(ManualClock::new());
        let mut sched = scheduler_with(
            one_target_config(500, 1500),
            Box::new(InstantConnect),
            clock.clone(),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        sched.set_on_event(Box::new(move |e| sink.lock().unwrap().push(e.clone())));

        // Step the clock 500 ms per tick: every probe starts on one tick and
        // completes on the next, yielding rtt_ms == 500 for every sample.
        for _ in 0..29 {
            sched.tick();
            clock.advance(500);
        }

        let emitted = events.lock().unwrap();
        assert_eq!(emitted.len(), 1, "expected exactly one event");
        let event = &emitted[0];
        assert_eq!(event.event_type, crate::event::EventType::BadP95);
        assert_eq!(event.value, 500.0);
        assert_eq!(event.threshold, 100.0);
        assert!((10..=12).contains(&event.duration_s));
        assert_eq!(event.target_id, "local");
        assert!(sched.get_target("local").unwrap().bad_state().is_bad());
    }

    #[test]
    fn test_metrics_cadence_and_order() {
        let clock = Arc::new(ManualClock::new());
        let mut sched = scheduler_with(
            one_target_config(100, 1000),
            Box::new(InstantConnect),
            clock.clone(),
        );

        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = refreshes.clone();
        sched.set_on_metrics(Box::new(move |id, m| {
            assert_eq!(id, "local");
            assert!(m.loss_pct == 0.0);
            counter.fetch_add(1, Relaxed);
        }));

        for _ in 0..3050 {
            sched.tick();
            clock.advance(1);
        }
        // Refresh fires once per second: t = 1000, 2000, 3000.
        let n = refreshes.load(Relaxed);
        assert!((3..=4).contains(&n), "expected 3-4 refreshes, got {n}");
    }

    #[test]
    fn test_sync_discards_history() {
        let clock = Arc::new(ManualClock::new());
        let mut sched = scheduler_with(
            one_target_config(100, 1000),
            Box::new(InstantConnect),
            clock.clone(),
        );

        for _ in 0..500 {
            sched.tick();
            clock.advance(1);
        }
        assert!(sched.get_target("local").unwrap().samples().count() > 0);

        let added = sched.add_target("10.0.0.9", 443, "Second").unwrap();
        assert_eq!(added.id, "second");
        assert_eq!(sched.get_target("local").unwrap().samples().count(), 0);
        assert!(sched.get_target("second").is_some());

        sched.remove_target("second").unwrap();
        assert!(sched.get_target("second").is_none());
    }

    #[test]
    fn test_free_is_idempotent() {
        let clock = Arc::new(ManualClock::new());
        let mut sched = scheduler_with(
            one_target_config(100, 1000),
            Box::new(NeverConnect),
            clock.clone(),
        );
        sched.tick(); // leaves a probe in flight
        sched.free();
        sched.free();
        assert!(sched.get_target("local").is_none());
        assert_eq!(sched.tick(), 1000);
    }
}
