//! Window statistics over probe samples.
//!
//! Everything here is derived purely from the sample window: loss percentage,
//! jitter over consecutive successful probes, interpolated percentiles, and
//! the current/maximum RTT. Failed samples carry `rtt_ms = 0` and are excluded
//! from every RTT-based figure.

use crate::ring::RingBuffer;

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Wall-clock stamp for display; scheduling never reads this.
    pub timestamp_wall_ms: u64,
    /// Round-trip time in milliseconds; 0 when the probe failed.
    pub rtt_ms: f64,
    pub success: bool,
}

/// Derived statistics over the current sample window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub current_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub loss_pct: f64,
    pub jitter_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    /// Monotonic milliseconds at computation time.
    pub last_updated_ms: u64,
}

/// Percentage of failed samples in the window; 0 for an empty window.
pub fn loss_pct(samples: &RingBuffer<Sample>) -> f64 {
    let total = samples.count();
    if total == 0 {
        return 0.0;
    }
    let failures = samples.iter().filter(|s| !s.success).count();
    failures as f64 / total as f64 * 100.0
}

/// Mean absolute delta between consecutive successful RTTs, in insertion
/// order. A failed sample breaks the chain: the next success does not pair
/// with anything before the gap. Fewer than two successes in a row anywhere
/// in the window yields 0.
pub fn jitter_ms(samples: &RingBuffer<Sample>) -> f64 {
    let mut total_delta = 0.0;
    let mut delta_count = 0usize;
    let mut prev_rtt: Option<f64> = None;

    for s in samples.iter() {
        if s.success {
            if let Some(prev) = prev_rtt {
                total_delta += (s.rtt_ms - prev).abs();
                delta_count += 1;
            }
            prev_rtt = Some(s.rtt_ms);
        } else {
            prev_rtt = None;
        }
    }

    if delta_count == 0 {
        return 0.0;
    }
    total_delta / delta_count as f64
}

/// Linear-interpolated percentile over the successful RTTs in the window.
///
/// `scratch` receives the successful RTTs (bounded by its length) and is
/// sorted in place; it must hold at least `samples.capacity()` values to see
/// every sample. Returns 0 when the window holds no successful sample.
pub fn percentile(samples: &RingBuffer<Sample>, pct: f64, scratch: &mut [f64]) -> f64 {
    let n = collect_successful(samples, scratch);
    if n == 0 {
        return 0.0;
    }
    let sorted = &mut scratch[..n];
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    percentile_sorted(sorted, pct)
}

fn collect_successful(samples: &RingBuffer<Sample>, scratch: &mut [f64]) -> usize {
    let mut n = 0usize;
    for s in samples.iter() {
        if n >= scratch.len() {
            break;
        }
        if s.success {
            scratch[n] = s.rtt_ms;
            n += 1;
        }
    }
    n
}

/// `idx = pct/100 * (n-1)`, then linear interpolation between the two
/// bracketing values; the top value when the upper index falls off the end.
fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    let n = sorted.len();
    let idx = (pct / 100.0) * (n - 1) as f64;
    let lower = idx as usize;
    let upper = lower + 1;
    if upper >= n {
        return sorted[n - 1];
    }
    let frac = idx - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper] * frac
}

/// Computes the full metrics set over the window.
///
/// O(n log n) in the window size from the percentile sort; n is at most the
/// window capacity (120 by default).
pub fn compute(samples: &RingBuffer<Sample>, scratch: &mut [f64], now_monotonic_ms: u64) -> Metrics {
    let mut metrics = Metrics {
        loss_pct: loss_pct(samples),
        jitter_ms: jitter_ms(samples),
        last_updated_ms: now_monotonic_ms,
        ..Metrics::default()
    };

    // Sort the successful RTTs once; both percentiles read the same scratch.
    let n = collect_successful(samples, scratch);
    if n > 0 {
        let sorted = &mut scratch[..n];
        sorted.sort_unstable_by(|a, b| a.total_cmp(b));
        metrics.p50_ms = percentile_sorted(sorted, 50.0);
        metrics.p95_ms = percentile_sorted(sorted, 95.0);
        metrics.max_rtt_ms = sorted[n - 1];
    }

    // Current RTT: newest successful sample, scanning newest to oldest.
    for i in (0..samples.count()).rev() {
        if let Some(s) = samples.get(i) {
            if s.success {
                metrics.current_rtt_ms = s.rtt_ms;
                break;
            }
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(rtt_ms: f64) -> Sample {
        Sample {
            timestamp_wall_ms: 0,
            rtt_ms,
            success: true,
        }
    }

    fn fail() -> Sample {
        Sample {
            timestamp_wall_ms: 0,
            rtt_ms: 0.0,
            success: false,
        }
    }

    fn window(samples: &[Sample]) -> RingBuffer<Sample> {
        let mut rb = RingBuffer::new(samples.len().max(1));
        for s in samples {
            rb.push(*s);
        }
        rb
    }

    #[test]
    fn test_empty_window_is_all_zero() {
        let rb: RingBuffer<Sample> = RingBuffer::new(8);
        let mut scratch = [0.0; 8];
        let m = compute(&rb, &mut scratch, 42);
        assert_eq!(m.loss_pct, 0.0);
        assert_eq!(m.jitter_ms, 0.0);
        assert_eq!(m.p50_ms, 0.0);
        assert_eq!(m.p95_ms, 0.0);
        assert_eq!(m.current_rtt_ms, 0.0);
        assert_eq!(m.max_rtt_ms, 0.0);
        assert_eq!(m.last_updated_ms, 42);
    }

    #[test]
    fn test_loss_pct_bounds() {
        let rb = window(&[ok(10.0), fail(), fail(), ok(20.0)]);
        assert!((loss_pct(&rb) - 50.0).abs() < 1e-9);

        let all_fail = window(&[fail(), fail()]);
        assert_eq!(loss_pct(&all_fail), 100.0);

        let all_ok = window(&[ok(1.0)]);
        assert_eq!(loss_pct(&all_ok), 0.0);
    }

    #[test]
    fn test_percentile_interpolation() {
        // RTTs [10, 20, 30, 40]: p50 idx = 1.5 → 25.0; p95 idx = 2.85 → 38.5.
        let rb = window(&[ok(10.0), ok(20.0), ok(30.0), ok(40.0)]);
        let mut scratch = [0.0; 4];
        assert!((percentile(&rb, 50.0, &mut scratch) - 25.0).abs() < 1e-9);
        assert!((percentile(&rb, 95.0, &mut scratch) - 38.5).abs() < 1e-9);
        assert!((percentile(&rb, 100.0, &mut scratch) - 40.0).abs() < 1e-9);
        assert!((percentile(&rb, 0.0, &mut scratch) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_ignores_failures() {
        let rb = window(&[fail(), ok(10.0), fail(), ok(30.0)]);
        let mut scratch = [0.0; 4];
        assert!((percentile(&rb, 50.0, &mut scratch) - 20.0).abs() < 1e-9);

        let failures_only = window(&[fail(), fail()]);
        assert_eq!(percentile(&failures_only, 95.0, &mut scratch), 0.0);
    }

    #[test]
    fn test_jitter_consecutive_successes() {
        // |20-10| + |15-20| = 15 over 2 pairs.
        let rb = window(&[ok(10.0), ok(20.0), ok(15.0)]);
        assert!((jitter_ms(&rb) - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_chain_broken_by_failure() {
        // The failure splits [10, 20] and [100]: only one pair remains.
        let rb = window(&[ok(10.0), ok(20.0), fail(), ok(100.0)]);
        assert!((jitter_ms(&rb) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_degenerate_windows() {
        assert_eq!(jitter_ms(&window(&[ok(50.0)])), 0.0);
        assert_eq!(jitter_ms(&window(&[fail(), fail()])), 0.0);
        assert_eq!(jitter_ms(&window(&[fail(), ok(10.0), fail()])), 0.0);
    }

    #[test]
    fn test_current_rtt_newest_success() {
        let rb = window(&[ok(10.0), ok(30.0), fail()]);
        let mut scratch = [0.0; 4];
        let m = compute(&rb, &mut scratch, 0);
        assert_eq!(m.current_rtt_ms, 30.0);
        assert_eq!(m.max_rtt_ms, 30.0);

        let none = window(&[fail(), fail()]);
        let m = compute(&none, &mut scratch, 0);
        assert_eq!(m.current_rtt_ms, 0.0);
        assert_eq!(m.max_rtt_ms, 0.0);
    }

    #[test]
    fn test_percentile_monotonicity() {
        let rb = window(&[ok(12.0), ok(80.0), ok(33.0), fail(), ok(7.0), ok(41.0)]);
        let mut scratch = [0.0; 8];
        let m = compute(&rb, &mut scratch, 0);
        assert!(m.p50_ms <= m.p95_ms);
        assert!(m.p95_ms <= m.max_rtt_ms);
        assert!(m.current_rtt_ms <= m.max_rtt_ms);
        assert!(m.loss_pct >= 0.0 && m.loss_pct <= 100.0);
    }
}
