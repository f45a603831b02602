//! Observer-facing payloads.
//!
//! One serialized shape for everything that leaves over HTTP or WebSocket:
//! the connect-time snapshot, the three delta messages, and the config
//! document. Float fields are rounded to two decimals before serialization
//! so payloads stay stable across platforms.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use pulse_core::{Config, Event, Metrics, Sample, Target};

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsView {
    pub current_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub loss_pct: f64,
    pub jitter_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl From<&Metrics> for MetricsView {
    fn from(m: &Metrics) -> Self {
        Self {
            current_rtt_ms: round2(m.current_rtt_ms),
            max_rtt_ms: round2(m.max_rtt_ms),
            loss_pct: round2(m.loss_pct),
            jitter_ms: round2(m.jitter_ms),
            p50_ms: round2(m.p50_ms),
            p95_ms: round2(m.p95_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleView {
    pub ts: u64,
    pub rtt_ms: f64,
    pub success: bool,
}

impl From<&Sample> for SampleView {
    fn from(s: &Sample) -> Self {
        Self {
            ts: s.timestamp_wall_ms,
            rtt_ms: round2(s.rtt_ms),
            success: s.success,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdsView {
    pub loss_pct: f64,
    pub p95_ms: f64,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub probe_interval_ms: u32,
    pub probe_timeout_ms: u32,
    pub thresholds: ThresholdsView,
}

impl From<&Config> for ConfigView {
    fn from(cfg: &Config) -> Self {
        Self {
            probe_interval_ms: cfg.probe_interval_ms,
            probe_timeout_ms: cfg.probe_timeout_ms,
            thresholds: ThresholdsView {
                loss_pct: cfg.thresholds.loss_pct,
                p95_ms: cfg.thresholds.p95_ms,
                jitter_ms: cfg.thresholds.jitter_ms,
            },
        }
    }
}

/// One target as it appears in snapshots: identity, latest metrics, and the
/// sample window oldest-first.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub label: String,
    pub metrics: MetricsView,
    pub samples: Vec<SampleView>,
}

/// The `details` object of an event payload: the offending metric keyed by
/// its own name, then the threshold and duration. Hand-serialized because the
/// first key is dynamic.
#[derive(Debug, Clone)]
pub struct EventDetails {
    pub metric: &'static str,
    pub value: f64,
    pub threshold: f64,
    pub duration_s: u32,
}

impl Serialize for EventDetails {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry(self.metric, &round2(self.value))?;
        map.serialize_entry("threshold", &round2(self.threshold))?;
        map.serialize_entry("duration_s", &self.duration_s)?;
        map.end()
    }
}

impl From<&Event> for EventDetails {
    fn from(e: &Event) -> Self {
        Self {
            metric: e.event_type.metric_field(),
            value: e.value,
            threshold: e.threshold,
            duration_s: e.duration_s,
        }
    }
}

/// Everything sent down a WebSocket: the snapshot on connect, then deltas.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Snapshot {
        targets: Vec<TargetSnapshot>,
        config: ConfigView,
    },
    Sample {
        target_id: String,
        ts: u64,
        rtt_ms: f64,
        success: bool,
    },
    Metrics {
        target_id: String,
        metrics: MetricsView,
    },
    Event {
        ts: u64,
        target_id: String,
        reason: String,
        details: EventDetails,
    },
    TargetsUpdated {
        targets: Vec<TargetSnapshot>,
        config: ConfigView,
    },
}

impl WsMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn sample(target_id: String, sample: &Sample) -> Self {
        WsMessage::Sample {
            target_id,
            ts: sample.timestamp_wall_ms,
            rtt_ms: round2(sample.rtt_ms),
            success: sample.success,
        }
    }

    pub fn event(event: &Event) -> Self {
        WsMessage::Event {
            ts: event.timestamp_wall_ms,
            target_id: event.target_id.clone(),
            reason: event.reason.clone(),
            details: EventDetails::from(event),
        }
    }
}

/// `GET /api/config` response: the settings plus the bare target list.
#[derive(Debug, Serialize)]
struct FullConfig {
    probe_interval_ms: u32,
    probe_timeout_ms: u32,
    thresholds: ThresholdsView,
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Serialize)]
struct TargetEntry {
    id: String,
    host: String,
    port: u16,
    label: String,
}

impl From<&Target> for TargetEntry {
    fn from(t: &Target) -> Self {
        Self {
            id: t.id.clone(),
            host: t.host.clone(),
            port: t.port,
            label: t.label.clone(),
        }
    }
}

/// `GET /api/events` response: recent events oldest-first, same `details`
/// shape as the event delta.
pub fn events_json(events: &pulse_core::RingBuffer<Event>) -> String {
    #[derive(Serialize)]
    struct EventEntry {
        ts: u64,
        target_id: String,
        reason: String,
        details: EventDetails,
    }
    #[derive(Serialize)]
    struct Events {
        events: Vec<EventEntry>,
    }

    let doc = Events {
        events: events
            .iter()
            .map(|e| EventEntry {
                ts: e.timestamp_wall_ms,
                target_id: e.target_id.clone(),
                reason: e.reason.clone(),
                details: EventDetails::from(e),
            })
            .collect(),
    };
    serde_json::to_string(&doc).unwrap_or_else(|_| "{}".into())
}

pub fn full_config_json(cfg: &Config) -> String {
    let view = ConfigView::from(cfg);
    let full = FullConfig {
        probe_interval_ms: view.probe_interval_ms,
        probe_timeout_ms: view.probe_timeout_ms,
        thresholds: view.thresholds,
        targets: cfg.targets().iter().map(TargetEntry::from).collect(),
    };
    serde_json::to_string(&full).unwrap_or_else(|_| "{}".into())
}
