//! Telemetry hub — the broadcaster between the scheduler and its observers.
//!
//! The scheduler's callbacks hand over owned copies of every sample, metrics
//! refresh and event; a dedicated thread folds them into a mirror of
//! per-target state and fans the rendered deltas out to WebSocket sessions.
//! Snapshots for newly connected observers are served entirely from the
//! mirror, so observers never touch scheduler-owned state.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use pulse_core::{Event, Metrics, RingBuffer, Sample, Target};
use tokio::sync::broadcast;

use crate::wire::{ConfigView, MetricsView, SampleView, TargetSnapshot, WsMessage};

/// Per-target window mirrored by the hub; matches the scheduler's window so
/// a snapshot replays the same history an observer would have streamed.
const MIRROR_WINDOW_SIZE: usize = 120;

/// Backlog per WebSocket subscriber before it starts lagging.
const BROADCAST_CAPACITY: usize = 1024;

/// Owned copies of scheduler output, sent from the callbacks.
pub enum TelemetryMsg {
    Sample { target_id: String, sample: Sample },
    Metrics { target_id: String, metrics: Metrics },
    Event(Event),
    TargetsUpdated { targets: Vec<Target>, config: ConfigView },
}

struct MirrorTarget {
    target: Target,
    metrics: Metrics,
    samples: RingBuffer<Sample>,
}

impl MirrorTarget {
    fn new(target: Target) -> Self {
        Self {
            target,
            metrics: Metrics::default(),
            samples: RingBuffer::new(MIRROR_WINDOW_SIZE),
        }
    }

    fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            id: self.target.id.clone(),
            host: self.target.host.clone(),
            port: self.target.port,
            label: self.target.label.clone(),
            metrics: MetricsView::from(&self.metrics),
            samples: self.samples.iter().map(SampleView::from).collect(),
        }
    }
}

struct MirrorState {
    targets: Vec<MirrorTarget>,
    config: ConfigView,
}

impl MirrorState {
    fn target_mut(&mut self, id: &str) -> Option<&mut MirrorTarget> {
        self.targets.iter_mut().find(|t| t.target.id == id)
    }

    fn snapshots(&self) -> Vec<TargetSnapshot> {
        self.targets.iter().map(MirrorTarget::snapshot).collect()
    }
}

/// Cloneable handle held by the HTTP server and every WebSocket session.
#[derive(Clone)]
pub struct TelemetryHub {
    state: Arc<Mutex<MirrorState>>,
    broadcast: broadcast::Sender<String>,
}

impl TelemetryHub {
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcast.subscribe()
    }

    /// The connect-time snapshot, samples oldest-first.
    pub fn snapshot_json(&self) -> String {
        let state = self.state.lock().unwrap();
        WsMessage::Snapshot {
            targets: state.snapshots(),
            config: state.config.clone(),
        }
        .to_json()
    }
}

/// Starts the hub thread. `targets` and `config` seed the mirror so
/// observers connecting before the first delta still get a full snapshot.
pub fn spawn(
    rx: Receiver<TelemetryMsg>,
    targets: Vec<Target>,
    config: ConfigView,
) -> TelemetryHub {
    let state = Arc::new(Mutex::new(MirrorState {
        targets: targets.into_iter().map(MirrorTarget::new).collect(),
        config,
    }));
    let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);

    let hub = TelemetryHub {
        state: state.clone(),
        broadcast: tx.clone(),
    };

    std::thread::Builder::new()
        .name("telemetry-hub".into())
        .spawn(move || {
            for msg in rx {
                let rendered = {
                    let mut state = state.lock().unwrap();
                    apply(&mut state, msg)
                };
                // No subscribers is fine; send only fails then.
                let _ = tx.send(rendered);
            }
        })
        .expect("failed to spawn telemetry-hub thread");

    hub
}

/// Folds one message into the mirror and renders the outgoing delta.
fn apply(state: &mut MirrorState, msg: TelemetryMsg) -> String {
    match msg {
        TelemetryMsg::Sample { target_id, sample } => {
            if let Some(t) = state.target_mut(&target_id) {
                t.samples.push(sample);
            }
            WsMessage::sample(target_id, &sample).to_json()
        }
        TelemetryMsg::Metrics { target_id, metrics } => {
            if let Some(t) = state.target_mut(&target_id) {
                t.metrics = metrics;
            }
            WsMessage::Metrics {
                target_id,
                metrics: MetricsView::from(&metrics),
            }
            .to_json()
        }
        TelemetryMsg::Event(event) => WsMessage::event(&event).to_json(),
        TelemetryMsg::TargetsUpdated { targets, config } => {
            // Re-sync discarded the scheduler's history, so the mirror
            // starts every window fresh as well.
            state.targets = targets.into_iter().map(MirrorTarget::new).collect();
            state.config = config;
            WsMessage::TargetsUpdated {
                targets: state.snapshots(),
                config: state.config.clone(),
            }
            .to_json()
        }
    }
}
