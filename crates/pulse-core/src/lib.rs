//! The NetPulse probe-and-telemetry engine.
//!
//! A single-threaded cooperative scheduler multiplexes TCP-connect and ICMP
//! echo probes against configured targets, keeps a fixed-size sample window
//! per target, derives quality metrics (RTT percentiles, loss, jitter) at a
//! fixed cadence, and raises an event when a target stays degraded past the
//! dwell time. Everything leaves through callbacks; HTTP, WebSocket and
//! process plumbing live in the embedding daemon.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod probe;
pub mod ring;
pub mod scheduler;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{slugify, Config, ConfigUpdate, ProbeType, Target, Thresholds};
pub use error::CoreError;
pub use event::{BadStateTracker, Event, EventLog, EventType, EVENT_BUFFER_SIZE};
pub use probe::{
    ConnectProbe, IcmpProbe, IcmpUnavailable, PendingProbe, Pinger, ProbeDriver, ProbeOutcome,
    TcpConnectProbe,
};
pub use ring::RingBuffer;
pub use scheduler::{Scheduler, TargetRuntime};
pub use stats::{Metrics, Sample};
