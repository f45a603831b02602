//! Control requests from the HTTP server to the scheduler thread.
//!
//! The scheduler's thread drains these between ticks, so configuration is
//! only ever mutated while no probe state is being walked. Replies travel
//! back over oneshot channels; a dropped reply just means the client went
//! away.

use pulse_core::ConfigUpdate;
use tokio::sync::oneshot;

pub enum ControlMsg {
    /// Rendered `GET /api/config` document.
    GetConfig {
        reply: oneshot::Sender<String>,
    },
    /// Rendered `GET /api/events` document: the in-memory event ring.
    GetEvents {
        reply: oneshot::Sender<String>,
    },
    /// Partial settings patch; out-of-range fields are ignored.
    UpdateConfig {
        update: ConfigUpdate,
        reply: oneshot::Sender<()>,
    },
    /// Add a target and re-sync. Replies with the derived target id.
    AddTarget {
        host: String,
        port: u16,
        label: String,
        reply: oneshot::Sender<Result<String, String>>,
    },
    /// Remove a target by id and re-sync.
    RemoveTarget {
        id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
}
