//! netpulsed — network quality monitor daemon.
//!
//! Probes each configured target on a fixed cadence, keeps a sliding window
//! of RTT samples per target, and streams samples/metrics/events to observers
//! over HTTP + WebSocket. Run `netpulsed --help` for usage.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod control;
mod hub;
mod server;
mod wire;

use cli::{Cli, ProbeTypeArg};
use control::ControlMsg;
use hub::TelemetryMsg;
use pulse_core::{
    Config, IcmpProbe, ProbeDriver, ProbeType, Scheduler, SystemClock,
};
use wire::ConfigView;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let data_dir = resolve_data_dir(cli.data_dir)?;
    info!("data directory: {}", data_dir.display());

    let config_path = cli
        .config
        .unwrap_or_else(|| data_dir.join("config.toml"));
    let mut config = Config::load_or_default(&config_path)?;

    if let Some(probe_type) = cli.probe_type {
        config.probe_type = match probe_type {
            ProbeTypeArg::Tcp => ProbeType::Tcp,
            ProbeTypeArg::Icmp => ProbeType::Icmp,
        };
    }
    if let Some(port) = cli.http_port {
        config.http_port = port;
    }

    let driver = match config.probe_type {
        ProbeType::Icmp => match IcmpProbe::new() {
            Ok(pinger) => {
                info!("ICMP echo probing enabled");
                ProbeDriver::Icmp(Box::new(pinger))
            }
            Err(unavailable) => {
                warn!("{unavailable}; falling back to TCP connect probes");
                ProbeDriver::tcp()
            }
        },
        ProbeType::Tcp => ProbeDriver::tcp(),
    };

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as *const () as libc::sighandler_t);
    }

    let journal_path = data_dir.join("events.jsonl");
    let mut scheduler = Scheduler::new(
        config,
        driver,
        Arc::new(SystemClock),
        Some(journal_path),
    );

    // Telemetry path: scheduler callbacks -> hub thread -> WebSocket fan-out.
    let (telemetry_tx, telemetry_rx) = crossbeam_channel::unbounded::<TelemetryMsg>();
    let hub = hub::spawn(
        telemetry_rx,
        scheduler.config().targets().to_vec(),
        ConfigView::from(scheduler.config()),
    );

    let tx = telemetry_tx.clone();
    scheduler.set_on_sample(Box::new(move |id, sample| {
        let _ = tx.send(TelemetryMsg::Sample {
            target_id: id.to_string(),
            sample: *sample,
        });
    }));
    let tx = telemetry_tx.clone();
    scheduler.set_on_metrics(Box::new(move |id, metrics| {
        let _ = tx.send(TelemetryMsg::Metrics {
            target_id: id.to_string(),
            metrics: *metrics,
        });
    }));
    let tx = telemetry_tx.clone();
    scheduler.set_on_event(Box::new(move |event| {
        let _ = tx.send(TelemetryMsg::Event(event.clone()));
    }));

    // Control path: HTTP handlers -> this thread, applied between ticks.
    let (control_tx, control_rx) = crossbeam_channel::unbounded::<ControlMsg>();

    let http_port = scheduler.config().http_port;
    let _server = server::spawn(
        http_port,
        server::ServerCtx {
            hub,
            control: control_tx.clone(),
            started: Instant::now(),
        },
    )?;

    info!("netpulsed listening on http://0.0.0.0:{http_port}");
    info!("websocket endpoint: ws://localhost:{http_port}/ws");
    for target in scheduler.config().targets() {
        info!(
            "target {} -> {}:{} ({})",
            target.id, target.host, target.port, target.label
        );
    }

    // Main loop: one scheduling pass, then a bounded wait on the control
    // channel. The wait is capped at 2 ms so a completed non-blocking
    // connect is observed on the next pass.
    while RUNNING.load(Ordering::SeqCst) {
        let wait_ms = scheduler.tick();
        match control_rx.recv_timeout(Duration::from_millis(wait_ms.min(2))) {
            Ok(msg) => handle_control(&mut scheduler, &telemetry_tx, msg),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("shutting down");
    scheduler.free();
    Ok(())
}

fn handle_control(
    scheduler: &mut Scheduler,
    telemetry_tx: &Sender<TelemetryMsg>,
    msg: ControlMsg,
) {
    match msg {
        ControlMsg::GetConfig { reply } => {
            let _ = reply.send(wire::full_config_json(scheduler.config()));
        }
        ControlMsg::GetEvents { reply } => {
            let _ = reply.send(wire::events_json(scheduler.events()));
        }
        ControlMsg::UpdateConfig { update, reply } => {
            scheduler.update_config(&update);
            info!(
                "config updated: interval={}ms timeout={}ms",
                scheduler.config().probe_interval_ms,
                scheduler.config().probe_timeout_ms
            );
            let _ = reply.send(());
        }
        ControlMsg::AddTarget {
            host,
            port,
            label,
            reply,
        } => match scheduler.add_target(&host, port, &label) {
            Ok(target) => {
                info!("target added: {} -> {}:{}", target.id, target.host, target.port);
                let id = target.id.clone();
                notify_targets_updated(scheduler, telemetry_tx);
                let _ = reply.send(Ok(id));
            }
            Err(e) => {
                let _ = reply.send(Err(e.to_string()));
            }
        },
        ControlMsg::RemoveTarget { id, reply } => match scheduler.remove_target(&id) {
            Ok(()) => {
                info!("target removed: {id}");
                notify_targets_updated(scheduler, telemetry_tx);
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                let _ = reply.send(Err(e.to_string()));
            }
        },
    }
}

fn notify_targets_updated(scheduler: &Scheduler, telemetry_tx: &Sender<TelemetryMsg>) {
    let _ = telemetry_tx.send(TelemetryMsg::TargetsUpdated {
        targets: scheduler.config().targets().to_vec(),
        config: ConfigView::from(scheduler.config()),
    });
}

/// `~/.netpulse` unless overridden; created with mode 0755.
fn resolve_data_dir(custom: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match custom {
        Some(dir) => dir,
        None => home_dir()?.join(".netpulse"),
    };

    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;

    Ok(dir)
}

fn home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    // Fall back to the passwd entry when HOME is unset (e.g. under systemd).
    unsafe {
        let pw = libc::getpwuid(libc::getuid());
        if !pw.is_null() && !(*pw).pw_dir.is_null() {
            let dir = std::ffi::CStr::from_ptr((*pw).pw_dir);
            return Ok(PathBuf::from(dir.to_string_lossy().into_owned()));
        }
    }
    anyhow::bail!("cannot determine home directory")
}
