//! HTTP + WebSocket endpoint.
//!
//! A current-thread tokio runtime on its own OS thread serves the REST
//! surface and upgrades `/ws` connections. WebSocket sessions receive the
//! snapshot on connect and then every delta the telemetry hub broadcasts.
//! Reconfiguration requests cross to the scheduler thread over the control
//! channel and block only the requesting connection while the reply travels
//! back.

use std::time::Instant;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use pulse_core::ConfigUpdate;

use crate::control::ControlMsg;
use crate::hub::TelemetryHub;

/// Everything a connection handler needs, cheap to clone per connection.
#[derive(Clone)]
pub struct ServerCtx {
    pub hub: TelemetryHub,
    pub control: crossbeam_channel::Sender<ControlMsg>,
    pub started: Instant,
}

/// Binds the listener and runs the server on a dedicated thread. Returns
/// once the port is bound, so a startup failure surfaces before the daemon
/// reports itself healthy.
pub fn spawn(port: u16, ctx: ServerCtx) -> Result<std::thread::JoinHandle<()>> {
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::io::Result<()>>(1);

    let handle = std::thread::Builder::new()
        .name("http-server".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build server runtime");
            rt.block_on(async move {
                let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(l) => {
                        let _ = ready_tx.send(Ok(()));
                        l
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                accept_loop(listener, ctx).await;
            });
        })
        .context("failed to spawn http-server thread")?;

    ready_rx
        .recv()
        .context("server thread exited before binding")?
        .with_context(|| format!("failed to listen on 0.0.0.0:{port}"))?;

    Ok(handle)
}

async fn accept_loop(listener: TcpListener, ctx: ServerCtx) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        debug!("connection error: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: ServerCtx) -> Result<()> {
    // Peek to detect WebSocket upgrades before consuming the stream.
    let mut peek_buf = [0u8; 512];
    let peeked = stream.peek(&mut peek_buf).await.unwrap_or(0);
    let peek_str = String::from_utf8_lossy(&peek_buf[..peeked]);

    if peek_str.contains("Upgrade: websocket") || peek_str.contains("upgrade: websocket") {
        let path = peek_str
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();
        if path == "/ws" {
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .context("websocket handshake failed")?;
            info!("observer connected");
            ws_session(ws, ctx.hub).await;
            info!("observer disconnected");
            return Ok(());
        }
        // Upgrade on any other path falls through to a plain 404.
    }

    let request = read_request(&mut stream).await?;
    let (method, path) = match parse_request_line(&request) {
        Some(parts) => parts,
        None => return Ok(()),
    };

    let response = route(&method, &path, request.body, &ctx).await;
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

struct Request {
    line: String,
    body: String,
}

/// Reads one HTTP request: the header block plus, for POSTs, a
/// `Content-Length`-delimited body (bounded at 64 KiB).
async fn read_request(stream: &mut TcpStream) -> Result<Request> {
    const MAX_REQUEST: usize = 64 * 1024;
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST {
            anyhow::bail!("request too large");
        }

        if let Some(header_end) = find_header_end(&buf) {
            let headers = String::from_utf8_lossy(&buf[..header_end]);
            let content_length = headers
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if content_length > MAX_REQUEST {
                anyhow::bail!("request body too large");
            }
            let body_start = header_end + 4;
            if buf.len() >= body_start + content_length {
                let line = headers.lines().next().unwrap_or("").to_string();
                let body =
                    String::from_utf8_lossy(&buf[body_start..body_start + content_length])
                        .into_owned();
                return Ok(Request { line, body });
            }
        }
    }

    let text = String::from_utf8_lossy(&buf);
    Ok(Request {
        line: text.lines().next().unwrap_or("").to_string(),
        body: String::new(),
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_line(request: &Request) -> Option<(String, String)> {
    let mut parts = request.line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.split('?').next().unwrap_or("/").to_string();
    Some((method, path))
}

async fn route(method: &str, path: &str, body: String, ctx: &ServerCtx) -> String {
    match path {
        "/" => match method {
            "GET" => http_response(200, "text/html; charset=utf-8", INDEX_HTML),
            _ => http_response(405, "text/plain", "Method not allowed\n"),
        },
        "/api/health" => {
            let uptime_s = ctx.started.elapsed().as_secs();
            http_response(
                200,
                "application/json",
                &format!("{{\"ok\":true,\"uptime_s\":{uptime_s}}}\n"),
            )
        }
        "/api/events" => match method {
            "GET" => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if ctx
                    .control
                    .send(ControlMsg::GetEvents { reply: reply_tx })
                    .is_err()
                {
                    return http_response(500, "application/json", "{\"ok\":false}\n");
                }
                match reply_rx.await {
                    Ok(json) => http_response(200, "application/json", &(json + "\n")),
                    Err(_) => http_response(500, "application/json", "{\"ok\":false}\n"),
                }
            }
            _ => http_response(405, "text/plain", "Method not allowed\n"),
        },
        "/api/config" => match method {
            "GET" => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if ctx
                    .control
                    .send(ControlMsg::GetConfig { reply: reply_tx })
                    .is_err()
                {
                    return http_response(500, "application/json", "{\"ok\":false}\n");
                }
                match reply_rx.await {
                    Ok(json) => http_response(200, "application/json", &(json + "\n")),
                    Err(_) => http_response(500, "application/json", "{\"ok\":false}\n"),
                }
            }
            "POST" => {
                let update: ConfigUpdate = match serde_json::from_str(&body) {
                    Ok(u) => u,
                    Err(_) => {
                        return http_response(
                            400,
                            "application/json",
                            "{\"ok\":false,\"error\":\"invalid JSON body\"}\n",
                        )
                    }
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                let sent = ctx
                    .control
                    .send(ControlMsg::UpdateConfig {
                        update,
                        reply: reply_tx,
                    })
                    .is_ok();
                if sent && reply_rx.await.is_ok() {
                    http_response(200, "application/json", "{\"ok\":true}\n")
                } else {
                    http_response(500, "application/json", "{\"ok\":false}\n")
                }
            }
            _ => http_response(405, "text/plain", "Method not allowed\n"),
        },
        "/api/targets" => match method {
            "POST" => handle_targets(body, ctx).await,
            _ => http_response(405, "text/plain", "Method not allowed\n"),
        },
        _ => http_response(404, "text/plain", "Not found\n"),
    }
}

#[derive(serde::Deserialize)]
struct TargetAction {
    action: String,
    host: Option<String>,
    #[serde(default = "default_port")]
    port: u16,
    label: Option<String>,
    target_id: Option<String>,
}

fn default_port() -> u16 {
    443
}

async fn handle_targets(body: String, ctx: &ServerCtx) -> String {
    let action: TargetAction = match serde_json::from_str(&body) {
        Ok(a) => a,
        Err(_) => {
            return http_response(
                400,
                "application/json",
                "{\"ok\":false,\"error\":\"invalid JSON body\"}\n",
            )
        }
    };

    match action.action.as_str() {
        "add" => {
            let (host, label) = match (action.host, action.label) {
                (Some(h), Some(l)) if !h.is_empty() && !l.is_empty() => (h, l),
                _ => {
                    return http_response(
                        400,
                        "application/json",
                        "{\"ok\":false,\"error\":\"host and label required\"}\n",
                    )
                }
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = ctx
                .control
                .send(ControlMsg::AddTarget {
                    host,
                    port: action.port,
                    label,
                    reply: reply_tx,
                })
                .is_ok();
            match (sent, reply_rx.await) {
                (true, Ok(Ok(id))) => http_response(
                    200,
                    "application/json",
                    &format!("{{\"ok\":true,\"target_id\":\"{id}\"}}\n"),
                ),
                (true, Ok(Err(reason))) => http_response(
                    400,
                    "application/json",
                    &format!("{{\"ok\":false,\"error\":\"{reason}\"}}\n"),
                ),
                _ => http_response(500, "application/json", "{\"ok\":false}\n"),
            }
        }
        "remove" => {
            let id = match action.target_id {
                Some(id) if !id.is_empty() => id,
                _ => {
                    return http_response(
                        400,
                        "application/json",
                        "{\"ok\":false,\"error\":\"target_id required\"}\n",
                    )
                }
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = ctx
                .control
                .send(ControlMsg::RemoveTarget {
                    id,
                    reply: reply_tx,
                })
                .is_ok();
            match (sent, reply_rx.await) {
                (true, Ok(Ok(()))) => http_response(200, "application/json", "{\"ok\":true}\n"),
                (true, Ok(Err(_))) => http_response(
                    404,
                    "application/json",
                    "{\"ok\":false,\"error\":\"target not found\"}\n",
                ),
                _ => http_response(500, "application/json", "{\"ok\":false}\n"),
            }
        }
        _ => http_response(
            400,
            "application/json",
            "{\"ok\":false,\"error\":\"action must be add or remove\"}\n",
        ),
    }
}

async fn ws_session(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    hub: TelemetryHub,
) {
    // Subscribe before snapshotting so no delta falls between the two.
    let mut deltas = hub.subscribe();
    let (mut write, mut read) = ws.split();

    if write.send(Message::Text(hub.snapshot_json())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            delta = deltas.recv() => match delta {
                Ok(text) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // A slow observer lost some deltas; later metrics messages
                // bring it back in line.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("observer lagged, {skipped} deltas dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // inbound text is ignored
                Some(Err(_)) => break,
            },
        }
    }
}

fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: {content_type}\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    )
}

/// Embedded status page: connects to `/ws` and renders one card per target.
const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>NetPulse</title>
<style>
*{margin:0;padding:0;box-sizing:border-box}
body{background:#0d1117;color:#c9d1d9;font-family:'Cascadia Code','Fira Code',monospace;padding:24px}
h1{font-size:1.2rem;color:#58a6ff;margin-bottom:4px}
#status{font-size:.75rem;color:#8b949e;margin-bottom:20px}
#targets{display:grid;grid-template-columns:repeat(auto-fill,minmax(320px,1fr));gap:14px}
.card{background:#161b22;border:1px solid #21262d;border-radius:8px;padding:14px}
.card h2{font-size:.95rem;margin-bottom:2px}
.card .host{font-size:.72rem;color:#8b949e;margin-bottom:10px}
.row{display:flex;justify-content:space-between;font-size:.8rem;padding:2px 0}
.row .k{color:#8b949e}
.ok{color:#3fb950}.warn{color:#e3b341}.bad{color:#f85149}
#events{margin-top:24px}
#events h2{font-size:.9rem;color:#8b949e;margin-bottom:8px}
.event{font-size:.75rem;color:#f85149;padding:2px 0}
</style>
</head>
<body>
<h1>NetPulse</h1>
<div id="status">connecting…</div>
<div id="targets"></div>
<div id="events"><h2>Events</h2></div>
<script>
const targets = new Map();
const statusEl = document.getElementById('status');
const grid = document.getElementById('targets');
const eventsEl = document.getElementById('events');

function card(t) {
  let el = targets.get(t.id);
  if (!el) {
    el = document.createElement('div');
    el.className = 'card';
    el.innerHTML = '<h2></h2><div class="host"></div>' +
      ['rtt','p50','p95','loss','jitter'].map(k =>
        `<div class="row"><span class="k">${k}</span><span id="${t.id}-${k}">—</span></div>`).join('');
    grid.appendChild(el);
    targets.set(t.id, el);
  }
  el.querySelector('h2').textContent = t.label;
  el.querySelector('.host').textContent = t.host + ':' + t.port;
  return el;
}

function setMetric(id, key, value, cls) {
  const el = document.getElementById(id + '-' + key);
  if (el) { el.textContent = value; el.className = cls || ''; }
}

function renderMetrics(id, m) {
  setMetric(id, 'rtt', m.current_rtt_ms.toFixed(1) + ' ms');
  setMetric(id, 'p50', m.p50_ms.toFixed(1) + ' ms');
  setMetric(id, 'p95', m.p95_ms.toFixed(1) + ' ms');
  setMetric(id, 'loss', m.loss_pct.toFixed(1) + '%', m.loss_pct > 5 ? 'bad' : 'ok');
  setMetric(id, 'jitter', m.jitter_ms.toFixed(1) + ' ms', m.jitter_ms > 20 ? 'warn' : '');
}

function reset(ts) {
  grid.innerHTML = '';
  targets.clear();
  for (const t of ts) { card(t); renderMetrics(t.id, t.metrics); }
}

function connect() {
  const ws = new WebSocket('ws://' + location.host + '/ws');
  ws.onopen = () => { statusEl.textContent = 'live'; };
  ws.onclose = () => { statusEl.textContent = 'disconnected — retrying'; setTimeout(connect, 2000); };
  ws.onmessage = (e) => {
    const msg = JSON.parse(e.data);
    if (msg.type === 'snapshot' || msg.type === 'targets_updated') reset(msg.targets);
    else if (msg.type === 'metrics') renderMetrics(msg.target_id, msg.metrics);
    else if (msg.type === 'event') {
      const div = document.createElement('div');
      div.className = 'event';
      div.textContent = new Date(msg.ts).toISOString() + '  ' + msg.target_id + ': ' + msg.reason;
      eventsEl.appendChild(div);
    }
  };
}
connect();
</script>
</body>
</html>
"##;
