//! Monitor configuration: probe cadence, thresholds, and the target list.
//!
//! Targets are addressed by a slug id derived from their label. String fields
//! are bounded at ingestion (labels 63 chars, hosts 255 chars) so ids stay
//! stable and wire payloads stay small. An optional `config.toml` can replace
//! the built-in defaults; runtime reconfiguration goes through
//! [`Config::apply_update`] and the target entry points.

use serde::Deserialize;
use std::path::Path;

use crate::error::CoreError;

pub const DEFAULT_PROBE_INTERVAL_MS: u32 = 500;
pub const DEFAULT_PROBE_TIMEOUT_MS: u32 = 1500;
/// Samples per target window: 60 s of history at the default 500 ms cadence.
pub const DEFAULT_WINDOW_SIZE: usize = 120;
pub const DEFAULT_LOSS_THRESHOLD: f64 = 5.0;
pub const DEFAULT_P95_THRESHOLD: f64 = 100.0;
pub const DEFAULT_JITTER_THRESHOLD: f64 = 20.0;
/// Seconds a condition must persist before an event is emitted.
pub const BAD_CONDITION_DURATION_S: u32 = 10;
pub const HTTP_WS_PORT: u16 = 7331;
pub const MAX_TARGETS: usize = 10;
pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_HOST_LEN: usize = 255;

pub const PROBE_INTERVAL_RANGE_MS: std::ops::RangeInclusive<u32> = 100..=10_000;
pub const PROBE_TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u32> = 100..=30_000;

/// Which probe transport drives RTT measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    Tcp,
    Icmp,
}

/// Threshold set for bad-condition detection.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub loss_pct: f64,
    pub p95_ms: f64,
    pub jitter_ms: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            loss_pct: DEFAULT_LOSS_THRESHOLD,
            p95_ms: DEFAULT_P95_THRESHOLD,
            jitter_ms: DEFAULT_JITTER_THRESHOLD,
        }
    }
}

/// One monitored endpoint. `id` is the slugified label, unique per config.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub label: String,
    pub enabled: bool,
}

/// Global monitor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub probe_interval_ms: u32,
    pub probe_timeout_ms: u32,
    pub http_port: u16,
    pub probe_type: ProbeType,
    pub thresholds: Thresholds,
    targets: Vec<Target>,
}

impl Default for Config {
    /// Built-in defaults, including the two stock targets.
    fn default() -> Self {
        let mut cfg = Self::empty();
        // Stock targets; both well-known anycast resolvers with TLS open.
        cfg.add_target("1.1.1.1", 443, "Cloudflare")
            .expect("stock target is valid");
        cfg.add_target("8.8.8.8", 443, "Google")
            .expect("stock target is valid");
        cfg
    }
}

impl Config {
    /// Defaults with no targets.
    pub fn empty() -> Self {
        Self {
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            http_port: HTTP_WS_PORT,
            probe_type: ProbeType::Tcp,
            thresholds: Thresholds::default(),
            targets: Vec::new(),
        }
    }

    /// Loads `config.toml` from `path`, falling back to [`Config::default`]
    /// when the file does not exist. A present-but-broken file is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&text).map_err(|source| CoreError::ConfigParse {
            path: path.display().to_string(),
            source,
        })?;

        let mut cfg = Self::empty();
        if let Some(v) = file.probe_interval_ms {
            if PROBE_INTERVAL_RANGE_MS.contains(&v) {
                cfg.probe_interval_ms = v;
            }
        }
        if let Some(v) = file.probe_timeout_ms {
            if PROBE_TIMEOUT_RANGE_MS.contains(&v) {
                cfg.probe_timeout_ms = v;
            }
        }
        if let Some(v) = file.http_port {
            cfg.http_port = v;
        }
        if let Some(v) = file.probe_type {
            cfg.probe_type = v;
        }
        if let Some(t) = file.thresholds {
            cfg.thresholds = t;
        }
        match file.targets {
            // No [[targets]] tables at all: keep the stock targets.
            None => {
                for t in Config::default().targets {
                    cfg.targets.push(t);
                }
            }
            Some(entries) => {
                for entry in entries {
                    let target = cfg.add_target(&entry.host, entry.port, &entry.label)?;
                    let id = target.id.clone();
                    if !entry.enabled {
                        if let Some(t) = cfg.targets.iter_mut().find(|t| t.id == id) {
                            t.enabled = false;
                        }
                    }
                }
            }
        }
        Ok(cfg)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Adds a target, deriving its id from the label. Label and host are
    /// truncated to their ingestion bounds before the slug is computed.
    pub fn add_target(&mut self, host: &str, port: u16, label: &str) -> Result<&Target, CoreError> {
        if self.targets.len() >= MAX_TARGETS {
            return Err(CoreError::TargetLimit {
                limit: MAX_TARGETS,
            });
        }
        let host = truncate(host.trim(), MAX_HOST_LEN);
        let label = truncate(label.trim(), MAX_LABEL_LEN);
        if host.is_empty() {
            return Err(CoreError::InvalidTarget("host must not be empty".into()));
        }
        let id = slugify(&label);
        if id.is_empty() {
            return Err(CoreError::InvalidTarget(format!(
                "label '{label}' does not produce a usable id"
            )));
        }
        if self.find_target(&id).is_some() {
            return Err(CoreError::DuplicateId(id));
        }

        self.targets.push(Target {
            id,
            host,
            port,
            label,
            enabled: true,
        });
        Ok(self.targets.last().unwrap())
    }

    pub fn remove_target(&mut self, id: &str) -> Result<(), CoreError> {
        let idx = self
            .targets
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| CoreError::UnknownTarget(id.to_string()))?;
        self.targets.remove(idx);
        Ok(())
    }

    pub fn find_target(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// Applies a partial update. Out-of-range fields are ignored rather than
    /// rejected, so a sloppy client cannot wedge the monitor.
    pub fn apply_update(&mut self, update: &ConfigUpdate) {
        if let Some(v) = update.probe_interval_ms {
            if PROBE_INTERVAL_RANGE_MS.contains(&v) {
                self.probe_interval_ms = v;
            }
        }
        if let Some(v) = update.probe_timeout_ms {
            if PROBE_TIMEOUT_RANGE_MS.contains(&v) {
                self.probe_timeout_ms = v;
            }
        }
        for (value, slot, max) in [
            (update.loss_pct(), &mut self.thresholds.loss_pct, 100.0),
            (update.p95_ms(), &mut self.thresholds.p95_ms, 10_000.0),
            (update.jitter_ms(), &mut self.thresholds.jitter_ms, 10_000.0),
        ] {
            if let Some(v) = value {
                if (0.0..=max).contains(&v) {
                    *slot = v;
                }
            }
        }
    }
}

/// Partial configuration patch, as accepted over the HTTP API. Threshold
/// fields are accepted both flat and nested under `thresholds`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub probe_interval_ms: Option<u32>,
    pub probe_timeout_ms: Option<u32>,
    pub loss_pct: Option<f64>,
    pub p95_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub thresholds: Option<ThresholdsUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdsUpdate {
    pub loss_pct: Option<f64>,
    pub p95_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

impl ConfigUpdate {
    fn loss_pct(&self) -> Option<f64> {
        self.loss_pct
            .or_else(|| self.thresholds.as_ref().and_then(|t| t.loss_pct))
    }

    fn p95_ms(&self) -> Option<f64> {
        self.p95_ms
            .or_else(|| self.thresholds.as_ref().and_then(|t| t.p95_ms))
    }

    fn jitter_ms(&self) -> Option<f64> {
        self.jitter_ms
            .or_else(|| self.thresholds.as_ref().and_then(|t| t.jitter_ms))
    }
}

/// `config.toml` schema. Every field is optional; absent fields fall back to
/// the built-in defaults.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    probe_interval_ms: Option<u32>,
    probe_timeout_ms: Option<u32>,
    http_port: Option<u16>,
    probe_type: Option<ProbeType>,
    thresholds: Option<Thresholds>,
    targets: Option<Vec<TargetEntry>>,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    host: String,
    #[serde(default = "default_target_port")]
    port: u16,
    label: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_target_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Derives a target id from its label: ASCII alphanumerics lowercased, runs
/// of spaces/hyphens/underscores collapsed to a single `-`, everything else
/// dropped, no leading or trailing `-`, at most [`MAX_LABEL_LEN`] chars.
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len().min(MAX_LABEL_LEN));
    for c in label.chars() {
        if slug.len() >= MAX_LABEL_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if c == ' ' || c == '-' || c == '_' {
            if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Cloudflare DNS"), "cloudflare-dns");
        assert_eq!(slugify("  hello  world "), "hello-world");
        // The em-dash is not an ASCII separator, so it is simply dropped.
        assert_eq!(slugify("A—B"), "ab");
        assert_eq!(slugify("snake_case_label"), "snake-case-label");
        assert_eq!(slugify("---"), "");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn test_slugify_idempotent() {
        for label in ["Cloudflare DNS", "A—B", "x__y--z", "Already-Slugged-1"] {
            let once = slugify(label);
            assert_eq!(slugify(&once), once);
        }
    }

    #[test]
    fn test_slugify_truncates() {
        let long = "a".repeat(200);
        assert_eq!(slugify(&long).len(), MAX_LABEL_LEN);
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.probe_interval_ms, 500);
        assert_eq!(cfg.probe_timeout_ms, 1500);
        assert_eq!(cfg.http_port, 7331);
        assert_eq!(cfg.probe_type, ProbeType::Tcp);
        assert_eq!(cfg.targets().len(), 2);
        assert_eq!(cfg.targets()[0].id, "cloudflare");
        assert_eq!(cfg.targets()[1].id, "google");
    }

    #[test]
    fn test_add_target_rejects_duplicates() {
        let mut cfg = Config::empty();
        cfg.add_target("1.1.1.1", 443, "Home Router").unwrap();
        let err = cfg.add_target("10.0.0.1", 80, "home router").unwrap_err();
        assert!(matches!(err, CoreError::DuplicateId(id) if id == "home-router"));
    }

    #[test]
    fn test_add_target_rejects_empty() {
        let mut cfg = Config::empty();
        assert!(cfg.add_target("", 443, "Label").is_err());
        assert!(cfg.add_target("1.1.1.1", 443, "—").is_err());
    }

    #[test]
    fn test_target_limit() {
        let mut cfg = Config::empty();
        for i in 0..MAX_TARGETS {
            cfg.add_target("10.0.0.1", 80, &format!("target {i}")).unwrap();
        }
        let err = cfg.add_target("10.0.0.1", 80, "one too many").unwrap_err();
        assert!(matches!(err, CoreError::TargetLimit { .. }));
    }

    #[test]
    fn test_remove_target() {
        let mut cfg = Config::default();
        cfg.remove_target("cloudflare").unwrap();
        assert!(cfg.find_target("cloudflare").is_none());
        assert!(matches!(
            cfg.remove_target("cloudflare"),
            Err(CoreError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_apply_update_ranges() {
        let mut cfg = Config::default();
        cfg.apply_update(&ConfigUpdate {
            probe_interval_ms: Some(250),
            probe_timeout_ms: Some(99), // below the valid range: ignored
            loss_pct: Some(10.0),
            ..ConfigUpdate::default()
        });
        assert_eq!(cfg.probe_interval_ms, 250);
        assert_eq!(cfg.probe_timeout_ms, 1500);
        assert_eq!(cfg.thresholds.loss_pct, 10.0);
    }

    #[test]
    fn test_apply_update_nested_thresholds() {
        let mut cfg = Config::default();
        let update: ConfigUpdate =
            serde_json::from_str(r#"{"thresholds":{"p95_ms":250.0,"jitter_ms":20000.0}}"#).unwrap();
        cfg.apply_update(&update);
        assert_eq!(cfg.thresholds.p95_ms, 250.0);
        // 20000 is out of range: ignored.
        assert_eq!(cfg.thresholds.jitter_ms, DEFAULT_JITTER_THRESHOLD);
    }

    #[test]
    fn test_ingestion_bounds() {
        let mut cfg = Config::empty();
        let long_host = "h".repeat(400);
        let t = cfg.add_target(&long_host, 80, "Long Host").unwrap();
        assert_eq!(t.host.len(), MAX_HOST_LEN);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg.targets().len(), 2);
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
probe_interval_ms = 1000
probe_type = "icmp"

[thresholds]
loss_pct = 2.5
p95_ms = 80.0
jitter_ms = 15.0

[[targets]]
host = "192.168.1.1"
label = "Home Router"
port = 80

[[targets]]
host = "example.com"
label = "Example"
enabled = false
"#,
        )
        .unwrap();
        let cfg = Config::load_or_default(&path).unwrap();
        assert_eq!(cfg.probe_interval_ms, 1000);
        assert_eq!(cfg.probe_type, ProbeType::Icmp);
        assert_eq!(cfg.thresholds.loss_pct, 2.5);
        assert_eq!(cfg.targets().len(), 2);
        assert_eq!(cfg.targets()[0].id, "home-router");
        assert_eq!(cfg.targets()[1].port, 443);
        assert!(!cfg.targets()[1].enabled);
    }
}
