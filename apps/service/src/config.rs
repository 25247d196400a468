use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use clap::Parser;
use thiserror::Error;

use crate::template::TemplateError;

/// Configuration-time failures. Fatal at startup; on reload the previous
/// good configuration is retained.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("duplicate target id {0:?} in inventory")]
    DuplicateTarget(String),

    #[error("profile {profile:?} has duplicate check name {check:?}")]
    DuplicateCheck { profile: String, check: String },

    #[error("target {target:?} references unknown profile {profile:?}")]
    UnknownProfile { target: String, profile: String },

    #[error("target {target:?}, check {check:?}: {source}")]
    Placeholder {
        target: String,
        check: String,
        #[source]
        source: TemplateError,
    },

    #[error("target {target:?}, check {check:?}: invalid url {url:?}: {source}")]
    InvalidUrl {
        target: String,
        check: String,
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("target {target:?}, check {check:?}: invalid http method {method:?}")]
    InvalidMethod { target: String, check: String, method: String },

    #[error("profile {profile:?}, check {check:?}: invalid status range {range:?}")]
    InvalidStatusRange { profile: String, check: String, range: String },

    #[error("profile {profile:?}, check {check:?}: missing field {field:?}")]
    MissingField { profile: String, check: String, field: &'static str },
}

/// Parse a duration string with an `ms`/`s`/`m`/`h` suffix, or a bare
/// number of seconds. Falls back to `default` on anything unparseable.
pub fn parse_duration(text: &str, default: Duration) -> Duration {
    let value = text.trim().to_ascii_lowercase();
    let seconds = if let Some(ms) = value.strip_suffix("ms") {
        ms.parse::<f64>().ok().map(|n| n / 1000.0)
    } else if let Some(s) = value.strip_suffix('s') {
        s.parse::<f64>().ok()
    } else if let Some(m) = value.strip_suffix('m') {
        m.parse::<f64>().ok().map(|n| n * 60.0)
    } else if let Some(h) = value.strip_suffix('h') {
        h.parse::<f64>().ok().map(|n| n * 3600.0)
    } else {
        value.parse::<f64>().ok()
    };

    match seconds {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
        _ => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_duration(name: &str, default: Duration) -> Duration {
    match env::var(name) {
        Ok(value) => parse_duration(&value, default),
        Err(_) => default,
    }
}

/// Best-effort hostname for the emitted records.
fn hostname() -> String {
    if let Ok(name) = env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Proc filesystem root: `/host/proc` when the host's proc is mounted into
/// the container, plain `/proc` otherwise.
fn default_proc_root() -> PathBuf {
    let host_proc = PathBuf::from("/host/proc");
    if host_proc.exists() { host_proc } else { PathBuf::from("/proc") }
}

#[derive(Debug, Parser)]
#[command(name = "lookout-service", about = "Periodic probing engine emitting NDJSON outcomes")]
pub struct Cli {
    /// Directory holding the inventory and profiles
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Inventory file name, relative to the config directory
    #[arg(long)]
    pub inventory: Option<String>,

    /// Profiles directory name, relative to the config directory
    #[arg(long)]
    pub profiles: Option<String>,

    /// Default check interval, e.g. "10s"
    #[arg(long)]
    pub poll_interval: Option<String>,

    /// Default per-check timeout, e.g. "5s"
    #[arg(long)]
    pub timeout: Option<String>,

    /// Worker pool size
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Ping binary to invoke for reachability checks
    #[arg(long)]
    pub ping_command: Option<String>,

    /// Echo requests per reachability check
    #[arg(long)]
    pub ping_count: Option<u32>,

    /// Process table depth for resource checks
    #[arg(long)]
    pub process_limit: Option<usize>,

    /// Sample GPU utilization via nvidia-smi
    #[arg(long)]
    pub gpu: bool,

    /// Identity attached to every emitted record
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Role attached to every emitted record
    #[arg(long)]
    pub instance_role: Option<String>,
}

/// Effective configuration: CLI flags over environment over defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_dir: PathBuf,
    pub inventory: String,
    pub profiles: String,
    pub poll_interval: Duration,
    pub interval_floor: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
    pub ping_command: String,
    pub ping_count: u32,
    pub process_limit: usize,
    pub gpu: bool,
    pub proc_root: PathBuf,
    pub instance_id: String,
    pub instance_role: String,
    pub host: String,
    pub shutdown_grace: Duration,
}

impl Settings {
    pub fn resolve(cli: Cli) -> Self {
        Self {
            config_dir: cli
                .config_dir
                .unwrap_or_else(|| PathBuf::from(env_string("LOOKOUT_CONFIG_DIR", "/etc/lookout"))),
            inventory: cli
                .inventory
                .unwrap_or_else(|| env_string("LOOKOUT_INVENTORY", "inventory.toml")),
            profiles: cli.profiles.unwrap_or_else(|| env_string("LOOKOUT_PROFILES_DIR", "profiles")),
            poll_interval: cli
                .poll_interval
                .map(|s| parse_duration(&s, Duration::from_secs(10)))
                .unwrap_or_else(|| env_duration("LOOKOUT_POLL_INTERVAL", Duration::from_secs(10))),
            interval_floor: env_duration("LOOKOUT_INTERVAL_FLOOR", Duration::from_secs(1)),
            timeout: cli
                .timeout
                .map(|s| parse_duration(&s, Duration::from_secs(5)))
                .unwrap_or_else(|| env_duration("LOOKOUT_REQUEST_TIMEOUT", Duration::from_secs(5))),
            concurrency: cli.concurrency.unwrap_or_else(|| env_parse("LOOKOUT_CONCURRENCY", 8)).max(1),
            ping_command: cli
                .ping_command
                .unwrap_or_else(|| env_string("LOOKOUT_PING_COMMAND", "ping")),
            ping_count: cli.ping_count.unwrap_or_else(|| env_parse("LOOKOUT_PING_COUNT", 1)).max(1),
            process_limit: cli
                .process_limit
                .unwrap_or_else(|| env_parse("LOOKOUT_PROCESS_LIMIT", 10)),
            gpu: cli.gpu || env_parse("LOOKOUT_GPU", false),
            proc_root: env::var("LOOKOUT_PROC_ROOT").map(PathBuf::from).unwrap_or_else(|_| default_proc_root()),
            instance_id: cli
                .instance_id
                .unwrap_or_else(|| env_string("INSTANCE_ID", "unknown-instance")),
            instance_role: cli.instance_role.unwrap_or_else(|| env_string("INSTANCE_ROLE", "host")),
            host: hostname(),
            shutdown_grace: env_duration("LOOKOUT_SHUTDOWN_GRACE", Duration::from_secs(5)),
        }
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.config_dir.join(&self.inventory)
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.config_dir.join(&self.profiles)
    }

    /// Intervals below the floor are clamped to avoid tight probe loops.
    pub fn clamp_interval(&self, interval: Duration) -> Duration {
        interval.max(self.interval_floor)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/lookout"),
            inventory: "inventory.toml".into(),
            profiles: "profiles".into(),
            poll_interval: Duration::from_secs(10),
            interval_floor: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            concurrency: 8,
            ping_command: "ping".into(),
            ping_count: 1,
            process_limit: 10,
            gpu: false,
            proc_root: PathBuf::from("/proc"),
            instance_id: "unknown-instance".into(),
            instance_role: "host".into(),
            host: "unknown".into(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Read a file with path context attached on failure.
pub(crate) fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}
