use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of check a probe performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Ping,
    Http,
    Resource,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Ping => write!(f, "ping"),
            CheckKind::Http => write!(f, "http"),
            CheckKind::Resource => write!(f, "resource"),
        }
    }
}

/// Status of an executed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Degraded,
    Fail,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Ok => write!(f, "ok"),
            ProbeStatus::Degraded => write!(f, "degraded"),
            ProbeStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Inclusive HTTP status range a response is expected to fall in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRange {
    pub lo: u16,
    pub hi: u16,
}

impl StatusRange {
    pub const DEFAULT: StatusRange = StatusRange { lo: 200, hi: 299 };

    /// Parse `"200-299"` or a single `"200"`.
    pub fn parse(text: &str) -> Option<StatusRange> {
        let text = text.trim();
        if let Some((lo, hi)) = text.split_once('-') {
            let lo = lo.trim().parse().ok()?;
            let hi = hi.trim().parse().ok()?;
            (lo <= hi).then_some(StatusRange { lo, hi })
        } else {
            let code = text.parse().ok()?;
            Some(StatusRange { lo: code, hi: code })
        }
    }

    pub fn contains(&self, status: u16) -> bool {
        self.lo <= status && status <= self.hi
    }
}

impl fmt::Display for StatusRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi { write!(f, "{}", self.lo) } else { write!(f, "{}-{}", self.lo, self.hi) }
    }
}

/// Kind-specific parameters of a resolved check, placeholders already
/// substituted
#[derive(Debug, Clone, PartialEq)]
pub enum CheckParams {
    Ping {
        host: String,
        count: u32,
    },
    Http {
        url: String,
        method: String,
        expect_status: StatusRange,
        expect_text: Option<String>,
        accept_error_substring: Option<String>,
    },
    Resource {
        process_limit: usize,
        gpu: bool,
        proc_root: PathBuf,
    },
}

/// Identity of a schedule entry: one target bound to one profile check
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub target: String,
    pub check: String,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target, self.check)
    }
}

/// A profile check definition bound to a concrete target
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCheck {
    pub target_id: String,
    pub name: String,
    pub params: CheckParams,
    pub timeout: Duration,
    pub interval: Duration,
}

impl ResolvedCheck {
    pub fn kind(&self) -> CheckKind {
        match self.params {
            CheckParams::Ping { .. } => CheckKind::Ping,
            CheckParams::Http { .. } => CheckKind::Http,
            CheckParams::Resource { .. } => CheckKind::Resource,
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey { target: self.target_id.clone(), check: self.name.clone() }
    }
}

/// Normalized result of executing one resolved check once
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    /// Kind of check that produced this outcome
    pub kind: CheckKind,

    /// Target identifier from the inventory
    pub target: String,

    /// Check name from the profile
    pub check: String,

    /// ok, degraded or fail
    pub status: ProbeStatus,

    /// When the outcome was produced (UTC)
    pub ts: DateTime<Utc>,

    /// Wall time of the probe in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    /// HTTP status code (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,

    /// Sampled values (resource checks)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,

    /// Error detail (if the check failed or degraded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeOutcome {
    /// Create an outcome for a check; starts as a failure until marked
    pub fn new(check: &ResolvedCheck) -> Self {
        Self {
            kind: check.kind(),
            target: check.target_id.clone(),
            check: check.name.clone(),
            status: ProbeStatus::Fail,
            ts: Utc::now(),
            latency_ms: None,
            http_status: None,
            values: None,
            error: None,
        }
    }

    /// Mark the check as successful
    pub fn ok(mut self, latency_ms: Option<u64>) -> Self {
        self.status = ProbeStatus::Ok;
        self.latency_ms = latency_ms;
        self
    }

    /// Mark the check as degraded: it responded, but outside expectations
    pub fn degraded(mut self, latency_ms: Option<u64>, detail: impl Into<String>) -> Self {
        self.status = ProbeStatus::Degraded;
        self.latency_ms = latency_ms;
        self.error = Some(detail.into());
        self
    }

    /// Mark the check as failed with error detail
    pub fn fail(mut self, detail: impl Into<String>) -> Self {
        self.status = ProbeStatus::Fail;
        self.error = Some(detail.into());
        self
    }

    pub fn with_http_status(mut self, status: Option<u16>) -> Self {
        self.http_status = status;
        self
    }

    pub fn with_values(mut self, values: Option<serde_json::Value>) -> Self {
        self.values = values;
        self
    }
}
