use anyhow::Result;
use tokio::time::timeout;

use super::checker::{Checker, HttpChecker, PingChecker, ResourceChecker};
use super::types::{CheckKind, ProbeOutcome, ResolvedCheck};
use crate::config::Settings;

/// Capability the scheduler dispatches against. Infallible: every failure
/// is encoded in the outcome, nothing propagates past this boundary.
#[async_trait::async_trait]
pub trait ExecuteProbe: Send + Sync {
    async fn execute(&self, check: &ResolvedCheck) -> ProbeOutcome;
}

/// Probe executor - runs individual checks with a hard timeout
pub struct ProbeExecutor {
    ping: PingChecker,
    http: HttpChecker,
    resource: ResourceChecker,
}

impl ProbeExecutor {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            ping: PingChecker::new(settings.ping_command.clone()),
            http: HttpChecker::new()?,
            resource: ResourceChecker,
        })
    }
}

#[async_trait::async_trait]
impl ExecuteProbe for ProbeExecutor {
    async fn execute(&self, check: &ResolvedCheck) -> ProbeOutcome {
        let checker: &dyn Checker = match check.kind() {
            CheckKind::Ping => &self.ping,
            CheckKind::Http => &self.http,
            CheckKind::Resource => &self.resource,
        };

        match timeout(check.timeout, checker.check(check)).await {
            Ok(Ok(observation)) => {
                let outcome = ProbeOutcome::new(check)
                    .with_http_status(observation.http_status)
                    .with_values(observation.values);
                match observation.anomaly {
                    Some(detail) => outcome.degraded(observation.latency_ms, detail),
                    None => outcome.ok(observation.latency_ms),
                }
            }
            Ok(Err(error)) => ProbeOutcome::new(check).fail(error.to_string()),
            // the probe's future is dropped here, cancelling any in-flight
            // I/O or child process
            Err(_) => ProbeOutcome::new(check)
                .fail(format!("timed out after {}ms", check.timeout.as_millis())),
        }
    }
}
