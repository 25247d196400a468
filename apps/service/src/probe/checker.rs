use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};
use tokio::process::Command;

use super::types::{CheckParams, ResolvedCheck};

/// What a checker observed. An `Err` from a checker means the target did
/// not respond at all; `anomaly` means it responded outside expectations.
#[derive(Debug, Default)]
pub struct Observation {
    pub latency_ms: Option<u64>,
    pub http_status: Option<u16>,
    pub values: Option<Value>,
    pub anomaly: Option<String>,
}

/// Checker trait for the different kinds of probe
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, check: &ResolvedCheck) -> Result<Observation>;
}

/// Reachability checker: spawns the system ping binary and inspects its
/// exit status. The command is configurable so restricted environments can
/// substitute their own probe.
pub struct PingChecker {
    command: String,
}

impl PingChecker {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait::async_trait]
impl Checker for PingChecker {
    async fn check(&self, check: &ResolvedCheck) -> Result<Observation> {
        let CheckParams::Ping { host, count } = &check.params else {
            bail!("not a ping check");
        };

        let start = Instant::now();
        let output = Command::new(&self.command)
            .arg("-c")
            .arg(count.to_string())
            .arg("-n")
            .arg(host)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow!("failed to run {}: {e}", self.command))?;

        if !output.status.success() {
            bail!("ping {host} exited with {}", output.status);
        }
        Ok(Observation {
            latency_ms: Some(start.elapsed().as_millis() as u64),
            ..Default::default()
        })
    }
}

/// HTTP checker
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new() -> Result<Self> {
        // per-request timeouts come from the resolved check
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Checker for HttpChecker {
    async fn check(&self, check: &ResolvedCheck) -> Result<Observation> {
        let CheckParams::Http { url, method, expect_status, expect_text, accept_error_substring } =
            &check.params
        else {
            bail!("not an http check");
        };

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| anyhow!("invalid http method {method:?}"))?;

        let start = Instant::now();
        let response =
            self.client.request(method, url.as_str()).timeout(check.timeout).send().await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let mut observation = Observation {
                    latency_ms: Some(start.elapsed().as_millis() as u64),
                    http_status: Some(status),
                    ..Default::default()
                };

                if !expect_status.contains(status) {
                    observation.anomaly =
                        Some(format!("unexpected status {status}, expected {expect_status}"));
                } else if let Some(text) = expect_text {
                    // a body that cannot be read is a transport failure,
                    // not a missing-text anomaly
                    let body = response
                        .text()
                        .await
                        .map_err(|error| anyhow!("failed to read response body: {error}"))?;
                    if !body.contains(text.as_str()) {
                        observation.anomaly =
                            Some(format!("expected text {text:?} not found in response body"));
                    }
                }
                Ok(observation)
            }
            Err(error) => {
                let detail = error.to_string();
                // some endpoints are expected to refuse plain probes; a
                // configured substring marks that refusal as healthy
                if let Some(accept) = accept_error_substring {
                    if detail.contains(accept.as_str()) {
                        return Ok(Observation {
                            latency_ms: Some(start.elapsed().as_millis() as u64),
                            ..Default::default()
                        });
                    }
                }
                Err(anyhow!("http request failed: {detail}"))
            }
        }
    }
}

/// Resource checker: samples CPU, memory and a bounded process table from
/// the proc filesystem, plus optional GPU utilization via nvidia-smi.
pub struct ResourceChecker;

#[async_trait::async_trait]
impl Checker for ResourceChecker {
    async fn check(&self, check: &ResolvedCheck) -> Result<Observation> {
        let CheckParams::Resource { process_limit, gpu, proc_root } = &check.params else {
            bail!("not a resource check");
        };

        let mut values = serde_json::Map::new();
        values.insert("cpu".into(), read_cpu(proc_root).await?);
        values.insert("memory".into(), read_memory(proc_root).await?);
        values.insert("processes".into(), read_processes(proc_root, *process_limit).await?);

        if *gpu {
            match read_gpu().await {
                Ok(gpus) => {
                    values.insert("gpu".into(), gpus);
                }
                // no GPU or no driver is expected on most hosts
                Err(error) => tracing::debug!(%error, "gpu sample unavailable"),
            }
        }

        Ok(Observation { values: Some(Value::Object(values)), ..Default::default() })
    }
}

/// Aggregate CPU jiffies from the first line of `stat`.
async fn read_cpu(proc_root: &Path) -> Result<Value> {
    let text = tokio::fs::read_to_string(proc_root.join("stat")).await?;
    let line = text.lines().next().ok_or_else(|| anyhow!("empty stat file"))?;
    let mut fields = line.split_whitespace();
    if fields.next() != Some("cpu") {
        bail!("malformed stat file: no aggregate cpu line");
    }

    const KEYS: [&str; 10] =
        ["user", "nice", "system", "idle", "iowait", "irq", "softirq", "steal", "guest", "guest_nice"];
    let mut cpu = serde_json::Map::new();
    for (key, field) in KEYS.iter().zip(fields) {
        if let Ok(value) = field.parse::<u64>() {
            cpu.insert((*key).into(), json!(value));
        }
    }
    Ok(Value::Object(cpu))
}

/// Key/value pairs from `meminfo`, in kilobytes.
async fn read_memory(proc_root: &Path) -> Result<Value> {
    let text = tokio::fs::read_to_string(proc_root.join("meminfo")).await?;
    let mut memory = serde_json::Map::new();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else { continue };
        let Some(first) = rest.split_whitespace().next() else { continue };
        if let Ok(value) = first.parse::<u64>() {
            memory.insert(key.trim().into(), json!(value));
        }
    }
    Ok(Value::Object(memory))
}

/// Up to `limit` entries from the process table: pid, command, cpu times
/// and resident set size. Processes that vanish mid-read are skipped.
async fn read_processes(proc_root: &Path, limit: usize) -> Result<Value> {
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(proc_root).await?;

    while let Some(entry) = dir.next_entry().await? {
        if entries.len() >= limit {
            break;
        }
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u64>().ok()) else { continue };

        let Ok(stat) = tokio::fs::read_to_string(entry.path().join("stat")).await else { continue };
        let Some(sample) = parse_process_stat(pid, &stat) else { continue };

        let cmdline = tokio::fs::read_to_string(entry.path().join("cmdline"))
            .await
            .map(|raw| raw.replace('\0', " ").trim().chars().take(100).collect::<String>())
            .unwrap_or_default();

        let (pid, comm, utime, stime, rss) = sample;
        let cmdline = if cmdline.is_empty() { comm.clone() } else { cmdline };
        entries.push(json!({
            "pid": pid,
            "comm": comm,
            "cmdline": cmdline,
            "utime": utime,
            "stime": stime,
            "rss_pages": rss,
        }));
    }
    Ok(Value::Array(entries))
}

/// Parse one `stat` line. The command name is parenthesized and may itself
/// contain spaces, so fields are counted from the closing paren.
fn parse_process_stat(pid: u64, stat: &str) -> Option<(u64, String, u64, u64, i64)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();

    // fields 14 (utime), 15 (stime) and 24 (rss), counted 1-based from pid
    let utime = rest.get(11)?.parse().ok()?;
    let stime = rest.get(12)?.parse().ok()?;
    let rss = rest.get(21)?.parse().ok()?;
    Some((pid, comm, utime, stime, rss))
}

/// One object per GPU reported by nvidia-smi.
async fn read_gpu() -> Result<Value> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total,memory.used,utilization.gpu", "--format=csv,noheader,nounits"])
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        bail!("nvidia-smi exited with {}", output.status);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut gpus = Vec::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 4 {
            continue;
        }
        let (Ok(total), Ok(used), Ok(util)) =
            (parts[1].parse::<u64>(), parts[2].parse::<u64>(), parts[3].parse::<u64>())
        else {
            continue;
        };
        gpus.push(json!({
            "name": parts[0],
            "memory_total_mb": total,
            "memory_used_mb": used,
            "utilization_percent": util,
        }));
    }
    Ok(Value::Array(gpus))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::probe::types::StatusRange;

    fn ping_check(command_target: &str) -> ResolvedCheck {
        ResolvedCheck {
            target_id: "node-1".into(),
            name: "reach".into(),
            params: CheckParams::Ping { host: command_target.into(), count: 1 },
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(10),
        }
    }

    fn http_check(url: &str, expect_status: StatusRange) -> ResolvedCheck {
        ResolvedCheck {
            target_id: "node-1".into(),
            name: "api".into(),
            params: CheckParams::Http {
                url: url.into(),
                method: "GET".into(),
                expect_status,
                expect_text: None,
                accept_error_substring: None,
            },
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(10),
        }
    }

    /// Listener that answers every connection with a fixed HTTP response.
    async fn serve_once(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn ping_succeeds_when_command_exits_zero() {
        let checker = PingChecker::new("true".into());
        let observation = checker.check(&ping_check("10.0.0.5")).await.unwrap();
        assert!(observation.latency_ms.is_some());
        assert!(observation.anomaly.is_none());
    }

    #[tokio::test]
    async fn ping_fails_when_command_exits_nonzero() {
        let checker = PingChecker::new("false".into());
        let error = checker.check(&ping_check("10.0.0.5")).await.unwrap_err();
        assert!(error.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn http_in_expected_range_is_clean() {
        let url = serve_once("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi").await;
        let checker = HttpChecker::new().unwrap();
        let observation = checker.check(&http_check(&url, StatusRange::DEFAULT)).await.unwrap();
        assert_eq!(observation.http_status, Some(200));
        assert!(observation.anomaly.is_none());
    }

    #[tokio::test]
    async fn http_outside_expected_range_is_an_anomaly() {
        let url = serve_once("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n").await;
        let checker = HttpChecker::new().unwrap();
        let observation = checker.check(&http_check(&url, StatusRange::DEFAULT)).await.unwrap();
        assert_eq!(observation.http_status, Some(404));
        assert!(observation.anomaly.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn http_missing_expected_text_is_an_anomaly() {
        let url = serve_once("HTTP/1.1 200 OK\r\ncontent-length: 7\r\n\r\ngoodbye").await;
        let mut check = http_check(&url, StatusRange::DEFAULT);
        if let CheckParams::Http { expect_text, .. } = &mut check.params {
            *expect_text = Some("healthy".into());
        }
        let checker = HttpChecker::new().unwrap();
        let observation = checker.check(&check).await.unwrap();
        assert!(observation.anomaly.unwrap().contains("healthy"));
    }

    #[tokio::test]
    async fn http_body_read_failure_is_an_error_not_an_anomaly() {
        // headers promise more body than arrives before the socket closes
        let url = serve_once("HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nhi").await;
        let mut check = http_check(&url, StatusRange::DEFAULT);
        if let CheckParams::Http { expect_text, .. } = &mut check.params {
            *expect_text = Some("healthy".into());
        }
        let checker = HttpChecker::new().unwrap();
        let error = checker.check(&check).await.unwrap_err();
        assert!(error.to_string().contains("body"));
    }

    #[tokio::test]
    async fn http_connection_refused_is_an_error() {
        // bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let checker = HttpChecker::new().unwrap();
        let result = checker.check(&http_check(&format!("http://{addr}/"), StatusRange::DEFAULT)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn http_accepted_error_substring_counts_as_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut check = http_check(&format!("http://{addr}/"), StatusRange::DEFAULT);
        if let CheckParams::Http { accept_error_substring, .. } = &mut check.params {
            *accept_error_substring = Some("error".into());
        }
        let checker = HttpChecker::new().unwrap();
        let observation = checker.check(&check).await.unwrap();
        assert!(observation.anomaly.is_none());
    }

    #[tokio::test]
    async fn resource_samples_proc_counters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stat"),
            "cpu  100 5 50 900 10 0 3 0 0 0\ncpu0 100 5 50 900 10 0 3 0 0 0\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemTotal: 2048 kB\nMemFree: 1024 kB\n").unwrap();
        let pid_dir = dir.path().join("42");
        std::fs::create_dir(&pid_dir).unwrap();
        std::fs::write(
            pid_dir.join("stat"),
            "42 (some proc) S 1 42 42 0 -1 4194560 0 0 0 0 7 3 0 0 20 0 1 0 100 1000000 256 18446744073709551615",
        )
        .unwrap();
        std::fs::write(pid_dir.join("cmdline"), "some\0proc\0--flag").unwrap();

        let check = ResolvedCheck {
            target_id: "local".into(),
            name: "system".into(),
            params: CheckParams::Resource {
                process_limit: 10,
                gpu: false,
                proc_root: dir.path().to_path_buf(),
            },
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(15),
        };

        let observation = ResourceChecker.check(&check).await.unwrap();
        let values = observation.values.unwrap();
        assert_eq!(values["cpu"]["user"], 100);
        assert_eq!(values["cpu"]["idle"], 900);
        assert_eq!(values["memory"]["MemTotal"], 2048);

        let processes = values["processes"].as_array().unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0]["pid"], 42);
        assert_eq!(processes[0]["comm"], "some proc");
        assert_eq!(processes[0]["utime"], 7);
        assert_eq!(processes[0]["stime"], 3);
        assert_eq!(processes[0]["rss_pages"], 256);
        assert_eq!(processes[0]["cmdline"], "some proc --flag");
    }

    #[tokio::test]
    async fn resource_fails_when_counters_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let check = ResolvedCheck {
            target_id: "local".into(),
            name: "system".into(),
            params: CheckParams::Resource {
                process_limit: 10,
                gpu: false,
                proc_root: dir.path().join("missing"),
            },
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(15),
        };
        assert!(ResourceChecker.check(&check).await.is_err());
    }
}
