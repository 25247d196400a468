//! Outcome emission: one JSON object per line on stdout.
//!
//! Each line carries the instance identity so downstream log queries can
//! filter per source. Writes flush immediately and never fail the polling
//! loop; a failed write is logged to the diagnostic stream and retried
//! once.

use std::io::{self, Write};

use serde::Serialize;
use tracing::{error, warn};

use crate::config::Settings;
use crate::probe::types::ProbeOutcome;

#[derive(Serialize)]
struct OutcomeRecord<'a> {
    #[serde(flatten)]
    outcome: &'a ProbeOutcome,
    instance_id: &'a str,
    instance_role: &'a str,
    host: &'a str,
}

pub struct Emitter {
    writer: Box<dyn Write + Send>,
    instance_id: String,
    instance_role: String,
    host: String,
}

impl Emitter {
    pub fn new(
        writer: Box<dyn Write + Send>,
        instance_id: String,
        instance_role: String,
        host: String,
    ) -> Self {
        Self { writer, instance_id, instance_role, host }
    }

    pub fn stdout(settings: &Settings) -> Self {
        Self::new(
            Box::new(io::stdout()),
            settings.instance_id.clone(),
            settings.instance_role.clone(),
            settings.host.clone(),
        )
    }

    /// Serialize and write one outcome line. Never returns an error: emit
    /// failures must not disturb scheduling.
    pub fn emit(&mut self, outcome: &ProbeOutcome) {
        let record = OutcomeRecord {
            outcome,
            instance_id: &self.instance_id,
            instance_role: &self.instance_role,
            host: &self.host,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to serialize probe outcome");
                return;
            }
        };

        if let Err(err) = write_line(&mut self.writer, &line) {
            warn!(error = %err, "outcome write failed, retrying");
            // the failed attempt may have stranded a partial fragment on
            // the stream; the retry leads with a newline so the fragment
            // ends as its own garbage line and the record stays parseable
            if let Err(err) = write_retry(&mut self.writer, &line) {
                error!(error = %err, "outcome write failed again, dropping record");
            }
        }
    }
}

fn write_line(writer: &mut Box<dyn Write + Send>, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_retry(writer: &mut Box<dyn Write + Send>, line: &str) -> io::Result<()> {
    writer.write_all(b"\n")?;
    write_line(writer, line)
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::test_support::SharedSink;
    use super::*;
    use crate::probe::types::{CheckParams, ProbeOutcome, ResolvedCheck};

    fn sample_check() -> ResolvedCheck {
        ResolvedCheck {
            target_id: "node-1".into(),
            name: "api".into(),
            params: CheckParams::Http {
                url: "http://10.0.0.5/health".into(),
                method: "GET".into(),
                expect_status: crate::probe::types::StatusRange::DEFAULT,
                expect_text: None,
                accept_error_substring: None,
            },
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(30),
        }
    }

    fn outcome() -> ProbeOutcome {
        ProbeOutcome::new(&sample_check()).ok(Some(12)).with_http_status(Some(200))
    }

    #[test]
    fn emits_one_parseable_line_with_required_fields() {
        let sink = SharedSink::default();
        let mut emitter =
            Emitter::new(Box::new(sink.clone()), "inst-1".into(), "gateway".into(), "host-a".into());

        emitter.emit(&outcome());
        emitter.emit(&outcome().fail("connection refused"));

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert_eq!(line["kind"], "http");
            assert_eq!(line["target"], "node-1");
            assert_eq!(line["check"], "api");
            assert_eq!(line["instance_id"], "inst-1");
            assert_eq!(line["instance_role"], "gateway");
            assert_eq!(line["host"], "host-a");
            assert!(line["ts"].is_string());
        }
        assert_eq!(lines[0]["status"], "ok");
        assert_eq!(lines[0]["latency_ms"], 12);
        assert_eq!(lines[0]["http_status"], 200);
        assert_eq!(lines[1]["status"], "fail");
        assert_eq!(lines[1]["error"], "connection refused");
    }

    #[test]
    fn absent_measurements_are_omitted_not_null() {
        let sink = SharedSink::default();
        let mut emitter =
            Emitter::new(Box::new(sink.clone()), "inst-1".into(), "gateway".into(), "host-a".into());
        emitter.emit(&ProbeOutcome::new(&sample_check()).fail("timed out"));

        let line = &sink.lines()[0];
        assert!(line.get("values").is_none());
        assert!(line.get("latency_ms").is_none());
    }

    #[test]
    fn write_failure_is_not_fatal() {
        struct FailingSink;
        impl std::io::Write for FailingSink {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("sink closed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut emitter =
            Emitter::new(Box::new(FailingSink), "inst-1".into(), "gateway".into(), "host-a".into());
        // must not panic or propagate
        emitter.emit(&outcome());
    }

    #[test]
    fn retry_after_partial_write_keeps_every_line_parseable() {
        use std::sync::{Arc, Mutex};

        /// Accepts a few bytes of the first write, errors once, then
        /// behaves. Models a pipe hiccup mid-`write_all`.
        struct FlakySink {
            buf: Arc<Mutex<Vec<u8>>>,
            fail_after: Option<usize>,
        }
        impl std::io::Write for FlakySink {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                if let Some(accept) = self.fail_after.take() {
                    let accept = accept.min(data.len());
                    self.buf.lock().unwrap().extend_from_slice(&data[..accept]);
                    return Err(std::io::Error::other("broken pipe"));
                }
                self.buf.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = FlakySink { buf: buf.clone(), fail_after: Some(5) };
        let mut emitter =
            Emitter::new(Box::new(sink), "inst-1".into(), "gateway".into(), "host-a".into());
        emitter.emit(&outcome());

        let raw = buf.lock().unwrap().clone();
        let text = String::from_utf8(raw).unwrap();
        let records: Vec<serde_json::Value> = text
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        // the retried record came through whole
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["target"], "node-1");
        assert_eq!(records[0]["status"], "ok");
        // the stranded fragment sits on its own line, never glued to a record
        for line in text.lines() {
            if serde_json::from_str::<serde_json::Value>(line).is_err() && !line.is_empty() {
                assert!(!line.ends_with('}'), "fragment merged with a record: {line}");
            }
        }
    }
}
