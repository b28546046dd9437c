/// Terminal presentation of a session: one row per new interval with a text
/// bar, then the summary or the failure.
use crate::dispatch::{ProgressSnapshot, SessionObserver, SessionResult};
use crate::report::{samples, StreamTotals, TestSummary, ThroughputSample};
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const BAR_WIDTH: usize = 40;

/// Shared flag telling the caller whether the run succeeded.
#[derive(Debug, Clone, Default)]
pub struct Verdict(Arc<AtomicBool>);

impl Verdict {
    pub fn succeeded(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct TerminalObserver<W> {
    out: W,
    progress_field: String,
    printed: usize,
    peak_bps: f64,
    verdict: Verdict,
}

impl<W: Write + Send> TerminalObserver<W> {
    pub fn new(out: W, progress_field: &str) -> (Self, Verdict) {
        let verdict = Verdict::default();
        let observer = Self {
            out,
            progress_field: progress_field.to_string(),
            printed: 0,
            peak_bps: 0.0,
            verdict: verdict.clone(),
        };
        (observer, verdict)
    }

    /// Print rows for samples not shown yet. Snapshots carry the full list,
    /// so only the tail beyond `printed` is new.
    fn print_new_rows(&mut self, rows: &[ThroughputSample]) -> std::io::Result<()> {
        if self.printed == 0 && !rows.is_empty() {
            writeln!(self.out, "{:>4}  {:>15}  {:>10}", "#", "interval (s)", "Mbit/s")?;
        }
        for row in rows.iter().skip(self.printed) {
            self.peak_bps = self.peak_bps.max(row.bits_per_second);
            writeln!(
                self.out,
                "{:>4}  {:>7.2}-{:<7.2}  {:>10.2}  {}",
                row.index,
                row.start,
                row.end,
                row.mbps(),
                bar(row.bits_per_second, self.peak_bps)
            )?;
        }
        self.printed = self.printed.max(rows.len());
        Ok(())
    }

    fn print_progress(&mut self, snapshot: &ProgressSnapshot) -> std::io::Result<()> {
        let rows = samples(&snapshot.records);
        if rows.is_empty() && !snapshot.records.is_empty() {
            return writeln!(
                self.out,
                "progress: {} records",
                snapshot.records.len()
            );
        }
        self.print_new_rows(&rows)
    }

    fn print_result(&mut self, result: &SessionResult) -> std::io::Result<bool> {
        let Some(doc) = result.document() else {
            let failure = result.failure().unwrap_or_default();
            writeln!(self.out, "error: {failure}")?;
            for line in &result.stderr_tail {
                writeln!(self.out, "  | {line}")?;
            }
            return Ok(false);
        };

        let summary = TestSummary::from_document(doc);
        if let Some(err) = &summary.tool_error {
            writeln!(self.out, "iperf3 error: {err}")?;
            return Ok(false);
        }

        if let Some(Value::Array(records)) = doc.get(self.progress_field.as_str()) {
            self.print_new_rows(&samples(records))?;
        }
        if result.cancelled {
            writeln!(self.out, "test stopped early")?;
        }
        if let Some(sent) = &summary.sent {
            writeln!(self.out, "{}", totals_line("sender", sent))?;
        }
        if let Some(received) = &summary.received {
            writeln!(self.out, "{}", totals_line("receiver", received))?;
        }
        writeln!(
            self.out,
            "finished in {:.1}s (exit code {})",
            result.duration.as_secs_f64(),
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string())
        )?;
        Ok(true)
    }
}

impl<W: Write + Send> SessionObserver for TerminalObserver<W> {
    fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
        if let Err(e) = self.print_progress(snapshot) {
            tracing::debug!(error = %e, "failed to write progress");
        }
    }

    fn on_complete(&mut self, result: SessionResult) {
        let ok = match self.print_result(&result) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(error = %e, "failed to write result");
                result.is_completed()
            }
        };
        let _ = self.out.flush();
        self.verdict.0.store(ok, Ordering::Release);
    }
}

fn totals_line(label: &str, totals: &StreamTotals) -> String {
    let mut line = format!(
        "{label:>8}: {:.2} Mbit/s over {:.1}s ({} bytes)",
        totals.mbps(),
        totals.seconds,
        totals.bytes
    );
    if let Some(r) = totals.retransmits {
        line.push_str(&format!(", {r} retransmits"));
    }
    line
}

fn bar(value: f64, peak: f64) -> String {
    if peak <= 0.0 || value <= 0.0 {
        return String::new();
    }
    let filled = ((value / peak) * BAR_WIDTH as f64).round() as usize;
    "#".repeat(filled.clamp(1, BAR_WIDTH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeError;
    use crate::dispatch::{SessionId, SessionOutcome};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn interval(start: f64, bps: f64) -> Value {
        json!({"sum": {"start": start, "end": start + 1.0, "bits_per_second": bps}})
    }

    fn result(outcome: SessionOutcome) -> SessionResult {
        SessionResult {
            session: SessionId(1),
            outcome,
            cancelled: false,
            exit_code: Some(0),
            pid: Some(42),
            started_at: Utc::now(),
            duration: Duration::from_millis(10_300),
            stderr_tail: vec!["iperf3: error - unable to connect".to_string()],
        }
    }

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_progress_prints_only_new_rows() {
        let (mut obs, _) = TerminalObserver::new(Vec::new(), "intervals");
        obs.on_progress(&ProgressSnapshot {
            session: SessionId(1),
            sequence: 1,
            records: vec![interval(0.0, 100e6)],
        });
        obs.on_progress(&ProgressSnapshot {
            session: SessionId(1),
            sequence: 2,
            records: vec![interval(0.0, 100e6), interval(1.0, 50e6)],
        });
        let text = output(obs.out);
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 3, "{text}");
        assert!(rows[0].contains("Mbit/s"));
        assert!(rows[1].contains("100.00"));
        assert!(rows[2].contains("50.00"));
        assert!(rows[1].ends_with(&"#".repeat(BAR_WIDTH)));
        assert!(rows[2].ends_with(&"#".repeat(BAR_WIDTH / 2)));
    }

    #[test]
    fn test_completed_result_prints_summary_and_succeeds() {
        let (mut obs, verdict) = TerminalObserver::new(Vec::new(), "intervals");
        let doc = json!({
            "intervals": [interval(0.0, 940e6)],
            "end": {"sum_sent": {"seconds": 10.0, "bytes": 100u64,
                                 "bits_per_second": 940e6, "retransmits": 0}}
        });
        obs.on_complete(result(SessionOutcome::Completed(doc)));
        assert!(verdict.succeeded());
        let text = output(obs.out);
        assert!(text.contains("940.00"), "{text}");
        assert!(text.contains("sender: 940.00 Mbit/s"), "{text}");
        assert!(text.contains("finished in 10.3s"), "{text}");
    }

    #[test]
    fn test_tool_error_is_a_failure() {
        let (mut obs, verdict) = TerminalObserver::new(Vec::new(), "intervals");
        let doc = json!({"intervals": [], "error": "unable to connect to server"});
        obs.on_complete(result(SessionOutcome::Completed(doc)));
        assert!(!verdict.succeeded());
        assert!(output(obs.out).contains("iperf3 error: unable to connect"));
    }

    #[test]
    fn test_decode_failure_prints_stderr_tail() {
        let (mut obs, verdict) = TerminalObserver::new(Vec::new(), "intervals");
        obs.on_complete(result(SessionOutcome::DecodeFailed(DecodeError::NoOutput)));
        assert!(!verdict.succeeded());
        let text = output(obs.out);
        assert!(text.contains("error: no structured output received"));
        assert!(text.contains("  | iperf3: error - unable to connect"));
    }

    #[test]
    fn test_generic_records_are_counted() {
        let (mut obs, _) = TerminalObserver::new(Vec::new(), "intervals");
        obs.on_progress(&ProgressSnapshot {
            session: SessionId(1),
            sequence: 1,
            records: vec![json!({"value": 1}), json!({"value": 2})],
        });
        assert_eq!(output(obs.out), "progress: 2 records\n");
    }

    #[test]
    fn test_bar_scales_to_peak() {
        assert_eq!(bar(0.0, 10.0), "");
        assert_eq!(bar(10.0, 10.0).len(), BAR_WIDTH);
        assert_eq!(bar(0.001, 10.0).len(), 1);
    }
}
