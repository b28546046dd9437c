/// Typed, read-only view of iperf3's `-J` document.
///
/// iperf3 shapes (only the fields read here):
/// - `intervals[].sum.{start,end,bits_per_second}`
/// - `end.sum_sent` / `end.sum_received` for TCP, `end.sum` for UDP
/// - top-level `error` when the test could not run
use serde::Deserialize;
use serde_json::Value;

/// Throughput measured over one reporting interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    /// 1-based position in the progress array.
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub bits_per_second: f64,
}

impl ThroughputSample {
    pub fn mbps(&self) -> f64 {
        self.bits_per_second / 1e6
    }
}

#[derive(Deserialize)]
struct IntervalRecord {
    sum: IntervalSum,
}

#[derive(Deserialize)]
struct IntervalSum {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    bits_per_second: f64,
}

/// Convert progress records into samples, skipping records without a `sum`.
pub fn samples(records: &[Value]) -> Vec<ThroughputSample> {
    records
        .iter()
        .enumerate()
        .filter_map(|(i, record)| {
            let parsed = IntervalRecord::deserialize(record).ok()?;
            Some(ThroughputSample {
                index: i + 1,
                start: parsed.sum.start,
                end: parsed.sum.end,
                bits_per_second: parsed.sum.bits_per_second,
            })
        })
        .collect()
}

/// Totals for one direction of a finished test.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct StreamTotals {
    #[serde(default)]
    pub seconds: f64,
    #[serde(default)]
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(default)]
    pub retransmits: Option<u64>,
}

impl StreamTotals {
    pub fn mbps(&self) -> f64 {
        self.bits_per_second / 1e6
    }
}

/// End-of-test summary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TestSummary {
    pub sent: Option<StreamTotals>,
    pub received: Option<StreamTotals>,
    /// iperf3 reports its own failures inside the document.
    pub tool_error: Option<String>,
}

impl TestSummary {
    pub fn from_document(doc: &Value) -> Self {
        let totals = |v: Option<&Value>| v.and_then(|v| StreamTotals::deserialize(v).ok());
        let end = doc.get("end");

        let sent = totals(end.and_then(|e| e.get("sum_sent")))
            .or_else(|| totals(end.and_then(|e| e.get("sum"))));
        let received = totals(end.and_then(|e| e.get("sum_received")));
        let tool_error = doc
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            sent,
            received,
            tool_error,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.tool_error.is_some()
    }
}
