/// Progressive decoding of a child's structured stdout.
///
/// The producer writes one growing JSON document (or a run of documents)
/// over time. Most lines leave the accumulator unparseable; that is the
/// normal state while output is still arriving, so a failed attempt is
/// silent. Only a fully consumed accumulator yields a view, and the most
/// recent complete document wins.
///
/// Nesting depth is tracked as lines arrive, so only the text appended since
/// the last complete document is parsed, and only once it closes at depth
/// zero. Large single-shot outputs are parsed once instead of per line.
use serde_json::Value;

/// Terminal decode failure: the stream ended without a complete document.
#[derive(Debug)]
pub enum DecodeError {
    /// Nothing but whitespace was received.
    NoOutput,
    /// Output was received but never formed complete documents.
    Malformed {
        bytes: usize,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::NoOutput => write!(f, "no structured output received"),
            DecodeError::Malformed { bytes, source } => {
                write!(f, "parse error after {bytes} bytes of output: {source}")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::NoOutput => None,
            DecodeError::Malformed { source, .. } => Some(source),
        }
    }
}

/// Lexical position inside the accumulated text.
#[derive(Debug, Default)]
struct Nesting {
    depth: i64,
    in_string: bool,
    escaped: bool,
}

impl Nesting {
    fn scan(&mut self, text: &str) {
        for b in text.bytes() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => self.depth -= 1,
                _ => {}
            }
        }
    }

    /// Every opened value has been closed (or over-closed, which the parser
    /// then rejects).
    fn at_boundary(&self) -> bool {
        self.depth <= 0 && !self.in_string
    }
}

/// Append-only text accumulator with per-line decode attempts.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: String,
    progress_field: String,
    nesting: Nesting,
    /// End of the text already parsed into complete documents.
    settled: usize,
    latest: Option<Value>,
    /// Set once the text stops being a run of documents. Appending can't
    /// repair it.
    broken: bool,
}

impl StreamDecoder {
    pub fn new(progress_field: impl Into<String>) -> Self {
        Self {
            buffer: String::new(),
            progress_field: progress_field.into(),
            nesting: Nesting::default(),
            settled: 0,
            latest: None,
            broken: false,
        }
    }

    /// Append one line (terminator included) and try to decode.
    ///
    /// Returns the full progress array of the current document when the
    /// accumulator parses and the document carries the progress field.
    pub fn push_line(&mut self, line: &str) -> Option<Vec<Value>> {
        self.buffer.push_str(line);
        if self.broken {
            return None;
        }
        self.nesting.scan(line);
        if !self.nesting.at_boundary() {
            return None;
        }

        match latest_document(&self.buffer[self.settled..]) {
            Ok(doc) => {
                self.settled = self.buffer.len();
                if doc.is_some() {
                    self.latest = doc;
                }
            }
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    bytes = self.buffer.len(),
                    "output is not a JSON document"
                );
                self.broken = true;
                return None;
            }
        }

        self.latest
            .as_ref()
            .and_then(|doc| doc.get(self.progress_field.as_str()))
            .and_then(Value::as_array)
            .cloned()
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Final decode of everything received.
    pub fn finish(self) -> Result<Value, DecodeError> {
        if self.buffer.trim().is_empty() {
            return Err(DecodeError::NoOutput);
        }
        if !self.broken && self.buffer[self.settled..].trim().is_empty() {
            if let Some(doc) = self.latest {
                return Ok(doc);
            }
        }
        // Re-parse the whole text so the error position covers all output.
        match latest_document(&self.buffer) {
            Ok(Some(doc)) => Ok(doc),
            Ok(None) => Err(DecodeError::NoOutput),
            Err(source) => Err(DecodeError::Malformed {
                bytes: self.buffer.len(),
                source,
            }),
        }
    }
}

/// Parse `text` as whitespace-separated documents and return the last one.
///
/// Fails if any part of the text is not a complete document, including a
/// truncated trailing document.
fn latest_document(text: &str) -> Result<Option<Value>, serde_json::Error> {
    let mut latest = None;
    for doc in serde_json::Deserializer::from_str(text).into_iter::<Value>() {
        latest = Some(doc?);
    }
    Ok(latest)
}
