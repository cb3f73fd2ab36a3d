pub mod parse;

use std::fmt::Write;

/// Delta counter prefix emitted on the wire (U+2206 INCREMENT).
pub const DELTA_PREFIX: char = '\u{2206}';

/// Alternate delta prefix accepted on input (U+0394 GREEK CAPITAL DELTA).
pub const DELTA_PREFIX_ALT: char = '\u{0394}';

/// Histogram aggregation granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    /// The single-character wire marker following `!`.
    pub fn as_char(self) -> char {
        match self {
            Self::Minute => 'M',
            Self::Hour => 'H',
            Self::Day => 'D',
        }
    }

    /// Parses a wire marker back into a granularity.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'M' => Some(Self::Minute),
            'H' => Some(Self::Hour),
            'D' => Some(Self::Day),
            _ => None,
        }
    }
}

/// One histogram cluster: how many observations collapsed into which mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub count: u64,
    pub mean: f64,
}

/// A plain or delta-counter metric record.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    /// Unix seconds; the timestamp is optional on the wire.
    pub timestamp: Option<u64>,
    pub source: String,
    pub tags: Vec<(String, String)>,
    pub delta: bool,
}

/// A two-line histogram record: centroid line plus a valueless metric line.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramRecord {
    pub granularity: Granularity,
    /// Unix seconds.
    pub timestamp: u64,
    pub centroids: Vec<Centroid>,
    pub name: String,
    pub source: String,
    pub tags: Vec<(String, String)>,
}

impl HistogramRecord {
    /// Aggregate observation count across all centroids.
    pub fn total_count(&self) -> u64 {
        self.centroids.iter().map(|c| c.count).sum()
    }
}

/// A span record with millisecond start and duration.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub operation: String,
    pub source: String,
    pub tags: Vec<(String, String)>,
    pub start_ms: u64,
    pub duration_ms: u64,
}

/// Any record the encoder can put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Metric(MetricRecord),
    Histogram(HistogramRecord),
    Span(SpanRecord),
}

/// Encodes a record into its wire form, without a trailing newline.
///
/// Histogram records span two lines joined by a single `\n`; the caller
/// appends the record-terminating newline in all cases.
pub fn encode(record: &Record) -> String {
    match record {
        Record::Metric(m) => encode_metric(m),
        Record::Histogram(h) => encode_histogram(h),
        Record::Span(s) => encode_span(s),
    }
}

fn encode_metric(m: &MetricRecord) -> String {
    let mut line = String::with_capacity(64);
    if m.delta {
        line.push(DELTA_PREFIX);
    }
    line.push_str(&escape_token(&m.name));
    line.push(' ');
    line.push_str(&format_value(m.value));
    if let Some(ts) = m.timestamp {
        let _ = write!(line, " {ts}");
    }
    line.push_str(" source=");
    line.push_str(&escape_token(&m.source));
    append_tags(&mut line, &m.tags);
    line
}

fn encode_histogram(h: &HistogramRecord) -> String {
    let mut line = String::with_capacity(96);
    line.push('!');
    line.push(h.granularity.as_char());
    let _ = write!(line, " {} #{}", h.timestamp, h.total_count());
    for c in &h.centroids {
        let _ = write!(line, " {} {}", c.count, format_value(c.mean));
    }
    line.push('\n');
    line.push_str(&escape_token(&h.name));
    line.push_str(" source=");
    line.push_str(&escape_token(&h.source));
    append_tags(&mut line, &h.tags);
    line
}

fn encode_span(s: &SpanRecord) -> String {
    let mut line = String::with_capacity(64);
    line.push_str(&escape_token(&s.operation));
    line.push_str(" source=");
    line.push_str(&escape_token(&s.source));
    append_tags(&mut line, &s.tags);
    let _ = write!(line, " {} {}", s.start_ms, s.duration_ms);
    line
}

fn append_tags(line: &mut String, tags: &[(String, String)]) {
    for (key, value) in tags {
        line.push(' ');
        line.push_str(&escape_token(key));
        line.push('=');
        line.push_str(&escape_token(value));
    }
}

/// True if a name or tag value needs no quoting on the wire.
pub fn is_bare(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Quotes and escapes a token unless it is bare.
///
/// Escaping is a single pass, so each embedded `"` or `\` gains exactly
/// one backslash regardless of order.
pub fn escape_token(s: &str) -> String {
    if is_bare(s) {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Formats a metric value with magnitude-dependent precision.
///
/// NaN and infinities collapse to `0` so a bad sample can never poison
/// the wire.
pub fn format_value(v: f64) -> String {
    if v.is_nan() || v.is_infinite() {
        return "0".to_string();
    }

    let magnitude = v.abs();
    if magnitude < 0.001 {
        format!("{v:.6}")
    } else if magnitude < 1.0 {
        format!("{v:.3}")
    } else if magnitude < 1000.0 {
        format!("{v:.1}")
    } else {
        format!("{v:.0}")
    }
}
