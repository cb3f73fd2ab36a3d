use thiserror::Error;

use super::{
    Centroid, Granularity, HistogramRecord, MetricRecord, Record, SpanRecord, DELTA_PREFIX,
    DELTA_PREFIX_ALT,
};

/// Wire grammar violations.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("dangling escape")]
    DanglingEscape,
    #[error("histogram records span two lines; use parse_histogram")]
    HistogramPair,
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("missing source tag")]
    MissingSource,
    #[error("invalid granularity {0:?}")]
    InvalidGranularity(char),
    #[error("centroid counts sum to {summed}, line declares {declared}")]
    CentroidMismatch { declared: u64, summed: u64 },
    #[error("malformed line: {0}")]
    Malformed(String),
}

/// Parses one single-line record (metric, delta, or span).
///
/// Histogram first lines (starting with `!`) are rejected here because a
/// histogram record is only complete with its follow-up metric line.
pub fn parse_line(line: &str) -> Result<Record, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    if line.starts_with('!') {
        return Err(ParseError::HistogramPair);
    }

    let tokens = tokenize(line)?;
    if tokens.len() < 2 {
        return Err(ParseError::Malformed(line.to_string()));
    }

    let (delta, name) = strip_delta(&tokens[0])?;

    if is_value_token(&tokens[1]) {
        parse_metric(delta, name, &tokens[1..]).map(Record::Metric)
    } else {
        if delta {
            return Err(ParseError::Malformed(line.to_string()));
        }
        parse_span(name, &tokens[1..]).map(Record::Span)
    }
}

/// Parses a two-line histogram record: the `!` centroid line and its
/// valueless metric line.
pub fn parse_histogram(first: &str, second: &str) -> Result<HistogramRecord, ParseError> {
    let first = first.trim_end_matches(['\n', '\r']);
    let tokens = tokenize(first)?;
    if tokens.len() < 5 || !tokens[0].starts_with('!') {
        return Err(ParseError::Malformed(first.to_string()));
    }

    let marker = tokens[0]
        .chars()
        .nth(1)
        .ok_or_else(|| ParseError::Malformed(first.to_string()))?;
    let granularity = Granularity::from_char(marker).ok_or(ParseError::InvalidGranularity(marker))?;

    let timestamp: u64 = tokens[1]
        .parse()
        .map_err(|_| ParseError::InvalidTimestamp(tokens[1].clone()))?;

    let declared: u64 = tokens[2]
        .strip_prefix('#')
        .ok_or_else(|| ParseError::Malformed(first.to_string()))?
        .parse()
        .map_err(|_| ParseError::InvalidValue(tokens[2].clone()))?;

    let pair_tokens = &tokens[3..];
    if pair_tokens.is_empty() || pair_tokens.len() % 2 != 0 {
        return Err(ParseError::Malformed(first.to_string()));
    }

    let mut centroids = Vec::with_capacity(pair_tokens.len() / 2);
    for pair in pair_tokens.chunks(2) {
        let count: u64 = pair[0]
            .parse()
            .map_err(|_| ParseError::InvalidValue(pair[0].clone()))?;
        let mean: f64 = pair[1]
            .parse()
            .map_err(|_| ParseError::InvalidValue(pair[1].clone()))?;
        centroids.push(Centroid { count, mean });
    }

    let summed: u64 = centroids.iter().map(|c| c.count).sum();
    if summed != declared {
        return Err(ParseError::CentroidMismatch { declared, summed });
    }

    // Second line is a metric line carrying name, source, and tags only.
    let second = second.trim_end_matches(['\n', '\r']);
    let tokens = tokenize(second)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let name = unquote(&tokens[0])?;
    let (source, tags) = parse_tags(&tokens[1..])?;

    Ok(HistogramRecord {
        granularity,
        timestamp,
        centroids,
        name,
        source,
        tags,
    })
}

/// Parses a full emission body: newline-separated records, pairing
/// histogram lines with their follow-up metric lines.
pub fn parse_text(text: &str) -> Result<Vec<Record>, ParseError> {
    let mut records = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('!') {
            let second = lines.next().ok_or(ParseError::HistogramPair)?;
            records.push(Record::Histogram(parse_histogram(line, second)?));
        } else {
            records.push(parse_line(line)?);
        }
    }

    Ok(records)
}

fn parse_metric(delta: bool, name: String, rest: &[String]) -> Result<MetricRecord, ParseError> {
    let value: f64 = rest[0]
        .parse()
        .map_err(|_| ParseError::InvalidValue(rest[0].clone()))?;

    let mut idx = 1;
    let mut timestamp = None;
    if let Some(tok) = rest.get(idx) {
        if !tok.contains('=') {
            timestamp = Some(
                tok.parse::<u64>()
                    .map_err(|_| ParseError::InvalidTimestamp(tok.clone()))?,
            );
            idx += 1;
        }
    }

    let (source, tags) = parse_tags(&rest[idx..])?;

    Ok(MetricRecord {
        name,
        value,
        timestamp,
        source,
        tags,
        delta,
    })
}

fn parse_span(operation: String, rest: &[String]) -> Result<SpanRecord, ParseError> {
    if rest.len() < 3 {
        return Err(ParseError::Malformed(operation));
    }

    let (tag_tokens, timing) = rest.split_at(rest.len() - 2);
    let start_ms: u64 = timing[0]
        .parse()
        .map_err(|_| ParseError::InvalidTimestamp(timing[0].clone()))?;
    let duration_ms: u64 = timing[1]
        .parse()
        .map_err(|_| ParseError::InvalidTimestamp(timing[1].clone()))?;

    let (source, tags) = parse_tags(tag_tokens)?;

    Ok(SpanRecord {
        operation,
        source,
        tags,
        start_ms,
        duration_ms,
    })
}

/// Walks `key=value` tokens, extracting the mandatory source.
fn parse_tags(tokens: &[String]) -> Result<(String, Vec<(String, String)>), ParseError> {
    let mut source = None;
    let mut tags = Vec::new();

    for token in tokens {
        let (raw_key, raw_value) =
            split_kv(token).ok_or_else(|| ParseError::Malformed(token.clone()))?;
        let key = unquote(&raw_key)?;
        let value = unquote(&raw_value)?;
        if key == "source" && source.is_none() {
            source = Some(value);
        } else {
            tags.push((key, value));
        }
    }

    Ok((source.ok_or(ParseError::MissingSource)?, tags))
}

fn strip_delta(token: &str) -> Result<(bool, String), ParseError> {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c == DELTA_PREFIX || c == DELTA_PREFIX_ALT => {
            Ok((true, unquote(chars.as_str())?))
        }
        _ => Ok((false, unquote(token)?)),
    }
}

/// True if the token can only be a metric value (a number, never a tag).
fn is_value_token(token: &str) -> bool {
    !token.contains('=') && token.parse::<f64>().is_ok()
}

/// Splits a raw token at the first `=` outside quotes.
fn split_kv(token: &str) -> Option<(String, String)> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in token.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '=' if !in_quotes => {
                return Some((token[..i].to_string(), token[i + 1..].to_string()));
            }
            _ => {}
        }
    }
    None
}

/// Splits a line on spaces, keeping quoted runs intact.
fn tokenize(line: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if escaped {
        return Err(ParseError::DanglingEscape);
    }
    if in_quotes {
        return Err(ParseError::UnterminatedQuote);
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Removes surrounding quotes and unescapes `\"` and `\\`.
fn unquote(raw: &str) -> Result<String, ParseError> {
    if !raw.starts_with('"') {
        return Ok(raw.to_string());
    }
    if raw.len() < 2 || !raw.ends_with('"') {
        return Err(ParseError::UnterminatedQuote);
    }

    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    if escaped {
        return Err(ParseError::DanglingEscape);
    }

    Ok(out)
}
