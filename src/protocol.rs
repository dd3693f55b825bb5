//! Line protocol decoding.
//!
//! One record per `\n`-terminated line:
//! `table[,tag=value...] field=value[,field=value...] [timestamp]`.
//! Commas, spaces and equals signs in names are escaped with a backslash; string field values
//! are double quoted and may contain spaces and commas.

use crate::ring_types::{FieldValue, Measurement};

/// Why a single line was rejected. Confined to the connection that sent it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("missing table name")]
    MissingTable,
    #[error("missing field set")]
    MissingFields,
    #[error("malformed tag {0:?}")]
    InvalidTag(String),
    #[error("malformed field {0:?}")]
    InvalidField(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("unexpected data after timestamp")]
    TrailingData,
    #[error("unterminated string value")]
    UnterminatedString,
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Result of attempting to parse one record from a byte buffer.
#[derive(Debug)]
pub enum ParseResult {
    /// A record and the bytes it occupied, newline included.
    Complete {
        measurement: Measurement,
        bytes_consumed: usize,
    },
    /// Blank line or `#` comment of the given length.
    Skip(usize),
    /// No newline yet.
    Incomplete,
    Error(ParseError),
}

/// Try to parse the first line of `buf`.
pub fn try_parse_line(buf: &[u8]) -> ParseResult {
    let Some(end) = buf.iter().position(|&b| b == b'\n') else {
        return ParseResult::Incomplete;
    };
    let bytes_consumed = end + 1;
    let line = buf[..end].trim_ascii();
    if line.is_empty() || line[0] == b'#' {
        return ParseResult::Skip(bytes_consumed);
    }
    match parse_line(line) {
        Ok(measurement) => ParseResult::Complete {
            measurement,
            bytes_consumed,
        },
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse one line without its terminator.
pub fn parse_line(line: &[u8]) -> Result<Measurement, ParseError> {
    let (head, rest) = split_first_unescaped(line, b' ').ok_or(ParseError::MissingFields)?;

    let sections = split_unescaped(rest, b' ', true)?;
    let (field_section, timestamp) = match sections.as_slice() {
        [fields] => (*fields, None),
        [fields, ts] => (*fields, Some(parse_timestamp(ts)?)),
        _ => return Err(ParseError::TrailingData),
    };

    let mut head_parts = split_unescaped(head, b',', false)?.into_iter();
    let table = unescape(head_parts.next().unwrap_or_default())?;
    if table.is_empty() {
        return Err(ParseError::MissingTable);
    }

    let mut tags = Vec::new();
    for part in head_parts {
        match split_first_unescaped(part, b'=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                tags.push((unescape(key)?, unescape(value)?));
            }
            _ => return Err(ParseError::InvalidTag(lossy(part))),
        }
    }

    if field_section.is_empty() {
        return Err(ParseError::MissingFields);
    }
    let mut fields = Vec::new();
    for part in split_unescaped(field_section, b',', true)? {
        match split_first_unescaped(part, b'=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                let key = unescape(key)?;
                let value = parse_field_value(value)
                    .ok_or_else(|| ParseError::InvalidField(key.clone()))??;
                fields.push((key, value));
            }
            _ => return Err(ParseError::InvalidField(lossy(part))),
        }
    }

    Ok(Measurement {
        table,
        tags,
        fields,
        timestamp,
    })
}

/// `None` when the text is not a recognisable value; `Some(Err)` for structural errors.
fn parse_field_value(raw: &[u8]) -> Option<Result<FieldValue, ParseError>> {
    if raw[0] == b'"' {
        if raw.len() < 2 || raw[raw.len() - 1] != b'"' {
            return Some(Err(ParseError::UnterminatedString));
        }
        return Some(unescape(&raw[1..raw.len() - 1]).map(FieldValue::String));
    }
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => return Some(Err(ParseError::InvalidUtf8)),
    };
    match text {
        "t" | "T" | "true" | "True" | "TRUE" => return Some(Ok(FieldValue::Boolean(true))),
        "f" | "F" | "false" | "False" | "FALSE" => return Some(Ok(FieldValue::Boolean(false))),
        _ => {}
    }
    if let Some(digits) = text.strip_suffix('i') {
        return digits.parse().ok().map(|v| Ok(FieldValue::Integer(v)));
    }
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| Ok(FieldValue::Float(v)))
}

fn parse_timestamp(raw: &[u8]) -> Result<i64, ParseError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| ParseError::InvalidTimestamp(lossy(raw)))
}

/// Split on every `delim` not preceded by a backslash (and, when `quotes`, not inside `"..."`).
fn split_unescaped(input: &[u8], delim: u8, quotes: bool) -> Result<Vec<&[u8]>, ParseError> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut in_quotes = false;
    for (i, &b) in input.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        if b == b'\\' {
            escaped = true;
        } else if quotes && b == b'"' {
            in_quotes = !in_quotes;
        } else if b == delim && !in_quotes {
            parts.push(&input[start..i]);
            start = i + 1;
        }
    }
    if in_quotes {
        return Err(ParseError::UnterminatedString);
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn split_first_unescaped(input: &[u8], delim: u8) -> Option<(&[u8], &[u8])> {
    let mut escaped = false;
    for (i, &b) in input.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == delim {
            return Some((&input[..i], &input[i + 1..]));
        }
    }
    None
}

/// Drop the backslash in front of any escaped byte.
fn unescape(raw: &[u8]) -> Result<String, ParseError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter().copied().peekable();
    while let Some(b) = bytes.next() {
        match (b, bytes.peek()) {
            (b'\\', Some(&next)) => {
                out.push(next);
                bytes.next();
            }
            _ => out.push(b),
        }
    }
    String::from_utf8(out).map_err(|_| ParseError::InvalidUtf8)
}

fn lossy(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}
