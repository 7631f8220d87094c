//! Parsing of kernel audit records.
//!
//! A record body looks like
//! `audit(1700000000.123:456): arch=c000003e syscall=59 pid=42 exe="/bin/ls" key="fetter_ls"`.
//! Quoted values are literal. Unquoted values of fields that may carry
//! arbitrary bytes are hex encoded by the kernel. The `key` field is not
//! kept as data: it becomes the list of tags of the record.

use std::collections::BTreeMap;

use thiserror::Error;

/// Kernel record type for syscall events.
pub const AUDIT_SYSCALL: u16 = 1300;

/// Separates several keys in one `key` field.
const KEY_SEPARATOR: char = '\x01';

const NULL_VALUE: &str = "(null)";

/// Fields the kernel hex encodes when they hold unsafe characters.
const HEX_FIELDS: &[&str] = &["cmd", "comm", "cwd", "exe", "name", "path", "proctitle"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not valid utf-8")]
    Encoding,
    #[error("missing audit(...) header")]
    MissingHeader,
    #[error("unterminated quote in field {0}")]
    UnterminatedQuote(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditRecord {
    /// Event timestamp, as `seconds.millis`.
    pub timestamp: String,
    pub sequence: u64,
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl AuditRecord {
    pub fn parse(data: &[u8]) -> Result<Self, RecordError> {
        let text = std::str::from_utf8(data).map_err(|_| RecordError::Encoding)?;
        let (header, body) = text
            .trim()
            .strip_prefix("audit(")
            .and_then(|rest| rest.split_once("):"))
            .ok_or(RecordError::MissingHeader)?;
        let (timestamp, sequence) = header.split_once(':').ok_or(RecordError::MissingHeader)?;
        let sequence = sequence.parse().map_err(|_| RecordError::MissingHeader)?;

        let mut record = AuditRecord {
            timestamp: timestamp.to_string(),
            sequence,
            ..Default::default()
        };
        for (name, value) in fields(body)? {
            if name == "key" {
                record.tags = tags(value);
            } else {
                let value = value.decode(HEX_FIELDS.contains(&name));
                record.fields.insert(name.to_string(), value);
            }
        }
        Ok(record)
    }

    /// Process id of the task that caused the record.
    pub fn pid(&self) -> Option<&str> {
        self.fields.get("pid").map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value<'a> {
    Quoted(&'a str),
    Bare(&'a str),
}

impl Value<'_> {
    fn decode(self, may_be_hex: bool) -> String {
        match self {
            Value::Quoted(s) => s.to_string(),
            Value::Bare(s) if may_be_hex && s != NULL_VALUE => {
                decode_hex(s).unwrap_or_else(|| s.to_string())
            }
            Value::Bare(s) => s.to_string(),
        }
    }
}

fn decode_hex(s: &str) -> Option<String> {
    let bytes = hex::decode(s).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn fields(body: &str) -> Result<Vec<(&str, Value<'_>)>, RecordError> {
    let mut out = Vec::new();
    let mut rest = body.trim_start();
    while let Some((name, after)) = rest.split_once('=') {
        let name = name.trim();
        let (value, remaining) = match after.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let end = after[1..]
                    .find(quote)
                    .ok_or_else(|| RecordError::UnterminatedQuote(name.to_string()))?;
                (Value::Quoted(&after[1..=end]), &after[end + 2..])
            }
            _ => {
                let end = after.find(char::is_whitespace).unwrap_or(after.len());
                (Value::Bare(&after[..end]), &after[end..])
            }
        };
        out.push((name, value));
        rest = remaining.trim_start();
    }
    Ok(out)
}

fn tags(value: Value<'_>) -> Vec<String> {
    match value {
        Value::Quoted(key) => vec![key.to_string()],
        Value::Bare(NULL_VALUE) => Vec::new(),
        Value::Bare(raw) => match decode_hex(raw) {
            Some(keys) => keys
                .split(KEY_SEPARATOR)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect(),
            None => vec![raw.to_string()],
        },
    }
}
