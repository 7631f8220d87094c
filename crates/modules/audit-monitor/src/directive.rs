//! File watch directives in `auditctl` syntax and their kernel encoding.
//!
//! Every fetter rule path turns into a directive like
//! `-w /usr/bin/make -p x -k fetter_make`, which is then parsed back and
//! compiled into the binary `audit_rule_data` the kernel expects.

use std::{fmt, str::FromStr};

use bytes::{BufMut, BytesMut};
use fetter_core::Access;
use thiserror::Error;

/// Prefix of every audit key owned by fetter.
pub const TAG_PREFIX: &str = "fetter_";

/// Longest key the kernel accepts.
pub const MAX_KEY_LEN: usize = 256;
/// Longest watched path the kernel accepts.
pub const MAX_PATH_LEN: usize = 4096;

const AUDIT_FILTER_EXIT: u32 = 0x04;
const AUDIT_ALWAYS: u32 = 2;
const AUDIT_EQUAL: u32 = 0x4000_0000;
const AUDIT_WATCH: u32 = 105;
const AUDIT_PERM: u32 = 106;
const AUDIT_FILTERKEY: u32 = 210;
const AUDIT_BITMASK_SIZE: usize = 64;
const AUDIT_MAX_FIELDS: usize = 64;

const AUDIT_PERM_EXEC: u32 = 1;
const AUDIT_PERM_WRITE: u32 = 2;
const AUDIT_PERM_READ: u32 = 4;
const AUDIT_PERM_ATTR: u32 = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("missing watched path")]
    MissingPath,
    #[error("missing value for option {0}")]
    MissingValue(String),
    #[error("unsupported option {0}")]
    UnknownOption(String),
    #[error("invalid permission {0:?}")]
    InvalidPermission(char),
    #[error("watched path must be absolute: {0}")]
    RelativePath(String),
    #[error("watched path too long ({0} bytes)")]
    PathTooLong(usize),
    #[error("key too long ({0} bytes, max {MAX_KEY_LEN})")]
    KeyTooLong(usize),
}

/// Build the audit key tagging the events of rule `name`.
pub fn tag(name: &str) -> String {
    format!("{TAG_PREFIX}{name}")
}

/// The rule name carried by `key`, if it is one of ours.
pub fn rule_of(key: &str) -> Option<&str> {
    key.strip_prefix(TAG_PREFIX)
}

/// A `-w <path> -p <perms> -k <key>` watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDirective {
    pub path: String,
    pub perms: u32,
    pub key: Option<String>,
}

impl WatchDirective {
    pub fn new(path: &str, access: Access, rule: &str) -> Self {
        Self {
            path: path.to_string(),
            perms: perm_bit(access.perm_char()).unwrap_or(AUDIT_PERM_READ),
            key: Some(tag(rule)),
        }
    }

    /// Encode as kernel `audit_rule_data`.
    pub fn compile(&self) -> Result<BytesMut, DirectiveError> {
        if !self.path.starts_with('/') {
            return Err(DirectiveError::RelativePath(self.path.clone()));
        }
        if self.path.len() > MAX_PATH_LEN {
            return Err(DirectiveError::PathTooLong(self.path.len()));
        }
        let key = self.key.as_deref().unwrap_or_default();
        if key.len() > MAX_KEY_LEN {
            return Err(DirectiveError::KeyTooLong(key.len()));
        }

        let mut fields = vec![(AUDIT_WATCH, self.path.len() as u32)];
        if self.perms != 0 {
            fields.push((AUDIT_PERM, self.perms));
        }
        if !key.is_empty() {
            fields.push((AUDIT_FILTERKEY, key.len() as u32));
        }
        let strings = [self.path.as_bytes(), key.as_bytes()].concat();

        let mut buf = BytesMut::with_capacity(16 + 4 * AUDIT_MAX_FIELDS * 4 + strings.len());
        buf.put_u32_ne(AUDIT_FILTER_EXIT);
        buf.put_u32_ne(AUDIT_ALWAYS);
        buf.put_u32_ne(fields.len() as u32);
        // Watches apply to every syscall.
        for _ in 0..AUDIT_BITMASK_SIZE {
            buf.put_u32_ne(u32::MAX);
        }
        for i in 0..AUDIT_MAX_FIELDS {
            buf.put_u32_ne(fields.get(i).map_or(0, |(field, _)| *field));
        }
        for i in 0..AUDIT_MAX_FIELDS {
            buf.put_u32_ne(fields.get(i).map_or(0, |(_, value)| *value));
        }
        for i in 0..AUDIT_MAX_FIELDS {
            buf.put_u32_ne(if i < fields.len() { AUDIT_EQUAL } else { 0 });
        }
        buf.put_u32_ne(strings.len() as u32);
        buf.put_slice(&strings);
        Ok(buf)
    }
}

impl fmt::Display for WatchDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-w {}", self.path)?;
        if self.perms != 0 {
            let perms: String = ['r', 'w', 'x', 'a']
                .into_iter()
                .filter(|c| perm_bit(*c).is_some_and(|bit| self.perms & bit != 0))
                .collect();
            write!(f, " -p {perms}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " -k {key}")?;
        }
        Ok(())
    }
}

impl FromStr for WatchDirective {
    type Err = DirectiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut path = None;
        let mut perms = 0;
        let mut key = None;
        let mut words = s.split_whitespace();
        while let Some(option) = words.next() {
            let mut value = || {
                words
                    .next()
                    .ok_or_else(|| DirectiveError::MissingValue(option.to_string()))
            };
            match option {
                "-w" => path = Some(value()?.to_string()),
                "-p" => {
                    perms = value()?.chars().try_fold(0, |acc, c| {
                        perm_bit(c)
                            .map(|bit| acc | bit)
                            .ok_or(DirectiveError::InvalidPermission(c))
                    })?
                }
                "-k" => key = Some(value()?.to_string()),
                other => return Err(DirectiveError::UnknownOption(other.to_string())),
            }
        }
        Ok(Self {
            path: path.ok_or(DirectiveError::MissingPath)?,
            perms,
            key,
        })
    }
}

fn perm_bit(c: char) -> Option<u32> {
    match c {
        'r' => Some(AUDIT_PERM_READ),
        'w' => Some(AUDIT_PERM_WRITE),
        'x' => Some(AUDIT_PERM_EXEC),
        'a' => Some(AUDIT_PERM_ATTR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;

    #[test]
    fn format_execute_watch() {
        let directive = WatchDirective::new("/foo", Access::Execute, "danger");
        assert_eq!(directive.to_string(), "-w /foo -p x -k fetter_danger");
    }

    #[test]
    fn format_uses_access_letter() {
        let read = WatchDirective::new("/etc/shadow", Access::Read, "secrets");
        assert_eq!(read.to_string(), "-w /etc/shadow -p r -k fetter_secrets");
        let write = WatchDirective::new("/etc/hosts", Access::Write, "hosts");
        assert_eq!(write.to_string(), "-w /etc/hosts -p w -k fetter_hosts");
    }

    #[test]
    fn parse_back() {
        let directive = WatchDirective::new("/usr/bin/make", Access::Execute, "make");
        let parsed: WatchDirective = directive.to_string().parse().unwrap();
        assert_eq!(parsed, directive);

        let parsed: WatchDirective = "-k k1 -p rwa -w /tmp".parse().unwrap();
        assert_eq!(parsed.path, "/tmp");
        assert_eq!(
            parsed.perms,
            AUDIT_PERM_READ | AUDIT_PERM_WRITE | AUDIT_PERM_ATTR
        );
        assert_eq!(parsed.key.as_deref(), Some("k1"));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            "-p x".parse::<WatchDirective>(),
            Err(DirectiveError::MissingPath)
        );
        assert_eq!(
            "-w /a -p".parse::<WatchDirective>(),
            Err(DirectiveError::MissingValue("-p".to_string()))
        );
        assert_eq!(
            "-w /a -p z".parse::<WatchDirective>(),
            Err(DirectiveError::InvalidPermission('z'))
        );
        assert_eq!(
            "-a always,exit -w /a".parse::<WatchDirective>(),
            Err(DirectiveError::UnknownOption("-a".to_string()))
        );
        // Paths are whitespace separated: embedded blanks cannot round trip.
        assert!("-w /my dir -p x".parse::<WatchDirective>().is_err());
    }

    #[test]
    fn tags() {
        assert_eq!(tag("foo"), "fetter_foo");
        assert_eq!(rule_of("fetter_foo"), Some("foo"));
        assert_eq!(rule_of("other_foo"), None);
    }

    #[test]
    fn compile_layout() {
        let directive = WatchDirective::new("/bin/ls", Access::Execute, "ls");
        let mut buf = directive.compile().unwrap().freeze();
        assert_eq!(buf.get_u32_ne(), AUDIT_FILTER_EXIT);
        assert_eq!(buf.get_u32_ne(), AUDIT_ALWAYS);
        assert_eq!(buf.get_u32_ne(), 3);
        for _ in 0..AUDIT_BITMASK_SIZE {
            assert_eq!(buf.get_u32_ne(), u32::MAX);
        }
        let fields: Vec<u32> = (0..AUDIT_MAX_FIELDS).map(|_| buf.get_u32_ne()).collect();
        assert_eq!(&fields[..4], &[AUDIT_WATCH, AUDIT_PERM, AUDIT_FILTERKEY, 0]);
        let values: Vec<u32> = (0..AUDIT_MAX_FIELDS).map(|_| buf.get_u32_ne()).collect();
        assert_eq!(&values[..3], &[7, AUDIT_PERM_EXEC, 9]);
        let flags: Vec<u32> = (0..AUDIT_MAX_FIELDS).map(|_| buf.get_u32_ne()).collect();
        assert_eq!(&flags[..4], &[AUDIT_EQUAL, AUDIT_EQUAL, AUDIT_EQUAL, 0]);
        assert_eq!(buf.get_u32_ne(), 16);
        assert_eq!(&buf[..], b"/bin/lsfetter_ls");
    }

    #[test]
    fn compile_rejects_oversized_key() {
        let name = "x".repeat(MAX_KEY_LEN);
        let directive = WatchDirective::new("/bin/ls", Access::Execute, &name);
        assert_eq!(
            directive.compile(),
            Err(DirectiveError::KeyTooLong(MAX_KEY_LEN + TAG_PREFIX.len()))
        );
    }

    #[test]
    fn compile_rejects_relative_path() {
        let directive = WatchDirective::new("bin/ls", Access::Execute, "ls");
        assert!(matches!(
            directive.compile(),
            Err(DirectiveError::RelativePath(_))
        ));
    }
}
