use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pseudo group name: processes "moved" here are killed instead.
pub const KILL: &str = "KILL";

/// Kind of filesystem access a rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// Permission character used by audit watch directives.
    pub fn perm_char(self) -> char {
        match self {
            Access::Read => 'r',
            Access::Write => 'w',
            Access::Execute => 'x',
        }
    }
}

impl FromStr for Access {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Access::Read),
            "write" => Ok(Access::Write),
            "execute" => Ok(Access::Execute),
            "" => Err(RuleError::EmptyAccess),
            other => Err(RuleError::UnknownAccess(other.to_string())),
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Execute => "execute",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("path cannot be empty")]
    EmptyPaths,
    #[error("both group and trigger cannot be empty")]
    NoAction,
    #[error("action cannot be empty")]
    EmptyAccess,
    #[error("unknown action {0} for rule")]
    UnknownAccess(String),
}

/// A configured rule, as read from the configuration file.
///
/// The access kind is kept as raw text so that a single malformed rule is
/// rejected by [`Rule::validate`] instead of failing the whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(rename = "action", default)]
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl Rule {
    /// Check the rule shape, returning its parsed access kind.
    pub fn validate(&self) -> Result<Access, RuleError> {
        if self.paths.is_empty() {
            return Err(RuleError::EmptyPaths);
        }
        if self.group().is_none() && self.trigger().is_none() {
            return Err(RuleError::NoAction);
        }
        self.access.parse()
    }

    /// Target group, ignoring empty strings.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref().filter(|g| !g.is_empty())
    }

    /// Trigger name, ignoring empty strings.
    pub fn trigger(&self) -> Option<&str> {
        self.trigger.as_deref().filter(|t| !t.is_empty())
    }

    /// Parsed access kind, `None` when it is not one of the known values.
    pub fn access(&self) -> Option<Access> {
        self.access.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(paths: &[&str], access: &str, group: Option<&str>, trigger: Option<&str>) -> Rule {
        Rule {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            access: access.to_string(),
            group: group.map(String::from),
            trigger: trigger.map(String::from),
        }
    }

    #[test]
    fn perm_chars() {
        assert_eq!(Access::Execute.perm_char(), 'x');
        assert_eq!(Access::Read.perm_char(), 'r');
        assert_eq!(Access::Write.perm_char(), 'w');
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        assert_eq!(
            rule(&[], "execute", Some("g"), None).validate(),
            Err(RuleError::EmptyPaths)
        );
        assert_eq!(
            rule(&["/foo"], "execute", None, None).validate(),
            Err(RuleError::NoAction)
        );
        assert_eq!(
            rule(&["/foo"], "execute", Some(""), Some("")).validate(),
            Err(RuleError::NoAction)
        );
        assert_eq!(
            rule(&["/foo"], "", Some("g"), None).validate(),
            Err(RuleError::EmptyAccess)
        );
        assert_eq!(
            rule(&["/foo"], "foo", Some("g"), None).validate(),
            Err(RuleError::UnknownAccess("foo".to_string()))
        );
    }

    #[test]
    fn validation_accepts_good_shapes() {
        assert_eq!(
            rule(&["/foo"], "execute", Some("g"), None).validate(),
            Ok(Access::Execute)
        );
        assert_eq!(
            rule(&["/foo"], "read", None, Some("t")).validate(),
            Ok(Access::Read)
        );
        assert_eq!(
            rule(&["/foo", "/bar"], "write", Some(KILL), Some("t")).validate(),
            Ok(Access::Write)
        );
    }
}
