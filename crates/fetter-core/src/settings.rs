//! Application configuration, loaded from a YAML file.
//!
//! Rule, group and trigger tables are sorted maps: every component iterating
//! them (rule installation, scanner lookup table, group creation) sees the
//! same deterministic order, by name.

use std::{collections::BTreeMap, fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rule::{KILL, Rule};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/fetter/config.yaml";
const DEFAULT_NAME: &str = "fetter";
const DEFAULT_LOG_FILE: &str = "/tmp/fetter.log";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_MAX_RUNNING_TRIGGERS: usize = 16;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file {0} not found")]
    NotFound(String),
    #[error("error reading configuration from {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing configuration from {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("run mode not supported: {0}")]
    UnsupportedRunMode(String),
    #[error("audit mode not supported: {0}")]
    UnsupportedAuditMode(String),
    #[error("missing group '{group}' defined for rule '{rule}'")]
    MissingGroup { group: String, rule: String },
    #[error("missing trigger '{trigger}' defined for rule '{rule}'")]
    MissingTrigger { trigger: String, rule: String },
}

/// Selects how processes are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RunMode {
    /// Kernel audit events (preferred).
    #[default]
    Audit,
    /// Periodic polling of `/proc`.
    Scanner,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audit" => Ok(RunMode::Audit),
            "scanner" => Ok(RunMode::Scanner),
            other => Err(ConfigError::UnsupportedRunMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for RunMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunMode> for String {
    fn from(mode: RunMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Audit => f.write_str("audit"),
            RunMode::Scanner => f.write_str("scanner"),
        }
    }
}

/// How pre-existing kernel audit rules are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuditMode {
    /// Leave the kernel rules untouched, assume they are correct.
    Reuse,
    /// Delete every existing rule, then install ours.
    #[default]
    Override,
    /// Install ours next to the existing ones.
    Preserve,
}

impl FromStr for AuditMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reuse" => Ok(AuditMode::Reuse),
            "override" => Ok(AuditMode::Override),
            "preserve" => Ok(AuditMode::Preserve),
            other => Err(ConfigError::UnsupportedAuditMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for AuditMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AuditMode> for String {
    fn from(mode: AuditMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for AuditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditMode::Reuse => f.write_str("reuse"),
            AuditMode::Override => f.write_str("override"),
            AuditMode::Preserve => f.write_str("preserve"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default)]
    pub mode: AuditMode,
}

/// Resource budget of a control group. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Memory ceiling, in megabytes.
    #[serde(default)]
    pub ram: i64,
    /// Share of the aggregate host CPU capacity, as a percentage.
    #[serde(default)]
    pub cpu: u64,
    /// Maximum number of processes.
    #[serde(default)]
    pub pids: i64,
    #[serde(default)]
    pub freeze: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Command to execute.
    pub run: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// User to run the command as, `nobody` when missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Name of the root control group.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub audit: Audit,
    pub rules: BTreeMap<String, Rule>,
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
    #[serde(default)]
    pub triggers: BTreeMap<String, Trigger>,
    /// Ceiling on trigger commands running at the same time.
    #[serde(default = "default_max_running_triggers")]
    pub max_running_triggers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: default_name(),
            mode: RunMode::default(),
            logging: Logging::default(),
            audit: Audit::default(),
            rules: BTreeMap::new(),
            groups: BTreeMap::new(),
            triggers: BTreeMap::new(),
            max_running_triggers: default_max_running_triggers(),
        }
    }
}

impl Settings {
    /// Load and validate the configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::NotFound(display));
        }
        let body = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let settings = Self::from_yaml(&body).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        settings.check_references()?;
        log::debug!(
            "Loaded {} rules, {} groups and {} triggers",
            settings.rules.len(),
            settings.groups.len(),
            settings.triggers.len()
        );
        Ok(settings)
    }

    /// Parse a YAML document, without cross checking rules.
    pub fn from_yaml(body: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(body)
    }

    /// Every group and trigger referenced by a rule must be configured.
    pub fn check_references(&self) -> Result<(), ConfigError> {
        for (name, rule) in &self.rules {
            if let Some(trigger) = rule.trigger() {
                if !self.triggers.contains_key(trigger) {
                    return Err(ConfigError::MissingTrigger {
                        trigger: trigger.to_string(),
                        rule: name.clone(),
                    });
                }
            }
            if let Some(group) = rule.group() {
                if group != KILL && !self.groups.contains_key(group) {
                    return Err(ConfigError::MissingGroup {
                        group: group.to_string(),
                        rule: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Group configured for a rule.
    pub fn group_of(&self, rule: &str) -> Option<&str> {
        self.rules.get(rule).and_then(Rule::group)
    }

    /// Trigger configured for a rule.
    pub fn trigger_of(&self, rule: &str) -> Option<&str> {
        self.rules.get(rule).and_then(Rule::trigger)
    }
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_log_file() -> String {
    DEFAULT_LOG_FILE.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_max_running_triggers() -> usize {
    DEFAULT_MAX_RUNNING_TRIGGERS
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
name: testing-fetter
mode: scanner
logging:
  file: foo.log
  level: debug
audit:
  mode: reuse
rules:
  make:
    paths: [/usr/bin/make]
    action: execute
    group: compilation
  make2:
    paths: [/usr/bin/make2]
    action: read
    group: compilation
    trigger: notify
groups:
  compilation:
    ram: 100
    cpu: 10
    pids: 1
  g2:
    ram: 200
    cpu: 20
    freeze: true
triggers:
  notify:
    run: /usr/bin/logger
    args: [matched]
"#;

    #[test]
    fn full_document() {
        let s = Settings::from_yaml(FULL).unwrap();
        s.check_references().unwrap();
        assert_eq!(s.name, "testing-fetter");
        assert_eq!(s.mode, RunMode::Scanner);
        assert_eq!(
            s.logging,
            Logging {
                file: "foo.log".to_string(),
                level: "debug".to_string()
            }
        );
        assert_eq!(s.audit.mode, AuditMode::Reuse);
        assert_eq!(
            s.groups["g2"],
            Group {
                ram: 200,
                cpu: 20,
                pids: 0,
                freeze: true
            }
        );
        assert_eq!(s.triggers["notify"].user, None);
        assert_eq!(s.group_of("make2"), Some("compilation"));
        assert_eq!(s.trigger_of("make2"), Some("notify"));
        assert_eq!(s.trigger_of("make"), None);
        assert_eq!(s.group_of("missing"), None);
    }

    #[test]
    fn defaults() {
        let s = Settings::from_yaml("rules: {}").unwrap();
        assert_eq!(s.name, "fetter");
        assert_eq!(s.mode, RunMode::Audit);
        assert_eq!(s.audit.mode, AuditMode::Override);
        assert_eq!(s.logging, Logging::default());
        assert_eq!(s.max_running_triggers, 16);
        assert!(s.groups.is_empty());
    }

    #[test]
    fn rules_are_required() {
        assert!(Settings::from_yaml("name: foo").is_err());
    }

    #[test]
    fn unsupported_mode() {
        let err = Settings::from_yaml("mode: garbage\nrules: {}").unwrap_err();
        assert!(
            err.to_string().contains("run mode not supported: garbage"),
            "{err}"
        );
        let err = Settings::from_yaml("audit: {mode: foobar}\nrules: {}").unwrap_err();
        assert!(err.to_string().contains("audit mode not supported: foobar"));
    }

    #[test]
    fn dangling_references() {
        let s = Settings::from_yaml("rules: {r: {paths: [/a], action: read, group: nope}}")
            .unwrap();
        assert!(matches!(
            s.check_references(),
            Err(ConfigError::MissingGroup { .. })
        ));
        let s = Settings::from_yaml("rules: {r: {paths: [/a], action: read, trigger: nope}}")
            .unwrap();
        assert!(matches!(
            s.check_references(),
            Err(ConfigError::MissingTrigger { .. })
        ));
        let s = Settings::from_yaml("rules: {r: {paths: [/a], action: read, group: KILL}}")
            .unwrap();
        assert!(s.check_references().is_ok());
    }

    #[test]
    fn invalid_rule_shape_is_not_a_load_error() {
        let s = Settings::from_yaml("rules: {r: {paths: [/a], action: smell, group: KILL}}")
            .unwrap();
        assert!(s.check_references().is_ok());
        assert!(s.rules["r"].validate().is_err());
    }

    #[test]
    fn missing_file() {
        let err = Settings::load("/not/a/file.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn load_from_disk() {
        let path = std::env::temp_dir().join(format!("fetter-settings-{}.yaml", std::process::id()));
        std::fs::write(&path, FULL).unwrap();
        let s = Settings::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(s.rules.len(), 2);
    }
}
