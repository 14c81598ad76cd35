//! Ordered classification rules.
//!
//! A [`RuleSet`] is an ordered list; [`RuleSet::classify`] returns the
//! first rule whose pattern matches the line and ignores the rest. Patterns
//! are case-insensitive. Reordering rules changes behaviour.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use fleetmend_core::{RuleAction, RuleConfig, Severity};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, DetectorResult};

/// Matched lines are truncated to this many characters in scan reports.
const SCAN_LINE_LIMIT: usize = 800;

/// Built-in rules used when none are configured.
pub const DEFAULT_RULES: &[(&str, Severity, RuleAction)] = &[
    (r"\b(ERROR|Exception|CRITICAL|FATAL)\b", Severity::Critical, RuleAction::Restart),
    (r"\bWARN(ING)?\b", Severity::Warn, RuleAction::Notify),
    (r"connection reset by peer", Severity::Critical, RuleAction::Restart),
    (r"connection reset", Severity::Critical, RuleAction::Restart),
    (r"\bRST_STREAM\b", Severity::Critical, RuleAction::Restart),
    (r"\bECONNRESET\b", Severity::Critical, RuleAction::Restart),
];

#[derive(Debug, Clone)]
pub struct Rule {
    regex: Regex,
    pub severity: Severity,
    pub action: RuleAction,
}

impl Rule {
    pub fn new(pattern: &str, severity: Severity, action: RuleAction) -> DetectorResult<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| DetectorError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            regex,
            severity,
            action,
        })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// On-disk rule file: either a bare JSON array or a TOML/JSON table with a
/// `rules` array.
#[derive(Deserialize)]
#[serde(untagged)]
enum RulesFile {
    List(Vec<RuleConfig>),
    Table { rules: Vec<RuleConfig> },
}

/// One line that matched during a [`RuleSet::scan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub log: String,
    pub pattern: String,
    pub severity: Severity,
    pub action: RuleAction,
    pub line: String,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// The built-in rules, compiled. An error here is a bad entry in
    /// [`DEFAULT_RULES`], never silently an empty rule set.
    pub fn defaults() -> DetectorResult<Self> {
        let rules = DEFAULT_RULES
            .iter()
            .map(|(pattern, severity, action)| Rule::new(pattern, *severity, *action))
            .collect::<DetectorResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Compile configured rules, in order. An empty list means the defaults.
    pub fn from_config(rules: &[RuleConfig]) -> DetectorResult<Self> {
        if rules.is_empty() {
            return Self::defaults();
        }
        let rules = rules
            .iter()
            .map(|r| Rule::new(&r.pattern, r.severity, r.action))
            .collect::<DetectorResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Load rules from a `.toml` or `.json` file.
    pub fn load_file(path: &Path) -> DetectorResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let err = |reason: String| DetectorError::RulesFile {
            path: path.display().to_string(),
            reason,
        };
        let parsed: RulesFile = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text).map_err(|e| err(e.to_string()))?,
            _ => serde_json::from_str(&text).map_err(|e| err(e.to_string()))?,
        };
        let rules = match parsed {
            RulesFile::List(rules) | RulesFile::Table { rules } => rules,
        };
        if rules.is_empty() {
            return Err(err("no rules defined".to_string()));
        }
        Self::from_config(&rules)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching rule, if any.
    pub fn classify(&self, line: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.is_match(line))
    }

    /// Run the rules over existing log files, stopping after `limit`
    /// matches. Missing files are skipped.
    pub fn scan(&self, logs: &[PathBuf], limit: Option<usize>) -> DetectorResult<Vec<RuleMatch>> {
        let mut found = Vec::new();
        for log in logs {
            let file = match std::fs::File::open(log) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for raw in BufReader::new(file).split(b'\n') {
                let raw = raw?;
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end();
                if let Some(rule) = self.classify(line) {
                    found.push(RuleMatch {
                        log: log.display().to_string(),
                        pattern: rule.pattern().to_string(),
                        severity: rule.severity,
                        action: rule.action,
                        line: line.chars().take(SCAN_LINE_LIMIT).collect(),
                    });
                    if limit.is_some_and(|l| found.len() >= l) {
                        return Ok(found);
                    }
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_classify_known_signatures() {
        let rules = RuleSet::defaults().unwrap();
        assert_eq!(rules.len(), DEFAULT_RULES.len());

        let fatal = rules.classify("2024-01-01 FATAL out of memory").unwrap();
        assert_eq!(fatal.action, RuleAction::Restart);
        assert_eq!(fatal.severity, Severity::Critical);

        let warn = rules.classify("[warning] slow request").unwrap();
        assert_eq!(warn.action, RuleAction::Notify);

        assert_eq!(
            rules.classify("read: Connection reset by peer").unwrap().pattern(),
            "connection reset by peer"
        );
        assert!(rules.classify("GET /health 200").is_none());
    }

    #[test]
    fn every_default_pattern_compiles() {
        for (pattern, severity, action) in DEFAULT_RULES {
            Rule::new(pattern, *severity, *action)
                .unwrap_or_else(|e| panic!("default rule {pattern:?} does not compile: {e}"));
        }
        assert!(!RuleSet::defaults().unwrap().is_empty());
    }

    #[test]
    fn first_match_wins() {
        let rules = RuleSet::from_config(&[
            RuleConfig {
                pattern: "timeout".to_string(),
                severity: Severity::Info,
                action: RuleAction::Noop,
            },
            RuleConfig {
                pattern: "error".to_string(),
                severity: Severity::Critical,
                action: RuleAction::Restart,
            },
        ])
        .unwrap();
        let rule = rules.classify("ERROR: upstream timeout").unwrap();
        assert_eq!(rule.action, RuleAction::Noop);
        assert_eq!(rules.classify("error only").unwrap().action, RuleAction::Restart);
    }

    #[test]
    fn empty_config_means_defaults() {
        assert_eq!(RuleSet::from_config(&[]).unwrap().len(), DEFAULT_RULES.len());
    }

    #[test]
    fn bad_pattern_is_reported() {
        let err = RuleSet::from_config(&[RuleConfig {
            pattern: "(unclosed".to_string(),
            severity: Severity::Info,
            action: RuleAction::Notify,
        }])
        .unwrap_err();
        assert!(matches!(err, DetectorError::Pattern { ref pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn loads_json_and_toml_files() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("rules.json");
        std::fs::write(&json, r#"[{"pattern": "OOM", "severity": "critical", "action": "restart"}, {"pattern": "slow"}]"#).unwrap();
        let rules = RuleSet::load_file(&json).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.rules()[1].action, RuleAction::Notify);
        assert_eq!(rules.rules()[1].severity, Severity::Info);

        let toml_path = dir.path().join("rules.toml");
        std::fs::write(
            &toml_path,
            "[[rules]]\npattern = 'panic'\nseverity = 'critical'\naction = 'restart'\n",
        )
        .unwrap();
        let rules = RuleSet::load_file(&toml_path).unwrap();
        assert_eq!(rules.classify("thread main PANIC").unwrap().action, RuleAction::Restart);
    }

    #[test]
    fn scan_respects_limit_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "ok\nERROR one\nfine\nFATAL two\nWARN three\n").unwrap();
        let rules = RuleSet::defaults().unwrap();

        let all = rules
            .scan(&[dir.path().join("missing.log"), log.clone()], None)
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].line, "ERROR one");
        assert_eq!(all[2].action, RuleAction::Notify);

        assert_eq!(rules.scan(&[log], Some(2)).unwrap().len(), 2);
    }
}
