//! Readiness conditions attached to services
//!
//! A service may declare up to three kinds of rules under `state_conditions`:
//!
//! ```yaml
//! state_conditions:
//!   exit: [0]
//!   timeout:
//!     duration: 30
//!     status: failure
//!   filemonitor:
//!     - file: STDOUT
//!       regex: "listening on port \\d+"
//!       status: success
//!     - file: /var/log/app/boot.log
//!       regex: "FATAL"
//!       status: failure
//! ```
//!
//! Everything is validated while the compose files are loaded, so a bad
//! pattern stops the run before any container is started.

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Exit code meaning "the container must not terminate at all"
pub const NEVER_EXIT: i64 = -1;

/// Status string that lets the startup sequence continue
pub const SUCCESS: &str = "success";

/// Status used for failures produced by the sequencer itself
pub const FAILURE: &str = "failure";

/// Result label of a readiness decision
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The service is ready; continue with the next one
    Success,
    /// Any other named terminal status (e.g. "failure")
    Status(String),
}

impl Outcome {
    /// Parse a configured status string
    pub fn parse(status: &str) -> Self {
        if status == SUCCESS {
            Outcome::Success
        } else {
            Outcome::Status(status.to_string())
        }
    }

    /// The default failure outcome
    pub fn failure() -> Self {
        Outcome::Status(FAILURE.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Outcome::Success => SUCCESS,
            Outcome::Status(status) => status,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single terminal result of a readiness gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub message: String,
}

impl Verdict {
    pub fn new(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Outcome::Success, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(Outcome::failure(), message)
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.outcome, self.message)
    }
}

/// Set of exit codes that count as a successful termination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitCodeRule {
    codes: Vec<i64>,
}

impl ExitCodeRule {
    pub fn new(codes: Vec<i64>) -> Result<Self, ConditionError> {
        if codes.is_empty() {
            return Err(ConditionError::EmptyExitCodes);
        }
        Ok(Self { codes })
    }

    pub fn codes(&self) -> &[i64] {
        &self.codes
    }

    pub fn contains(&self, code: i64) -> bool {
        self.codes.contains(&code)
    }

    /// True when the sentinel `-1` is present
    pub fn forbids_exit(&self) -> bool {
        self.contains(NEVER_EXIT)
    }

    /// Turn an observed termination code into a verdict
    pub fn classify(&self, code: i64) -> Verdict {
        if self.forbids_exit() {
            Verdict::failure(format!(
                "Container exited with code {} but was expected to persist",
                code
            ))
        } else if self.contains(code) {
            Verdict::success(format!("Container exited successfully with code {}", code))
        } else {
            Verdict::failure(format!("Container exited with error code {}", code))
        }
    }
}

/// Deadline after which the configured status is reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutRule {
    pub duration: Duration,
    pub status: Outcome,
}

/// Source of lines watched by a pattern monitor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamTarget {
    Stdout,
    Stderr,
    File(PathBuf),
}

impl StreamTarget {
    pub fn parse(target: &str) -> Result<Self, ConditionError> {
        match target.trim() {
            "" => Err(ConditionError::EmptyTarget),
            "STDOUT" => Ok(StreamTarget::Stdout),
            "STDERR" => Ok(StreamTarget::Stderr),
            path => Ok(StreamTarget::File(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTarget::Stdout => f.write_str("STDOUT"),
            StreamTarget::Stderr => f.write_str("STDERR"),
            StreamTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A compiled `(regex, status)` pair
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub regex: Regex,
    pub status: Outcome,
}

impl PatternRule {
    pub fn new(pattern: &str, status: &str) -> Result<Self, ConditionError> {
        let regex = Regex::new(pattern).map_err(|source| ConditionError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            regex,
            status: parse_status(status)?,
        })
    }

    /// Verdict for a line, if this rule matches it
    pub fn evaluate(&self, line: &str) -> Option<Verdict> {
        self.regex.is_match(line).then(|| {
            Verdict::new(
                self.status.clone(),
                format!("'{}' matched /{}/", line, self.regex.as_str()),
            )
        })
    }
}

/// First matching rule wins; rules are evaluated in declared order
pub fn match_line(rules: &[PatternRule], line: &str) -> Option<Verdict> {
    rules.iter().find_map(|rule| rule.evaluate(line))
}

/// Validated readiness conditions of a single service
#[derive(Debug, Clone, Default)]
pub struct StateConditions {
    pub exit: Option<ExitCodeRule>,
    pub timeout: Option<TimeoutRule>,
    /// Pattern rules per stream, in first-declared order
    pub patterns: IndexMap<StreamTarget, Vec<PatternRule>>,
}

impl StateConditions {
    /// True when no rule is configured at all
    pub fn is_empty(&self) -> bool {
        self.exit.is_none() && self.timeout.is_none() && self.patterns.is_empty()
    }

    /// Number of monitors a readiness gate will run for these conditions
    pub fn monitor_count(&self) -> usize {
        usize::from(self.exit.is_some()) + usize::from(self.timeout.is_some()) + self.patterns.len()
    }

    /// Add a failing timeout when none is configured
    pub fn with_default_timeout(mut self, duration: Duration) -> Self {
        if self.timeout.is_none() && !self.is_empty() {
            self.timeout = Some(TimeoutRule {
                duration,
                status: Outcome::failure(),
            });
        }
        self
    }

    /// One-line description used by plans and logs
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(exit) = &self.exit {
            parts.push(format!("exit {:?}", exit.codes()));
        }
        if let Some(timeout) = &self.timeout {
            parts.push(format!(
                "timeout {}s -> {}",
                timeout.duration.as_secs_f64(),
                timeout.status
            ));
        }
        for (target, rules) in &self.patterns {
            let rules: Vec<String> = rules
                .iter()
                .map(|r| format!("/{}/ -> {}", r.regex.as_str(), r.status))
                .collect();
            parts.push(format!("{}: {}", target, rules.join(", ")));
        }
        parts.join("; ")
    }
}

/// `state_conditions` block as written in a compose file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionsSpec {
    /// Exit codes counted as success, `-1` for "must not exit"
    #[serde(default, deserialize_with = "numbers")]
    pub exit: Option<Vec<i64>>,

    /// Deadline for the service to become ready
    #[serde(default)]
    pub timeout: Option<TimeoutSpec>,

    /// Log and file patterns
    #[serde(default)]
    pub filemonitor: Option<Vec<FileMonitorSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSpec {
    /// Seconds, fractions allowed
    #[serde(deserialize_with = "number")]
    pub duration: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMonitorSpec {
    /// `STDOUT`, `STDERR` or a file path
    pub file: String,
    pub regex: String,
    pub status: String,
}

/// A number written literally or as a string; interpolated values are strings
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric<T> {
    Number(T),
    Text(String),
}

impl<T: FromStr> Numeric<T> {
    fn parse<E: serde::de::Error>(self) -> Result<T, E> {
        match self {
            Numeric::Number(n) => Ok(n),
            Numeric::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("expected a number, got '{}'", text))),
        }
    }
}

fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
{
    Numeric::<T>::deserialize(deserializer)?.parse()
}

fn numbers<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
{
    Option::<Vec<Numeric<T>>>::deserialize(deserializer)?
        .map(|values| values.into_iter().map(Numeric::parse).collect())
        .transpose()
}

impl TryFrom<&ConditionsSpec> for StateConditions {
    type Error = ConditionError;

    fn try_from(spec: &ConditionsSpec) -> Result<Self, Self::Error> {
        let exit = spec.exit.clone().map(ExitCodeRule::new).transpose()?;

        let timeout = match &spec.timeout {
            Some(t) => Some(TimeoutRule {
                duration: Duration::try_from_secs_f64(t.duration)
                    .map_err(|_| ConditionError::InvalidTimeout(t.duration))?,
                status: parse_status(&t.status)?,
            }),
            None => None,
        };

        let mut patterns: IndexMap<StreamTarget, Vec<PatternRule>> = IndexMap::new();
        for monitor in spec.filemonitor.iter().flatten() {
            let target = StreamTarget::parse(&monitor.file)?;
            let rule = PatternRule::new(&monitor.regex, &monitor.status)?;
            patterns.entry(target).or_default().push(rule);
        }

        Ok(Self {
            exit,
            timeout,
            patterns,
        })
    }
}

fn parse_status(status: &str) -> Result<Outcome, ConditionError> {
    let status = status.trim();
    if status.is_empty() {
        return Err(ConditionError::EmptyStatus);
    }
    Ok(Outcome::parse(status))
}

/// Errors in a `state_conditions` block
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Exit code list is empty")]
    EmptyExitCodes,

    #[error("Timeout duration must be a finite, non-negative number of seconds, got {0}")]
    InvalidTimeout(f64),

    #[error("Status must not be empty")]
    EmptyStatus,

    #[error("File monitor target must not be empty")]
    EmptyTarget,
}
