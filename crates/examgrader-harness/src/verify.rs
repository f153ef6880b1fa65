//! Verdicts and their aggregation.

use serde::{Deserialize, Serialize};

use crate::fixtures::{CaseExpectation, FixtureKind};

/// Where two byte sequences first differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteMismatch {
    /// First differing index, or the shorter length when one is a prefix of the other.
    pub offset: usize,
    pub expected_len: usize,
    pub actual_len: usize,
    pub expected_excerpt: String,
    pub actual_excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailReason {
    StdoutMismatch(ByteMismatch),
    StderrMismatch(ByteMismatch),
    /// The capture cap was hit, so the stream cannot be compared.
    OutputTruncated { stream: String, limit: usize },
    ExitCodeMismatch { expected: i32, actual: i32 },
    CaseResults {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mismatched: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        duplicated: Vec<String>,
    },
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StdoutMismatch(m) | Self::StderrMismatch(m) => {
                let stream = if matches!(self, Self::StdoutMismatch(_)) {
                    "stdout"
                } else {
                    "stderr"
                };
                write!(
                    f,
                    "{stream} differs at byte {} (expected {} bytes, got {}): expected \"{}\", got \"{}\"",
                    m.offset, m.expected_len, m.actual_len, m.expected_excerpt, m.actual_excerpt
                )
            }
            Self::OutputTruncated { stream, limit } => {
                write!(f, "{stream} exceeded the {limit}-byte capture limit")
            }
            Self::ExitCodeMismatch { expected, actual } => {
                write!(f, "exit code {actual}, expected {expected}")
            }
            Self::CaseResults {
                mismatched,
                missing,
                duplicated,
            } => {
                let mut parts = Vec::new();
                if !mismatched.is_empty() {
                    parts.push(format!("mismatched: {}", mismatched.join(", ")));
                }
                if !missing.is_empty() {
                    parts.push(format!("missing: {}", missing.join(", ")));
                }
                if !duplicated.is_empty() {
                    parts.push(format!("duplicated: {}", duplicated.join(", ")));
                }
                f.write_str(&parts.join("; "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunErrorCause {
    Timeout {
        limit_ms: u64,
    },
    Crashed {
        signal: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Cancelled,
    MalformedReport {
        message: String,
    },
    /// The harness could not start or observe the binary.
    Harness {
        message: String,
    },
    /// The reference program did not build, or did not run to a normal exit.
    Reference {
        message: String,
    },
}

impl RunErrorCause {
    /// Timeouts can depend on machine load; everything else is deterministic.
    #[must_use]
    pub fn environment_sensitive(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl std::fmt::Display for RunErrorCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { limit_ms } => write!(f, "timed out after {limit_ms} ms"),
            Self::Crashed {
                signal,
                name: Some(name),
            } => write!(f, "crashed with signal {signal} ({name})"),
            Self::Crashed { signal, name: None } => write!(f, "crashed with signal {signal}"),
            Self::Cancelled => f.write_str("cancelled before completion"),
            Self::MalformedReport { message } => write!(f, "malformed test report: {message}"),
            Self::Harness { message } => write!(f, "harness failure: {message}"),
            Self::Reference { message } => write!(f, "reference program failed: {message}"),
        }
    }
}

/// Terminal outcome for one fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { reason: FailReason },
    BuildError { diagnostics: String },
    RunError { cause: RunErrorCause },
}

impl Verdict {
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail { .. } => "FAIL",
            Self::BuildError { .. } => "BUILD_ERROR",
            Self::RunError { .. } => "RUN_ERROR",
        }
    }

    /// One-line explanation for tables and logs.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Pass => String::new(),
            Self::Fail { reason } => reason.to_string(),
            Self::BuildError { diagnostics } => diagnostics
                .lines()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("toolchain failed")
                .to_string(),
            Self::RunError { cause } => cause.to_string(),
        }
    }

    #[must_use]
    pub fn environment_sensitive(&self) -> bool {
        matches!(self, Self::RunError { cause } if cause.environment_sensitive())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Matched,
    Mismatched,
    Missing,
    Duplicated,
    /// Reported by the suite but not part of the expectation.
    Unexpected,
}

/// Diagnostic detail for one named sub-case of a unit-test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<CaseExpectation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<CaseExpectation>,
    pub status: CaseStatus,
}

/// Result of grading one fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradedFixture {
    pub fixture_id: String,
    pub kind: FixtureKind,
    #[serde(flatten)]
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<CaseOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub environment_sensitive: bool,
}

impl GradedFixture {
    #[must_use]
    pub fn new(fixture_id: impl Into<String>, kind: FixtureKind, verdict: Verdict) -> Self {
        let environment_sensitive = verdict.environment_sensitive();
        Self {
            fixture_id: fixture_id.into(),
            kind,
            verdict,
            cases: Vec::new(),
            trace: None,
            environment_sensitive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub build_errors: usize,
    pub run_errors: usize,
    pub results: Vec<GradedFixture>,
}

impl GradeSummary {
    /// Build a summary; results are ordered by fixture id.
    #[must_use]
    pub fn from_results(mut results: Vec<GradedFixture>) -> Self {
        results.sort_by(|a, b| a.fixture_id.cmp(&b.fixture_id));
        let count =
            |pred: fn(&Verdict) -> bool| results.iter().filter(|r| pred(&r.verdict)).count();
        Self {
            total: results.len(),
            passed: count(|v| matches!(v, Verdict::Pass)),
            failed: count(|v| matches!(v, Verdict::Fail { .. })),
            build_errors: count(|v| matches!(v, Verdict::BuildError { .. })),
            run_errors: count(|v| matches!(v, Verdict::RunError { .. })),
            results,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}
