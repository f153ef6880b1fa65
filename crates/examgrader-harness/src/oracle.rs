//! Oracle comparison: observed run vs. a fixture's expected outcome.
//!
//! Abnormal terminations short-circuit before any output is inspected, so partial output
//! from a killed or crashed binary can never pass.

use std::collections::BTreeMap;

use examgrader_exec::process::signal_name;
use examgrader_exec::{ExecutionResult, ExitStatus, RunLimits};

use crate::diff::compare_bytes;
use crate::fixtures::{CaseExpectation, CaseResults, ExactBytes, ExpectedOutcome};
use crate::gtest_report;
use crate::verify::{CaseOutcome, CaseStatus, FailReason, RunErrorCause, Verdict};

/// Comparator output: one verdict plus per-case diagnostics for unit-test suites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub verdict: Verdict,
    pub cases: Vec<CaseOutcome>,
}

impl Comparison {
    fn verdict(verdict: Verdict) -> Self {
        Self {
            verdict,
            cases: Vec::new(),
        }
    }
}

/// Grade one run against its oracle.
///
/// A `ReferenceProgram` oracle has no bytes of its own; grade those runs with
/// [`compare_with_reference`].
#[must_use]
pub fn compare(
    expected: &ExpectedOutcome,
    run: &ExecutionResult,
    limits: &RunLimits,
) -> Comparison {
    if let Some(cause) = abnormal_cause(run.status, limits) {
        return Comparison::verdict(Verdict::RunError { cause });
    }
    match expected {
        ExpectedOutcome::ExactBytes(exact) => {
            Comparison::verdict(compare_exact(exact, run, limits.max_output_bytes))
        }
        ExpectedOutcome::CaseResults(cases) => compare_cases(cases, run),
        ExpectedOutcome::ReferenceProgram(_) => Comparison::verdict(Verdict::RunError {
            cause: RunErrorCause::Reference {
                message: "no reference run to compare against".to_string(),
            },
        }),
    }
}

/// Grade a run against the reference program's run over the same arguments: stdout, stderr
/// and exit code must all match exactly.
///
/// The submission's own abnormal end is reported first. A reference that did not exit
/// normally, or whose output hit the capture cap, yields `RunError(Reference)`.
#[must_use]
pub fn compare_with_reference(
    reference: &ExecutionResult,
    run: &ExecutionResult,
    limits: &RunLimits,
) -> Comparison {
    if let Some(cause) = abnormal_cause(run.status, limits) {
        return Comparison::verdict(Verdict::RunError { cause });
    }
    let problem = if reference.status.is_abnormal() {
        Some(reference.status.to_string())
    } else if reference.stdout_truncated || reference.stderr_truncated {
        Some(format!("output exceeded {} bytes", limits.max_output_bytes))
    } else {
        None
    };
    if let Some(message) = problem {
        return Comparison::verdict(Verdict::RunError {
            cause: RunErrorCause::Reference { message },
        });
    }
    Comparison::verdict(compare_exact(
        &reference_expectation(reference),
        run,
        limits.max_output_bytes,
    ))
}

/// The exact-bytes oracle a reference run stands for.
#[must_use]
pub fn reference_expectation(reference: &ExecutionResult) -> ExactBytes {
    ExactBytes {
        stdout: reference.stdout.clone(),
        stderr: Some(reference.stderr.clone()),
        exit_code: reference.status.code(),
    }
}

fn abnormal_cause(status: ExitStatus, limits: &RunLimits) -> Option<RunErrorCause> {
    match status {
        ExitStatus::Exited { .. } => None,
        ExitStatus::Timeout => Some(RunErrorCause::Timeout {
            limit_ms: u64::try_from(limits.timeout.as_millis()).unwrap_or(u64::MAX),
        }),
        ExitStatus::Crashed { signal } => Some(RunErrorCause::Crashed {
            signal,
            name: signal_name(signal).map(str::to_string),
        }),
        ExitStatus::Cancelled => Some(RunErrorCause::Cancelled),
    }
}

/// stdout, then stderr, then exit code; the first mismatch wins.
fn compare_exact(expected: &ExactBytes, run: &ExecutionResult, limit: usize) -> Verdict {
    if run.stdout_truncated {
        return truncated("stdout", limit);
    }
    if let Some(mismatch) = compare_bytes(&expected.stdout, &run.stdout) {
        return Verdict::Fail {
            reason: FailReason::StdoutMismatch(mismatch),
        };
    }
    if let Some(stderr) = &expected.stderr {
        if run.stderr_truncated {
            return truncated("stderr", limit);
        }
        if let Some(mismatch) = compare_bytes(stderr, &run.stderr) {
            return Verdict::Fail {
                reason: FailReason::StderrMismatch(mismatch),
            };
        }
    }
    exit_code_verdict(expected.exit_code, run.status)
}

fn truncated(stream: &str, limit: usize) -> Verdict {
    Verdict::Fail {
        reason: FailReason::OutputTruncated {
            stream: stream.to_string(),
            limit,
        },
    }
}

fn exit_code_verdict(expected: Option<i32>, status: ExitStatus) -> Verdict {
    match (expected, status.code()) {
        (Some(expected), Some(actual)) if expected != actual => Verdict::Fail {
            reason: FailReason::ExitCodeMismatch { expected, actual },
        },
        _ => Verdict::Pass,
    }
}

fn compare_cases(expected: &CaseResults, run: &ExecutionResult) -> Comparison {
    if run.stdout_truncated {
        return Comparison::verdict(Verdict::RunError {
            cause: RunErrorCause::MalformedReport {
                message: "report exceeded the capture limit".to_string(),
            },
        });
    }
    let reported = match gtest_report::parse(&run.stdout) {
        Ok(reported) => reported,
        Err(err) => {
            return Comparison::verdict(Verdict::RunError {
                cause: RunErrorCause::MalformedReport {
                    message: err.to_string(),
                },
            });
        }
    };

    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    for case in &reported {
        *occurrences.entry(case.name.as_str()).or_default() += 1;
    }

    let mut outcomes = Vec::with_capacity(reported.len() + expected.cases.len());
    let mut mismatched = Vec::new();
    let mut duplicated = Vec::new();
    for case in &reported {
        let actual = CaseExpectation::from_passed(case.passed);
        let wanted = expected.cases.get(&case.name).copied();
        let status = if occurrences.get(case.name.as_str()).copied().unwrap_or(0) > 1 {
            if wanted.is_some() && !duplicated.contains(&case.name) {
                duplicated.push(case.name.clone());
            }
            if wanted.is_some() {
                CaseStatus::Duplicated
            } else {
                CaseStatus::Unexpected
            }
        } else {
            match wanted {
                None => CaseStatus::Unexpected,
                Some(want) if want == actual => CaseStatus::Matched,
                Some(_) => {
                    mismatched.push(case.name.clone());
                    CaseStatus::Mismatched
                }
            }
        };
        outcomes.push(CaseOutcome {
            name: case.name.clone(),
            expected: wanted,
            actual: Some(actual),
            status,
        });
    }

    let mut missing = Vec::new();
    for (name, want) in &expected.cases {
        if !occurrences.contains_key(name.as_str()) {
            missing.push(name.clone());
            outcomes.push(CaseOutcome {
                name: name.clone(),
                expected: Some(*want),
                actual: None,
                status: CaseStatus::Missing,
            });
        }
    }

    let verdict = if mismatched.is_empty() && missing.is_empty() && duplicated.is_empty() {
        exit_code_verdict(expected.exit_code, run.status)
    } else {
        Verdict::Fail {
            reason: FailReason::CaseResults {
                mismatched,
                missing,
                duplicated,
            },
        }
    };
    Comparison {
        verdict,
        cases: outcomes,
    }
}
