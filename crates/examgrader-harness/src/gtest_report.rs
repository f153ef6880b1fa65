//! googletest console report parser.
//!
//! The suite's stdout is read line by line:
//!
//! ```text
//! [==========] Running 4 tests from 1 test suite.
//! [ RUN      ] strlen.empty
//! [       OK ] strlen.empty (0 ms)
//! [ RUN      ] strlen.short
//! unit_test.cpp:12: Failure
//! [  FAILED  ] strlen.short (0 ms)
//! [==========] 4 tests from 1 test suite ran. (0 ms total)
//! [  FAILED  ] 1 test, listed below:
//! [  FAILED  ] strlen.short
//! ```
//!
//! Every `RUN` must be closed by an `OK`, `FAILED` or `SKIPPED` tag for the same case
//! before the next `RUN`. The closing tag may share a line with output the case printed
//! without a trailing newline. `FAILED` lines seen with no case open belong to the trailing
//! summary and are ignored. Anything that breaks this framing is a malformed report.

use thiserror::Error;

const BANNER: &str = "[==========] Running";
const SEPARATOR: &str = "[==========] ";
const RUN: &str = "[ RUN      ] ";
const OK: &str = "[       OK ] ";
const FAILED: &str = "[  FAILED  ] ";
const SKIPPED: &str = "[  SKIPPED ] ";

/// One executed case, in report order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseReport {
    pub name: String,
    /// Skipped cases count as passed; googletest does not fail the run for them.
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportParseError {
    #[error("no '[==========] Running' banner in output")]
    MissingBanner,
    #[error("line {line}: case '{name}' started while '{open}' was still running")]
    NestedRun {
        line: usize,
        open: String,
        name: String,
    },
    #[error("line {line}: result for '{name}' does not match the running case")]
    UnmatchedResult { line: usize, name: String },
    #[error("case '{name}' never reported a result")]
    Unclosed { name: String },
    #[error("no '[==========] ... ran.' trailer in output")]
    MissingTrailer,
}

/// Parse googletest console output into ordered case results.
pub fn parse(stdout: &[u8]) -> Result<Vec<CaseReport>, ReportParseError> {
    let mut cases = Vec::new();
    let mut open: Option<String> = None;
    let mut saw_banner = false;
    let mut saw_trailer = false;

    for (index, raw) in stdout.split(|&b| b == b'\n').enumerate() {
        let line_no = index + 1;
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.trim_end_matches('\r');

        if line.starts_with(BANNER) {
            saw_banner = true;
        } else if let Some(rest) = line.strip_prefix(SEPARATOR) {
            if saw_banner && rest.contains(" ran.") {
                saw_trailer = true;
            }
        } else if let Some(rest) = line.strip_prefix(RUN) {
            let name = rest.trim().to_string();
            if let Some(current) = open.take() {
                return Err(ReportParseError::NestedRun {
                    line: line_no,
                    open: current,
                    name,
                });
            }
            open = Some(name);
        } else if let Some((passed, rest)) = result_tag(line, open.is_some()) {
            cases.push(close(&mut open, rest, passed, line_no)?);
        }
    }

    if !saw_banner {
        return Err(ReportParseError::MissingBanner);
    }
    if let Some(name) = open {
        return Err(ReportParseError::Unclosed { name });
    }
    if !saw_trailer {
        return Err(ReportParseError::MissingTrailer);
    }
    Ok(cases)
}

/// Find a result tag and the text after it.
///
/// googletest prints no newline of its own before the tag, so while a case is open the tag
/// may follow whatever the case wrote last. With no case open only a leading tag counts, and
/// a leading `FAILED` belongs to the summary.
fn result_tag(line: &str, case_open: bool) -> Option<(bool, &str)> {
    if case_open {
        return [(OK, true), (SKIPPED, true), (FAILED, false)]
            .into_iter()
            .filter_map(|(tag, passed)| line.find(tag).map(|at| (at, tag, passed)))
            .min_by_key(|&(at, _, _)| at)
            .map(|(at, tag, passed)| (passed, &line[at + tag.len()..]));
    }
    if let Some(rest) = line.strip_prefix(OK).or_else(|| line.strip_prefix(SKIPPED)) {
        return Some((true, rest));
    }
    None
}

fn close(
    open: &mut Option<String>,
    rest: &str,
    passed: bool,
    line: usize,
) -> Result<CaseReport, ReportParseError> {
    let name = result_name(rest);
    match open.take() {
        Some(current) if current == name => Ok(CaseReport {
            name: current,
            passed,
        }),
        _ => Err(ReportParseError::UnmatchedResult {
            line,
            name: name.to_string(),
        }),
    }
}

/// Strip the ` (N ms)` timing and any `, where GetParam() = ...` suffix.
fn result_name(rest: &str) -> &str {
    let rest = rest.trim();
    let rest = match rest.rfind(" (") {
        Some(idx) if rest.ends_with(" ms)") => &rest[..idx],
        _ => rest,
    };
    let name = match rest.find(", where ") {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    name.trim_end()
}
