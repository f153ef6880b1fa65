//! Byte-level diff rendering for oracle comparison.

use examgrader_exec::ExecutionResult;

use crate::fixtures::ExactBytes;
use crate::verify::ByteMismatch;

/// Bytes shown on each side of a divergence.
const EXCERPT_CONTEXT: usize = 16;

/// Index of the first differing byte, or `None` when the sequences are identical.
#[must_use]
pub fn first_divergence(expected: &[u8], actual: &[u8]) -> Option<usize> {
    if expected == actual {
        return None;
    }
    let offset = expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e != a)
        .unwrap_or_else(|| expected.len().min(actual.len()));
    Some(offset)
}

/// Compare two byte sequences exactly.
#[must_use]
pub fn compare_bytes(expected: &[u8], actual: &[u8]) -> Option<ByteMismatch> {
    let offset = first_divergence(expected, actual)?;
    Some(ByteMismatch {
        offset,
        expected_len: expected.len(),
        actual_len: actual.len(),
        expected_excerpt: excerpt(expected, offset),
        actual_excerpt: excerpt(actual, offset),
    })
}

/// Escaped window around `offset`, with `...` marking elided ends.
#[must_use]
pub fn excerpt(bytes: &[u8], offset: usize) -> String {
    let start = offset.saturating_sub(EXCERPT_CONTEXT);
    let end = offset.saturating_add(EXCERPT_CONTEXT).min(bytes.len());
    if start >= end {
        return if bytes.len() > start { "...".into() } else { String::new() };
    }
    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.push_str(&escape_bytes(&bytes[start..end]));
    if end < bytes.len() {
        out.push_str("...");
    }
    out
}

/// Render bytes as printable ASCII; everything else becomes an escape.
#[must_use]
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\0' => out.push_str("\\0"),
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(char::from(b)),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Side-by-side trace of a failed byte-exact run.
///
/// ```text
/// Failure with args: x, y,
/// Expected Output:
/// Exit Code: 0
/// Stdout: a\n
/// Stderr: <not graded>
/// Actual Output:
/// Exit Code: 0
/// Stdout: \n
/// Stderr:
/// ```
#[must_use]
pub fn render_trace(args: &[String], expected: &ExactBytes, actual: &ExecutionResult) -> String {
    let mut out = String::from("Failure with args:");
    for arg in args {
        out.push(' ');
        out.push_str(arg);
        out.push(',');
    }
    out.push('\n');

    out.push_str("Expected Output:\n");
    match expected.exit_code {
        Some(code) => out.push_str(&format!("Exit Code: {code}\n")),
        None => out.push_str("Exit Code: <not graded>\n"),
    }
    out.push_str(&format!("Stdout: {}\n", escape_bytes(&expected.stdout)));
    match &expected.stderr {
        Some(stderr) => out.push_str(&format!("Stderr: {}\n", escape_bytes(stderr))),
        None => out.push_str("Stderr: <not graded>\n"),
    }

    out.push_str("Actual Output:\n");
    match actual.status.code() {
        Some(code) => out.push_str(&format!("Exit Code: {code}\n")),
        None => out.push_str(&format!("Exit Code: <{}>\n", actual.status)),
    }
    out.push_str(&format!(
        "Stdout: {}{}\n",
        escape_bytes(&actual.stdout),
        if actual.stdout_truncated { "..." } else { "" }
    ));
    out.push_str(&format!(
        "Stderr: {}{}\n",
        escape_bytes(&actual.stderr),
        if actual.stderr_truncated { "..." } else { "" }
    ));
    out
}
