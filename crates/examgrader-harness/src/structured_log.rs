//! Structured JSONL logging for grading runs.
//!
//! Provides:
//! - [`LogEntry`]: canonical JSONL record with required + optional fields.
//! - [`LogEmitter`]: thread-safe JSONL writer shared by every grading worker.
//! - [`ArtifactIndex`]: lists produced report files with SHA-256 digests.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks for emitted logs.
//!
//! Trace ids follow `<run_id>::<fixture_id>::<seq>`; records not tied to a fixture use
//! `run` in the middle slot.

use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Pipeline step a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Load,
    Build,
    Run,
    Compare,
    Report,
}

/// Verdict class, as logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    BuildError,
    RunError,
}

impl Outcome {
    #[must_use]
    pub fn of(verdict: &crate::verify::Verdict) -> Self {
        use crate::verify::Verdict;
        match verdict {
            Verdict::Pass => Self::Pass,
            Verdict::Fail { .. } => Self::Fail,
            Verdict::BuildError { .. } => Self::BuildError,
            Verdict::RunError { .. } => Self::RunError,
        }
    }
}

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const PHASES: [&str; 5] = ["load", "build", "run", "compare", "report"];
const OUTCOMES: [&str; 4] = ["pass", "fail", "build_error", "run_error"];

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixture_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// blake3 build fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_refs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            fixture_id: None,
            phase: None,
            outcome: None,
            exit_code: None,
            signal: None,
            duration_ms: None,
            fingerprint: None,
            artifact_refs: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_fixture(mut self, fixture_id: impl Into<String>) -> Self {
        self.fixture_id = Some(fixture_id.into());
        self
    }

    #[must_use]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    #[must_use]
    pub fn with_signal(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    #[must_use]
    pub fn with_artifacts(mut self, refs: Vec<String>) -> Self {
        self.artifact_refs = Some(refs);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A single artifact entry in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub kind: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub index_version: u32,
    pub run_id: String,
    pub generated_utc: String,
    pub artifacts: Vec<ArtifactEntry>,
}

impl ArtifactIndex {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            index_version: 1,
            run_id: run_id.into(),
            generated_utc: now_utc(),
            artifacts: Vec::new(),
        }
    }

    /// Hash `path` and add it to the index.
    pub fn add_file(&mut self, path: &Path, kind: impl Into<String>) -> std::io::Result<&mut Self> {
        let bytes = std::fs::read(path)?;
        self.artifacts.push(ArtifactEntry {
            path: path.display().to_string(),
            kind: kind.into(),
            sha256: sha256_hex(&bytes),
            size_bytes: Some(bytes.len() as u64),
        });
        Ok(self)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

struct EmitterState {
    writer: Box<dyn Write + Send>,
    seq: u64,
    error: Option<std::io::Error>,
}

/// Writes structured JSONL log entries; safe to share across worker threads.
///
/// A failed write does not stop the run: the first error is kept and returned by
/// [`LogEmitter::flush`].
pub struct LogEmitter {
    run_id: String,
    state: Mutex<EmitterState>,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(std::io::BufWriter::new(file), run_id))
    }

    #[must_use]
    pub fn to_writer(writer: impl Write + Send + 'static, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: Mutex::new(EmitterState {
                writer: Box::new(writer),
                seq: 0,
                error: None,
            }),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit a bare record with an auto-generated trace id.
    pub fn emit(&self, level: LogLevel, event: &str) -> LogEntry {
        let entry = LogEntry::new(String::new(), level, event);
        self.emit_entry(entry)
    }

    /// Emit a populated record; an empty `trace_id` is filled in from the fixture id and
    /// the emitter's sequence counter.
    pub fn emit_entry(&self, mut entry: LogEntry) -> LogEntry {
        let mut state = self.state.lock();
        state.seq += 1;
        if entry.trace_id.is_empty() {
            let scope = entry.fixture_id.as_deref().unwrap_or("run");
            entry.trace_id = format!("{}::{}::{:03}", self.run_id, scope, state.seq);
        }
        let written = entry
            .to_jsonl()
            .map_err(std::io::Error::other)
            .and_then(|line| writeln!(state.writer, "{line}"));
        if let Err(err) = written
            && state.error.is_none()
        {
            state.error = Some(err);
        }
        entry
    }

    pub fn flush(&self) -> std::io::Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.error.take() {
            return Err(err);
        }
        state.writer.flush()
    }
}

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let mut push = |field: &str, message: String| {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message,
        });
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            push("<json>", format!("invalid JSON: {e}"));
            return Err(errors);
        }
    };
    let Some(obj) = value.as_object() else {
        push("<root>", "expected JSON object".to_string());
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            push(field, "required field missing".to_string());
        }
    }

    for (field, allowed) in [
        ("level", &LEVELS[..]),
        ("phase", &PHASES[..]),
        ("outcome", &OUTCOMES[..]),
    ] {
        if let Some(value) = obj.get(field).and_then(|v| v.as_str())
            && !allowed.contains(&value)
        {
            push(field, format!("invalid {field}: '{value}'"));
        }
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && trace_id.split("::").count() < 3
    {
        push(
            "trace_id",
            format!("trace_id should follow <run_id>::<fixture_id>::<seq> format, got: '{trace_id}'"),
        );
    }

    if obj.contains_key("outcome") && !obj.contains_key("fixture_id") {
        push("fixture_id", "outcome records must name a fixture".to_string());
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError {
            line_number,
            field: "<deserialization>".to_string(),
            message: format!("failed to deserialize: {e}"),
        }]
    })
}

/// Validate an entire JSONL file.
///
/// Returns the non-empty line count and any validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

/// RFC 3339 UTC timestamp with millisecond precision.
fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn log_entry_serializes_required_fields_only() {
        let entry = LogEntry::new("run-1::hello_world::001", LogLevel::Info, "build_start");
        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "run-1::hello_world::001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "build_start");
        assert!(parsed.get("fixture_id").is_none());
        assert!(parsed.get("phase").is_none());
    }

    #[test]
    fn log_entry_with_optional_fields() {
        let entry = LogEntry::new("run-1::has_a::002", LogLevel::Warn, "fixture_graded")
            .with_fixture("has_a")
            .with_phase(Phase::Compare)
            .with_outcome(Outcome::RunError)
            .with_signal(11)
            .with_exit_code(0)
            .with_duration_ms(4)
            .with_fingerprint("abc")
            .with_artifacts(vec!["build/has_a".into()])
            .with_details(serde_json::json!({"cause": "crashed"}));
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["phase"], "compare");
        assert_eq!(parsed["outcome"], "run_error");
        assert_eq!(parsed["signal"], 11);
        assert_eq!(parsed["duration_ms"], 4);
        assert!(validate_log_line(&json, 1).is_ok());
    }

    #[test]
    fn validation_flags_schema_violations() {
        let missing = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"info","event":"x"}"#;
        let errs = validate_log_line(missing, 1).unwrap_err();
        assert!(errs.iter().any(|e| e.field == "trace_id"));

        let bad_phase = r#"{"timestamp":"t","trace_id":"a::b::001","level":"info","event":"x","phase":"link"}"#;
        let errs = validate_log_line(bad_phase, 2).unwrap_err();
        assert!(errs.iter().any(|e| e.field == "phase"));

        let bad_level = r#"{"timestamp":"t","trace_id":"a::b::001","level":"fatal","event":"x"}"#;
        assert!(validate_log_line(bad_level, 3).is_err());

        let short_trace = r#"{"timestamp":"t","trace_id":"a::b","level":"info","event":"x"}"#;
        let errs = validate_log_line(short_trace, 4).unwrap_err();
        assert!(errs.iter().any(|e| e.field == "trace_id"));

        let orphan_outcome = r#"{"timestamp":"t","trace_id":"a::b::001","level":"info","event":"x","outcome":"pass"}"#;
        let errs = validate_log_line(orphan_outcome, 5).unwrap_err();
        assert!(errs.iter().any(|e| e.field == "fixture_id"));

        assert!(validate_log_line("not json", 6).is_err());
        assert!(validate_log_line("[1]", 7).is_err());
    }

    #[test]
    fn emitter_sequences_trace_ids_across_threads() {
        let buf = SharedBuf::default();
        let emitter = LogEmitter::to_writer(buf.clone(), "run-42");
        let first = emitter.emit(LogLevel::Info, "run_start");
        assert_eq!(first.trace_id, "run-42::run::001");

        std::thread::scope(|scope| {
            for id in ["a", "b", "c", "d"] {
                let emitter = &emitter;
                scope.spawn(move || {
                    emitter.emit_entry(
                        LogEntry::new("", LogLevel::Info, "fixture_start").with_fixture(id),
                    );
                });
            }
        });
        emitter.flush().unwrap();

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        let mut seqs = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let entry = validate_log_line(line, i + 1).unwrap();
            seqs.push(entry.trace_id.rsplit("::").next().unwrap().to_string());
        }
        seqs.sort();
        assert_eq!(seqs, ["001", "002", "003", "004", "005"]);
    }

    #[test]
    fn artifact_index_hashes_files() {
        let path = std::env::temp_dir().join(format!("examgrader-index-{}.md", std::process::id()));
        std::fs::write(&path, b"abc").unwrap();
        let mut index = ArtifactIndex::new("run-1");
        index.add_file(&path, "report_markdown").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();
        assert_eq!(
            parsed["artifacts"][0]["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(parsed["artifacts"][0]["size_bytes"], 3);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn utc_formatting_is_calendar_correct() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_utc(951_782_400, 5), "2000-02-29T00:00:00.005Z");
        assert_eq!(format_utc(1_790_000_000, 0), "2026-09-21T14:13:20.000Z");
    }
}
