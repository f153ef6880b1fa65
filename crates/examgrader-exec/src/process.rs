//! Bounded child-process execution with raw byte capture.
//!
//! Output is captured as `Vec<u8>` end to end. Nothing here decodes, trims or
//! NUL-terminates a stream; interpretation happens only at comparison time.

use std::ffi::OsStr;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::ExecError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// How long pipes may stay open once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Limits applied to one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    /// Wall-clock bound. The child's process group is killed when it elapses.
    pub timeout: Duration,
    /// Per-stream capture cap; bytes past it are drained and discarded.
    pub max_output_bytes: usize,
    /// Optional `RLIMIT_AS` for the child.
    pub memory_limit_bytes: Option<u64>,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            memory_limit_bytes: None,
        }
    }
}

/// How a child ended. Never a bare integer: a hang and a crash must stay
/// distinguishable from a deliberate nonzero return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    Exited { code: i32 },
    Crashed { signal: i32 },
    Timeout,
    Cancelled,
}

impl ExitStatus {
    /// Exit code for a normal exit.
    #[must_use]
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(code),
            _ => None,
        }
    }

    #[must_use]
    pub fn signal(self) -> Option<i32> {
        match self {
            Self::Crashed { signal } => Some(signal),
            _ => None,
        }
    }

    /// True for anything other than a normal exit.
    #[must_use]
    pub fn is_abnormal(self) -> bool {
        !matches!(self, Self::Exited { .. })
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Crashed { signal } => match signal_name(*signal) {
                Some(name) => write!(f, "killed by signal {signal} ({name})"),
                None => write!(f, "killed by signal {signal}"),
            },
            Self::Timeout => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Conventional name for the signals a buggy fixture is likely to die from.
#[must_use]
pub fn signal_name(signal: i32) -> Option<&'static str> {
    let name = match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGKILL => "SIGKILL",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTRAP => "SIGTRAP",
        _ => return None,
    };
    Some(name)
}

/// Everything observed about one child run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub status: ExitStatus,
    pub duration: Duration,
}

/// Resource limits set in the child between fork and exec.
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    cpu_seconds: u64,
    address_space: Option<u64>,
}

impl ChildLimits {
    fn for_limits(limits: &RunLimits) -> Self {
        let whole = limits.timeout.as_secs();
        let partial = u64::from(limits.timeout.subsec_nanos() > 0);
        Self {
            cpu_seconds: whole.saturating_add(partial).saturating_add(1),
            address_space: limits.memory_limit_bytes,
        }
    }

    /// Runs in the forked child: only async-signal-safe calls, no allocation.
    fn apply(self) -> std::io::Result<()> {
        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: setrlimit(2) reads a valid, stack-allocated rlimit struct.
        if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &core) } != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let cpu = libc::rlimit {
            rlim_cur: self.cpu_seconds as libc::rlim_t,
            rlim_max: self.cpu_seconds.saturating_add(1) as libc::rlim_t,
        };
        // SAFETY: as above.
        if unsafe { libc::setrlimit(libc::RLIMIT_CPU, &cpu) } != 0 {
            return Err(std::io::Error::last_os_error());
        }

        if let Some(bytes) = self.address_space {
            let address_space = libc::rlimit {
                rlim_cur: bytes as libc::rlim_t,
                rlim_max: bytes as libc::rlim_t,
            };
            // SAFETY: as above.
            if unsafe { libc::setrlimit(libc::RLIMIT_AS, &address_space) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Run `program` with `args`, bounded by `limits`, and capture both streams as raw bytes.
///
/// stdin is `/dev/null`. The child leads a fresh process group; on timeout or
/// cancellation the whole group receives SIGKILL and whatever was captured up to that
/// point is still returned. A pipe still held open 250ms after the child is
/// gone (a descendant that left the group) is abandoned and its stream flagged truncated.
/// Only a failure to spawn, wait or capture is an `Err`.
pub fn run_binary<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    limits: &RunLimits,
    cancel: &CancelToken,
) -> Result<ExecutionResult, ExecError> {
    let program = program.as_ref();
    let child_limits = ChildLimits::for_limits(limits);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    // SAFETY: the hook runs between fork and exec and only calls setrlimit(2).
    unsafe {
        cmd.pre_exec(move || child_limits.apply());
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })?;

    let cap = limits.max_output_bytes;
    let (sender, receiver) = mpsc::channel();
    let mut open = 0;
    if let Some(pipe) = child.stdout.take() {
        spawn_reader(pipe, Stream::Stdout, cap, sender.clone());
        open += 1;
    }
    if let Some(pipe) = child.stderr.take() {
        spawn_reader(pipe, Stream::Stderr, cap, sender.clone());
        open += 1;
    }
    drop(sender);

    let status = wait_with_deadline(&mut child, limits.timeout, cancel)?;
    let duration = started.elapsed();

    let captured = collect_streams(&receiver, open, Instant::now() + DRAIN_GRACE)?;

    Ok(ExecutionResult {
        stdout: captured.stdout.bytes,
        stderr: captured.stderr.bytes,
        stdout_truncated: captured.stdout.truncated,
        stderr_truncated: captured.stderr.truncated,
        status,
        duration,
    })
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ExitStatus, ExecError> {
    let pid = child.id();
    let deadline = Instant::now().checked_add(timeout);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                // Stragglers (backgrounded grandchildren) would keep the pipes open.
                kill_group(pid);
                return Ok(classify(status));
            }
            Ok(None) => {}
            Err(source) => {
                kill_group(pid);
                let _ = child.wait();
                return Err(ExecError::Wait { pid, source });
            }
        }

        if cancel.is_cancelled() {
            terminate(child, pid)?;
            return Ok(ExitStatus::Cancelled);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            terminate(child, pid)?;
            return Ok(ExitStatus::Timeout);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn terminate(child: &mut Child, pid: u32) -> Result<(), ExecError> {
    kill_group(pid);
    let _ = child.kill();
    child
        .wait()
        .map(|_| ())
        .map_err(|source| ExecError::Wait { pid, source })
}

fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. The negative pid addresses the
    // process group created for this child by `process_group(0)`; ESRCH is ignored.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

fn classify(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        ExitStatus::Exited { code }
    } else {
        ExitStatus::Crashed {
            signal: status.signal().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// What a reader thread reports back to [`run_binary`].
enum ReaderEvent {
    Data(Stream, Vec<u8>),
    Closed(Stream, std::io::Result<bool>),
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct Captured {
    stdout: Capture,
    stderr: Capture,
}

impl Captured {
    fn stream(&mut self, stream: Stream) -> &mut Capture {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }
}

/// Forward one pipe to the collector chunk by chunk. The thread is detached: a pipe held
/// open by a process that left the group must never hold the run.
fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    stream: Stream,
    cap: usize,
    sender: mpsc::Sender<ReaderEvent>,
) {
    thread::spawn(move || {
        let outcome = drain_capped(pipe, cap, |chunk| {
            sender
                .send(ReaderEvent::Data(stream, chunk.to_vec()))
                .is_ok()
        });
        let _ = sender.send(ReaderEvent::Closed(stream, outcome));
    });
}

/// Gather reader output until every stream closes or `deadline` passes.
///
/// A stream still open at the deadline keeps what arrived so far and is flagged truncated.
fn collect_streams(
    receiver: &mpsc::Receiver<ReaderEvent>,
    mut open: usize,
    deadline: Instant,
) -> Result<Captured, ExecError> {
    let mut captured = Captured::default();

    while open > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok(ReaderEvent::Data(stream, chunk)) => {
                captured.stream(stream).bytes.extend_from_slice(&chunk);
            }
            Ok(ReaderEvent::Closed(stream, outcome)) => {
                let capture = captured.stream(stream);
                capture.closed = true;
                capture.truncated |= outcome.map_err(|source| ExecError::Capture {
                    stream: stream.as_str(),
                    source,
                })?;
                open -= 1;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let stream = [Stream::Stdout, Stream::Stderr]
                    .into_iter()
                    .find(|&s| !captured.stream(s).closed)
                    .unwrap_or(Stream::Stdout);
                return Err(ExecError::ReaderPanicked {
                    stream: stream.as_str(),
                });
            }
        }
    }

    for stream in [Stream::Stdout, Stream::Stderr] {
        let capture = captured.stream(stream);
        if open > 0 && !capture.closed {
            capture.truncated = true;
        }
    }
    Ok(captured)
}

/// Read until EOF, handing at most `cap` bytes to `sink`. Bytes past the cap are drained and
/// discarded. Returns whether any were dropped; stops early once `sink` returns false.
fn drain_capped<R: Read>(
    mut reader: R,
    cap: usize,
    mut sink: impl FnMut(&[u8]) -> bool,
) -> std::io::Result<bool> {
    let mut chunk = [0u8; 8192];
    let mut kept = 0usize;
    let mut truncated = false;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        if truncated {
            continue;
        }

        let take = n.min(cap.saturating_sub(kept));
        truncated = take < n;
        if take > 0 {
            kept += take;
            if !sink(&chunk[..take]) {
                break;
            }
        }
    }

    Ok(truncated)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn sh(script: &str, limits: &RunLimits) -> ExecutionResult {
        run_binary("/bin/sh", &["-c", script], limits, &CancelToken::new())
            .expect("sh should spawn")
    }

    fn quick(timeout_ms: u64) -> RunLimits {
        RunLimits {
            timeout: Duration::from_millis(timeout_ms),
            ..RunLimits::default()
        }
    }

    #[test]
    fn embedded_nul_is_captured_as_data() {
        let result = sh(r"printf 'Weird\000string'", &RunLimits::default());
        assert_eq!(result.status, ExitStatus::Exited { code: 0 });
        assert_eq!(result.stdout, b"Weird\0string");
        assert_eq!(result.stdout.len(), 12);
    }

    #[test]
    fn long_output_is_not_bounded_below_cap() {
        let result = sh("printf '%0720d' 0", &RunLimits::default());
        assert_eq!(result.stdout.len(), 720);
        assert!(!result.stdout_truncated);
    }

    #[test]
    fn no_newline_normalization() {
        let result = sh(r"printf 'a\r\nb\n\n'", &RunLimits::default());
        assert_eq!(result.stdout, b"a\r\nb\n\n");
    }

    #[test]
    fn nonzero_exit_is_a_normal_exit() {
        let result = sh("printf out; printf err >&2; exit 3", &RunLimits::default());
        assert_eq!(result.status, ExitStatus::Exited { code: 3 });
        assert!(!result.status.is_abnormal());
        assert_eq!(result.stdout, b"out");
        assert_eq!(result.stderr, b"err");
    }

    #[test]
    fn infinite_loop_times_out_with_partial_output() {
        let started = Instant::now();
        let result = sh("printf partial; while :; do :; done", &quick(200));
        assert_eq!(result.status, ExitStatus::Timeout);
        assert_eq!(result.stdout, b"partial");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn fault_is_reported_as_crash() {
        let result = sh("kill -SEGV $$", &RunLimits::default());
        assert_eq!(
            result.status,
            ExitStatus::Crashed {
                signal: libc::SIGSEGV
            }
        );
        assert_eq!(result.status.to_string(), "killed by signal 11 (SIGSEGV)");
    }

    #[test]
    fn backgrounded_grandchild_does_not_hold_the_run() {
        let started = Instant::now();
        let result = sh("sleep 30 & printf done", &quick(5_000));
        assert_eq!(result.status, ExitStatus::Exited { code: 0 });
        assert_eq!(result.stdout, b"done");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn grandchild_outside_the_group_does_not_hold_the_run() {
        if !Path::new("/usr/bin/setsid").exists() && !Path::new("/bin/setsid").exists() {
            eprintln!("skipping: setsid not available");
            return;
        }
        let started = Instant::now();
        let result = sh("setsid sleep 30 & printf done", &quick(500));
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert_eq!(result.status, ExitStatus::Exited { code: 0 });
        assert_eq!(result.stdout, b"done");
        assert!(result.stdout_truncated);
        assert!(result.stderr_truncated);
    }

    #[test]
    fn streams_left_open_are_flagged_truncated() {
        let (sender, receiver) = mpsc::channel();
        sender
            .send(ReaderEvent::Data(Stream::Stdout, b"partial".to_vec()))
            .unwrap();
        sender.send(ReaderEvent::Closed(Stream::Stderr, Ok(false))).unwrap();

        let started = Instant::now();
        let captured =
            collect_streams(&receiver, 2, Instant::now() + Duration::from_millis(50)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(captured.stdout.bytes, b"partial");
        assert!(captured.stdout.truncated);
        assert!(!captured.stderr.truncated);
        drop(sender);
    }

    #[test]
    fn capture_cap_truncates_and_flags() {
        let limits = RunLimits {
            max_output_bytes: 4,
            ..RunLimits::default()
        };
        let result = sh("printf abcdefgh", &limits);
        assert_eq!(result.stdout, b"abcd");
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[test]
    fn stdin_is_closed() {
        let result = run_binary("cat", &[] as &[&str], &quick(2_000), &CancelToken::new())
            .expect("cat should spawn");
        assert_eq!(result.status, ExitStatus::Exited { code: 0 });
        assert!(result.stdout.is_empty());
    }

    #[test]
    fn cancellation_kills_the_child() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let started = Instant::now();
        let result = run_binary("/bin/sh", &["-c", "sleep 30"], &quick(60_000), &cancel)
            .expect("sh should spawn");
        assert_eq!(result.status, ExitStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run_binary(
            "/nonexistent/examgrader-binary",
            &[] as &[&str],
            &RunLimits::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn capped_reader_drains_past_cap() {
        let data = vec![7u8; 20_000];
        let mut kept = Vec::new();
        let truncated = drain_capped(&data[..], 10_000, |chunk| {
            kept.extend_from_slice(chunk);
            true
        })
        .unwrap();
        assert_eq!(kept.len(), 10_000);
        assert!(truncated);

        let mut kept = Vec::new();
        let truncated = drain_capped(&data[..], 20_000, |chunk| {
            kept.extend_from_slice(chunk);
            true
        })
        .unwrap();
        assert_eq!(kept.len(), 20_000);
        assert!(!truncated);
    }

    #[test]
    fn reader_stops_when_the_sink_goes_away() {
        let data = vec![1u8; 40_000];
        let mut calls = 0;
        let truncated = drain_capped(&data[..], usize::MAX, |_| {
            calls += 1;
            false
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert!(!truncated);
    }

    #[test]
    fn cpu_limit_backstops_the_wall_clock() {
        let limits = ChildLimits::for_limits(&quick(1_500));
        assert_eq!(limits.cpu_seconds, 3);
        let limits = ChildLimits::for_limits(&quick(2_000));
        assert_eq!(limits.cpu_seconds, 3);
    }
}
