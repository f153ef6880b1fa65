//! External toolchain invocation.
//!
//! One fixture, one private output directory under the build root, keyed by the fixture
//! id. Builds therefore share no mutable state and may run in parallel.
//!
//! Command shape: `<compiler> -o <out> <flags...> <sources...> <link_flags...>`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::ExecError;
use crate::process::{ExitStatus, RunLimits, run_binary};

pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(120);

/// Inputs for one build.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub fixture_id: &'a str,
    pub compiler: &'a str,
    pub flags: &'a [String],
    /// Link order is source order.
    pub sources: &'a [PathBuf],
    /// Appended after the sources (test-framework runtime, `-l`/`-L` only).
    pub link_flags: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Handle to one build's outcome. Owns the fixture's output directory until
/// [`BuildArtifact::cleanup`] is called.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    fixture_id: String,
    output_dir: PathBuf,
    executable: Option<PathBuf>,
    status: BuildStatus,
    diagnostics: String,
    fingerprint: String,
    command: Vec<String>,
}

impl BuildArtifact {
    #[must_use]
    pub fn fixture_id(&self) -> &str {
        &self.fixture_id
    }

    #[must_use]
    pub fn status(&self) -> BuildStatus {
        self.status
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }

    /// The produced executable; `None` unless the build succeeded.
    #[must_use]
    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    /// Toolchain output, verbatim apart from lossy decoding. Warnings on success, errors on
    /// failure.
    #[must_use]
    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    /// blake3 over compiler, arguments and source contents.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Remove the fixture's output directory.
    pub fn cleanup(&self) -> Result<(), ExecError> {
        match std::fs::remove_dir_all(&self.output_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ExecError::Io {
                path: self.output_dir.clone(),
                source,
            }),
        }
    }
}

/// Builder bound to a build root.
#[derive(Debug, Clone)]
pub struct Toolchain {
    build_root: PathBuf,
    limits: RunLimits,
}

impl Toolchain {
    #[must_use]
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            limits: RunLimits {
                timeout: DEFAULT_BUILD_TIMEOUT,
                ..RunLimits::default()
            },
        }
    }

    /// Wall-clock bound for one compiler invocation.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = timeout;
        self
    }

    #[must_use]
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// Private output directory for a fixture id.
    #[must_use]
    pub fn output_dir_for(&self, fixture_id: &str) -> PathBuf {
        self.build_root.join(sanitize_id(fixture_id))
    }

    /// Build one fixture.
    ///
    /// Toolchain failures of every kind (nonzero exit, missing compiler, killed compiler,
    /// missing output) come back as a [`BuildStatus::Failed`] artifact carrying diagnostics.
    /// `Err` is reserved for not being able to prepare the output directory.
    pub fn build(
        &self,
        request: &BuildRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<BuildArtifact, ExecError> {
        let output_dir = self.output_dir_for(request.fixture_id);
        reset_dir(&output_dir)?;
        let executable = output_dir.join(sanitize_id(request.fixture_id));

        let args = command_args(request, &executable);
        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(request.compiler.to_string());
        command.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));

        let mut artifact = BuildArtifact {
            fixture_id: request.fixture_id.to_string(),
            output_dir,
            executable: None,
            status: BuildStatus::Failed,
            diagnostics: String::new(),
            fingerprint: fingerprint(request),
            command,
        };

        let run = match run_binary(request.compiler, &args, &self.limits, cancel) {
            Ok(run) => run,
            Err(ExecError::Spawn { program, source }) => {
                artifact.diagnostics = format!("failed to spawn toolchain '{program}': {source}");
                return Ok(artifact);
            }
            Err(err) => return Err(err),
        };

        let mut diagnostics = String::from_utf8_lossy(&run.stderr).into_owned();
        diagnostics.push_str(&String::from_utf8_lossy(&run.stdout));

        match run.status {
            ExitStatus::Exited { code: 0 } if executable.is_file() => {
                artifact.status = BuildStatus::Succeeded;
                artifact.executable = Some(executable);
            }
            ExitStatus::Exited { code: 0 } => {
                diagnostics.push_str(&format!(
                    "toolchain exited 0 but produced no executable at {}\n",
                    executable.display()
                ));
            }
            ExitStatus::Exited { code } => {
                if diagnostics.is_empty() {
                    diagnostics = format!("toolchain exited with code {code}\n");
                }
            }
            ExitStatus::Crashed { .. } => {
                diagnostics.push_str(&format!("toolchain {}\n", run.status));
            }
            ExitStatus::Timeout => {
                diagnostics.push_str(&format!(
                    "toolchain timed out after {} ms\n",
                    self.limits.timeout.as_millis()
                ));
            }
            ExitStatus::Cancelled => artifact.status = BuildStatus::Cancelled,
        }
        artifact.diagnostics = diagnostics;
        Ok(artifact)
    }
}

fn command_args(request: &BuildRequest<'_>, executable: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    args.push("-o".into());
    args.push(executable.as_os_str().to_owned());
    args.extend(request.flags.iter().map(OsString::from));
    args.extend(request.sources.iter().map(|p| p.as_os_str().to_owned()));
    args.extend(request.link_flags.iter().map(OsString::from));
    args
}

fn reset_dir(dir: &Path) -> Result<(), ExecError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ExecError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    }
    std::fs::create_dir_all(dir).map_err(|source| ExecError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// Map a fixture id onto a single path component, injectively.
///
/// `[A-Za-z0-9.-]` bytes pass through; every other byte (`_` and `/` included) becomes
/// `_xx`, its lowercase hex value. `_` therefore only ever starts an escape, so distinct ids
/// never share a directory. A leading `.` is escaped too so ids cannot name `.` or `..`.
#[must_use]
pub fn sanitize_id(id: &str) -> String {
    if id.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(id.len());
    for (index, byte) in id.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && index > 0);
        if plain {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

fn fingerprint(request: &BuildRequest<'_>) -> String {
    let mut hasher = blake3::Hasher::new();
    let parts = std::iter::once(request.compiler)
        .chain(request.flags.iter().map(String::as_str))
        .chain(std::iter::once("--"))
        .chain(request.link_flags.iter().map(String::as_str));
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    for source in request.sources {
        match std::fs::read(source) {
            Ok(bytes) => {
                hasher.update(&(bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
            Err(_) => {
                hasher.update(b"<unreadable>");
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("examgrader-{name}-{}-{nanos}", std::process::id()))
    }

    fn request<'a>(compiler: &'a str, sources: &'a [PathBuf]) -> BuildRequest<'a> {
        BuildRequest {
            fixture_id: "group/hello_world",
            compiler,
            flags: &[],
            sources,
            link_flags: &[],
        }
    }

    #[test]
    fn sanitize_keeps_ids_inside_one_component() {
        assert_eq!(sanitize_id("hello-world.v2"), "hello-world.v2");
        assert_eq!(sanitize_id("group/has_a"), "group_2fhas_5fa");
        assert_eq!(sanitize_id("../escape"), "_2e._2fescape");
        assert_eq!(sanitize_id("a b"), "a_20b");
        assert_eq!(sanitize_id("caf\u{e9}"), "caf_c3_a9");
        assert_eq!(sanitize_id(""), "_");
    }

    #[test]
    fn sanitize_never_merges_distinct_ids() {
        let ids = ["a/b", "a__b", "a_2fb", "a b", "a_b", "a_20b", ".a", "_2ea", "", "_"];
        let mapped: std::collections::BTreeSet<String> =
            ids.iter().map(|id| sanitize_id(id)).collect();
        assert_eq!(mapped.len(), ids.len());
        for id in ids {
            assert!(!sanitize_id(id).contains('/'));
        }
    }

    #[test]
    fn nonzero_toolchain_exit_is_a_failed_build() {
        let root = scratch("false");
        let toolchain = Toolchain::new(&root);
        let artifact = toolchain
            .build(&request("false", &[]), &CancelToken::new())
            .unwrap();
        assert_eq!(artifact.status(), BuildStatus::Failed);
        assert!(artifact.executable().is_none());
        assert!(artifact.diagnostics().contains("exited with code 1"));
        artifact.cleanup().unwrap();
        assert!(!artifact.output_dir().exists());
    }

    #[test]
    fn success_without_output_is_a_failed_build() {
        let root = scratch("true");
        let artifact = Toolchain::new(&root)
            .build(&request("true", &[]), &CancelToken::new())
            .unwrap();
        assert_eq!(artifact.status(), BuildStatus::Failed);
        assert!(artifact.diagnostics().contains("produced no executable"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn missing_toolchain_is_a_failed_build() {
        let root = scratch("missing");
        let artifact = Toolchain::new(&root)
            .build(
                &request("/nonexistent/examgrader-cc", &[]),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(artifact.status(), BuildStatus::Failed);
        assert!(artifact.diagnostics().starts_with("failed to spawn toolchain"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn output_dirs_are_private_per_fixture() {
        let toolchain = Toolchain::new("/tmp/build");
        assert_eq!(
            toolchain.output_dir_for("a/b"),
            PathBuf::from("/tmp/build/a_2fb")
        );
        assert_ne!(toolchain.output_dir_for("a/b"), toolchain.output_dir_for("a__b"));
        assert_ne!(toolchain.output_dir_for("a b"), toolchain.output_dir_for("a_b"));
        assert_ne!(
            toolchain.output_dir_for("has_a"),
            toolchain.output_dir_for("hello_world")
        );
    }

    #[test]
    fn command_preserves_source_order_and_appends_link_flags() {
        let sources = vec![PathBuf::from("main.c"), PathBuf::from("hello_world.c")];
        let flags = vec!["-Wall".to_string()];
        let link = vec!["-lgtest".to_string()];
        let req = BuildRequest {
            fixture_id: "x",
            compiler: "cc",
            flags: &flags,
            sources: &sources,
            link_flags: &link,
        };
        let args = command_args(&req, Path::new("/out/x"));
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            ["-o", "/out/x", "-Wall", "main.c", "hello_world.c", "-lgtest"]
        );
    }

    #[test]
    fn fingerprint_tracks_flags_and_sources() {
        let dir = scratch("fp");
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("a.c");
        std::fs::write(&src, "int main(void){return 0;}\n").unwrap();
        let sources = vec![src.clone()];
        let base = request("cc", &sources);

        let first = fingerprint(&base);
        assert_eq!(first, fingerprint(&base));

        let flags = vec!["-O2".to_string()];
        let flagged = BuildRequest {
            flags: &flags,
            ..base
        };
        assert_ne!(first, fingerprint(&flagged));

        std::fs::write(&src, "int main(void){return 1;}\n").unwrap();
        assert_ne!(first, fingerprint(&base));
        let _ = std::fs::remove_dir_all(dir);
    }
}
