//! Grading engine: build, run and compare each fixture, in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use examgrader_exec::{
    BuildArtifact, BuildRequest, BuildStatus, CancelToken, ExecError, ExecutionResult, RunLimits,
    Toolchain, run_binary,
};
use parking_lot::Mutex;

use crate::config::{HarnessConfig, ToolchainConfig};
use crate::diff;
use crate::fixtures::{ExpectedOutcome, FixtureDescriptor, FixtureKind, ReferenceProgram};
use crate::oracle;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, Phase};
use crate::verify::{GradedFixture, RunErrorCause, Verdict};

/// Subdirectory of the build root for reference programs. Sanitized fixture ids only use `_`
/// to start a hex escape, so no fixture directory can take this name.
const REFERENCE_BUILD_DIR: &str = "_reference";

/// Grades fixtures; one instance is shared by every worker of a run.
pub struct Grader {
    toolchain_config: ToolchainConfig,
    toolchain: Toolchain,
    /// Reference programs build under their own root so they never share a fixture's directory.
    reference_toolchain: Toolchain,
    limits: RunLimits,
    workers: usize,
    keep_artifacts: bool,
    cancel: CancelToken,
    log: Option<Arc<LogEmitter>>,
}

impl Grader {
    #[must_use]
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            toolchain_config: config.toolchain.clone(),
            toolchain: Toolchain::new(&config.build_root).with_timeout(config.build_timeout()),
            reference_toolchain: Toolchain::new(config.build_root.join(REFERENCE_BUILD_DIR))
                .with_timeout(config.build_timeout()),
            limits: config.run_limits(),
            workers: config.workers(),
            keep_artifacts: config.keep_artifacts,
            cancel: CancelToken::new(),
            log: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: Arc<LogEmitter>) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Grade every fixture and return one result per fixture, ordered by id.
    ///
    /// Fixtures still queued when cancellation is observed are graded
    /// `RunError(Cancelled)` without being built.
    pub fn grade_all(&self, fixtures: &[FixtureDescriptor]) -> Vec<GradedFixture> {
        let workers = self.workers.min(fixtures.len()).max(1);
        self.log_entry(
            LogEntry::new("", LogLevel::Info, "grade_start").with_details(serde_json::json!({
                "fixtures": fixtures.len(),
                "workers": workers,
            })),
        );

        let queue = Mutex::new(fixtures.iter());
        let results = Mutex::new(Vec::with_capacity(fixtures.len()));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let next = queue.lock().next();
                        let Some(fixture) = next else { break };
                        let graded = self.grade_fixture(fixture);
                        results.lock().push(graded);
                    }
                });
            }
        });

        let mut results = results.into_inner();
        results.sort_by(|a, b| a.fixture_id.cmp(&b.fixture_id));
        self.log_entry(
            LogEntry::new("", LogLevel::Info, "grade_finished").with_details(serde_json::json!({
                "graded": results.len(),
                "passed": results.iter().filter(|r| r.verdict.is_pass()).count(),
            })),
        );
        results
    }

    /// Build, run and compare one fixture. Never fails: every problem becomes the verdict.
    pub fn grade_fixture(&self, fixture: &FixtureDescriptor) -> GradedFixture {
        let started = Instant::now();
        let graded = if self.cancel.is_cancelled() {
            GradedFixture::new(&fixture.id, fixture.kind, cancelled())
        } else {
            self.build_and_run(fixture)
        };

        let level = if graded.verdict.is_pass() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let mut entry = LogEntry::new("", level, "fixture_graded")
            .with_fixture(&fixture.id)
            .with_phase(Phase::Compare)
            .with_outcome(Outcome::of(&graded.verdict))
            .with_duration_ms(elapsed_ms(started));
        if !graded.verdict.is_pass() {
            entry = entry.with_details(serde_json::json!({ "detail": graded.verdict.detail() }));
        }
        self.log_entry(entry);
        graded
    }

    fn build_and_run(&self, fixture: &FixtureDescriptor) -> GradedFixture {
        let artifact = match self.build(fixture, &fixture.sources, false) {
            Ok(artifact) => artifact,
            Err(err) => return harness_error(fixture, err.to_string()),
        };

        let graded = match artifact.status() {
            BuildStatus::Succeeded => self.run_and_compare(fixture, &artifact),
            BuildStatus::Failed => GradedFixture::new(
                &fixture.id,
                fixture.kind,
                Verdict::BuildError {
                    diagnostics: artifact.diagnostics().to_string(),
                },
            ),
            BuildStatus::Cancelled => GradedFixture::new(&fixture.id, fixture.kind, cancelled()),
        };
        self.cleanup(fixture, &artifact);
        graded
    }

    /// Compile `sources` with the fixture's compiler, flags and framework link flags.
    fn build(
        &self,
        fixture: &FixtureDescriptor,
        sources: &[PathBuf],
        reference: bool,
    ) -> Result<BuildArtifact, ExecError> {
        let toolchain = if reference {
            &self.reference_toolchain
        } else {
            &self.toolchain
        };
        let flags: Vec<String> = self
            .toolchain_config
            .default_flags
            .iter()
            .chain(&fixture.flags)
            .cloned()
            .collect();
        let request = BuildRequest {
            fixture_id: &fixture.id,
            compiler: self.compiler_for(fixture),
            flags: &flags,
            sources,
            link_flags: fixture.link_flags(),
        };

        let started = Instant::now();
        let artifact = toolchain.build(&request, &self.cancel)?;
        self.log_entry(
            LogEntry::new("", LogLevel::Debug, "build_finished")
                .with_fixture(&fixture.id)
                .with_phase(Phase::Build)
                .with_duration_ms(elapsed_ms(started))
                .with_fingerprint(artifact.fingerprint())
                .with_details(serde_json::json!({
                    "command": artifact.command_line(),
                    "succeeded": artifact.is_success(),
                    "reference": reference,
                })),
        );
        Ok(artifact)
    }

    /// Build the reference program next to the submission. Any outcome but a usable
    /// executable is the fixture's verdict.
    fn build_reference(
        &self,
        fixture: &FixtureDescriptor,
        reference: &ReferenceProgram,
    ) -> Result<BuildArtifact, Verdict> {
        let artifact = self
            .build(fixture, &reference.sources, true)
            .map_err(|err| reference_error(err.to_string()))?;
        let verdict = match artifact.status() {
            BuildStatus::Succeeded if artifact.executable().is_some() => return Ok(artifact),
            BuildStatus::Succeeded => reference_error("build produced no executable".to_string()),
            BuildStatus::Failed => reference_error(format!(
                "build failed: {}",
                artifact
                    .diagnostics()
                    .lines()
                    .find(|line| !line.trim().is_empty())
                    .unwrap_or("toolchain failed")
            )),
            BuildStatus::Cancelled => cancelled(),
        };
        self.cleanup(fixture, &artifact);
        Err(verdict)
    }

    /// Run every invocation in order; the first one that does not pass decides the verdict.
    fn run_and_compare(
        &self,
        fixture: &FixtureDescriptor,
        artifact: &BuildArtifact,
    ) -> GradedFixture {
        let Some(executable) = artifact.executable() else {
            return harness_error(fixture, "build succeeded without an executable".to_string());
        };
        let reference = match &fixture.expected {
            ExpectedOutcome::ReferenceProgram(reference) => {
                match self.build_reference(fixture, reference) {
                    Ok(built) => Some(built),
                    Err(verdict) => return GradedFixture::new(&fixture.id, fixture.kind, verdict),
                }
            }
            ExpectedOutcome::ExactBytes(_) | ExpectedOutcome::CaseResults(_) => None,
        };

        let mut graded = None;
        for args in fixture.invocations() {
            let current = self.run_once(fixture, artifact, executable, reference.as_ref(), args);
            let passed = current.verdict.is_pass();
            graded = Some(current);
            if !passed {
                break;
            }
        }

        if let Some(reference) = &reference {
            self.cleanup(fixture, reference);
        }
        graded.unwrap_or_else(|| {
            harness_error(fixture, "fixture defines no invocation".to_string())
        })
    }

    /// Run one argument vector and grade it.
    fn run_once(
        &self,
        fixture: &FixtureDescriptor,
        artifact: &BuildArtifact,
        executable: &Path,
        reference: Option<&BuildArtifact>,
        args: &[String],
    ) -> GradedFixture {
        let run = match run_binary(executable, args, &self.limits, &self.cancel) {
            Ok(run) => run,
            Err(err) => return harness_error(fixture, err.to_string()),
        };
        self.log_run(fixture, artifact, args, &run);

        let (comparison, expected_bytes) = match (reference, &fixture.expected) {
            (Some(reference), _) => {
                let Some(reference_executable) = reference.executable() else {
                    return GradedFixture::new(
                        &fixture.id,
                        fixture.kind,
                        reference_error("build produced no executable".to_string()),
                    );
                };
                let reference_run =
                    match run_binary(reference_executable, args, &self.limits, &self.cancel) {
                        Ok(run) => run,
                        Err(err) => {
                            return GradedFixture::new(
                                &fixture.id,
                                fixture.kind,
                                reference_error(err.to_string()),
                            );
                        }
                    };
                self.log_run(fixture, reference, args, &reference_run);
                (
                    oracle::compare_with_reference(&reference_run, &run, &self.limits),
                    Some(oracle::reference_expectation(&reference_run)),
                )
            }
            (None, ExpectedOutcome::ExactBytes(exact)) => (
                oracle::compare(&fixture.expected, &run, &self.limits),
                Some(exact.clone()),
            ),
            (None, _) => (oracle::compare(&fixture.expected, &run, &self.limits), None),
        };

        let mut graded = GradedFixture::new(&fixture.id, fixture.kind, comparison.verdict);
        graded.cases = comparison.cases;
        if let (Verdict::Fail { .. }, Some(exact)) = (&graded.verdict, &expected_bytes) {
            graded.trace = Some(diff::render_trace(args, exact, &run));
        }
        graded
    }

    fn cleanup(&self, fixture: &FixtureDescriptor, artifact: &BuildArtifact) {
        if self.keep_artifacts {
            return;
        }
        if let Err(err) = artifact.cleanup() {
            self.log_entry(
                LogEntry::new("", LogLevel::Warn, "cleanup_failed")
                    .with_fixture(&fixture.id)
                    .with_phase(Phase::Build)
                    .with_details(serde_json::json!({ "error": err.to_string() })),
            );
        }
    }

    fn compiler_for<'a>(&'a self, fixture: &'a FixtureDescriptor) -> &'a str {
        if let Some(compiler) = &fixture.compiler {
            return compiler;
        }
        match fixture.kind {
            FixtureKind::StandaloneProgram => self.toolchain_config.c_compiler.as_str(),
            FixtureKind::UnitTestSuite => fixture
                .framework
                .as_ref()
                .and_then(|framework| framework.compiler.as_deref())
                .unwrap_or(self.toolchain_config.cxx_compiler.as_str()),
        }
    }

    fn log_run(
        &self,
        fixture: &FixtureDescriptor,
        artifact: &BuildArtifact,
        args: &[String],
        run: &ExecutionResult,
    ) {
        let mut entry = LogEntry::new("", LogLevel::Debug, "run_finished")
            .with_fixture(&fixture.id)
            .with_phase(Phase::Run)
            .with_duration_ms(u64::try_from(run.duration.as_millis()).unwrap_or(u64::MAX))
            .with_artifacts(
                artifact
                    .executable()
                    .map(|path| vec![path.display().to_string()])
                    .unwrap_or_default(),
            )
            .with_details(serde_json::json!({
                "args": args,
                "status": run.status.to_string(),
                "stdout_bytes": run.stdout.len(),
                "stderr_bytes": run.stderr.len(),
                "stdout_truncated": run.stdout_truncated,
                "stderr_truncated": run.stderr_truncated,
            }));
        if let Some(code) = run.status.code() {
            entry = entry.with_exit_code(code);
        }
        if let Some(signal) = run.status.signal() {
            entry = entry.with_signal(signal);
        }
        self.log_entry(entry);
    }

    fn log_entry(&self, entry: LogEntry) {
        if let Some(log) = &self.log {
            log.emit_entry(entry);
        }
    }
}

fn harness_error(fixture: &FixtureDescriptor, message: String) -> GradedFixture {
    GradedFixture::new(
        &fixture.id,
        fixture.kind,
        Verdict::RunError {
            cause: RunErrorCause::Harness { message },
        },
    )
}

fn reference_error(message: String) -> Verdict {
    Verdict::RunError {
        cause: RunErrorCause::Reference { message },
    }
}

fn cancelled() -> Verdict {
    Verdict::RunError {
        cause: RunErrorCause::Cancelled,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
