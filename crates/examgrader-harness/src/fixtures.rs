//! Fixture descriptors and corpus loading.
//!
//! A corpus is a directory tree; every directory holding a `fixture.json` is one fixture.
//! The fixture id is that directory's path relative to the corpus root, `/`-separated, so
//! ids are stable across machines and never written inside the descriptor itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::frameworks::{FrameworkRegistry, FrameworkSpec};

pub const DESCRIPTOR_FILE: &str = "fixture.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureKind {
    StandaloneProgram,
    UnitTestSuite,
}

impl FixtureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StandaloneProgram => "standalone_program",
            Self::UnitTestSuite => "unit_test_suite",
        }
    }
}

/// Where an oracle byte sequence comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteSource {
    /// JSON string; `\u0000` is a NUL byte like any other.
    Text(String),
    Hex(String),
    /// Raw file contents, relative to the fixture directory.
    File(PathBuf),
}

impl ByteSource {
    fn resolve(&self, fixture_id: &str, dir: &Path) -> Result<Vec<u8>, HarnessError> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Hex(hex) => decode_hex(hex)
                .map_err(|msg| HarnessError::invalid(fixture_id, format!("expected bytes: {msg}"))),
            Self::File(rel) => {
                let path = dir.join(rel);
                std::fs::read(&path).map_err(|e| {
                    HarnessError::invalid(
                        fixture_id,
                        format!("expected bytes file {}: {e}", rel.display()),
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseExpectation {
    Pass,
    Fail,
}

impl CaseExpectation {
    #[must_use]
    pub fn from_passed(passed: bool) -> Self {
        if passed { Self::Pass } else { Self::Fail }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactBytes {
    pub stdout: Vec<u8>,
    /// `None` means stderr is not graded.
    pub stderr: Option<Vec<u8>>,
    /// `None` means the exit code is not graded.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseResults {
    pub cases: BTreeMap<String, CaseExpectation>,
    pub exit_code: Option<i32>,
}

/// A known-good program built with the same toolchain and run over the same arguments.
/// Its stdout, stderr and exit code are the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceProgram {
    /// Resolved against the fixture directory.
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedOutcome {
    ExactBytes(ExactBytes),
    CaseResults(CaseResults),
    ReferenceProgram(ReferenceProgram),
}

/// One loaded, validated fixture.
#[derive(Debug, Clone)]
pub struct FixtureDescriptor {
    pub id: String,
    pub kind: FixtureKind,
    pub dir: PathBuf,
    /// Resolved against `dir`; order is link order.
    pub sources: Vec<PathBuf>,
    pub compiler: Option<String>,
    pub flags: Vec<String>,
    pub framework: Option<FrameworkSpec>,
    /// `None` runs the kind's default invocation; `Some(vec![])` runs with no arguments.
    pub args: Option<Vec<String>>,
    /// Several argument vectors, each run and compared in order. Excludes `args`.
    pub arg_sets: Option<Vec<Vec<String>>>,
    pub expected: ExpectedOutcome,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    kind: FixtureKind,
    sources: Vec<PathBuf>,
    #[serde(default)]
    compiler: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    framework: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    arg_sets: Option<Vec<Vec<String>>>,
    expected: RawExpected,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawExpected {
    ExactBytes {
        stdout: ByteSource,
        #[serde(default)]
        stderr: Option<ByteSource>,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    CaseResults {
        cases: BTreeMap<String, CaseExpectation>,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    ReferenceProgram {
        sources: Vec<PathBuf>,
    },
}

impl FixtureDescriptor {
    /// Parse and validate a descriptor whose sources live under `dir`.
    pub fn from_json(
        id: &str,
        dir: &Path,
        json: &str,
        registry: &FrameworkRegistry,
    ) -> Result<Self, HarnessError> {
        let raw: RawDescriptor = serde_json::from_str(json)
            .map_err(|e| HarnessError::invalid(id, format!("malformed descriptor: {e}")))?;

        if raw.sources.is_empty() {
            return Err(HarnessError::invalid(id, "no sources listed"));
        }
        let sources = resolve_sources(id, dir, &raw.sources, "source")?;

        let framework = match (raw.kind, raw.framework.as_deref()) {
            (FixtureKind::UnitTestSuite, None) => {
                return Err(HarnessError::invalid(id, "unit_test_suite requires a framework"));
            }
            (FixtureKind::UnitTestSuite, Some(name)) => match registry.get(name) {
                Some(spec) => Some(spec.clone()),
                None => {
                    return Err(HarnessError::invalid(
                        id,
                        format!("unknown framework '{name}'"),
                    ));
                }
            },
            (FixtureKind::StandaloneProgram, Some(name)) => {
                return Err(HarnessError::invalid(
                    id,
                    format!("standalone_program cannot link framework '{name}'"),
                ));
            }
            (FixtureKind::StandaloneProgram, None) => None,
        };

        let expected = match (raw.kind, raw.expected) {
            (
                FixtureKind::StandaloneProgram,
                RawExpected::ExactBytes {
                    stdout,
                    stderr,
                    exit_code,
                },
            ) => ExpectedOutcome::ExactBytes(ExactBytes {
                stdout: stdout.resolve(id, dir)?,
                stderr: stderr.map(|s| s.resolve(id, dir)).transpose()?,
                exit_code,
            }),
            (FixtureKind::UnitTestSuite, RawExpected::CaseResults { cases, exit_code }) => {
                if cases.is_empty() {
                    return Err(HarnessError::invalid(id, "case_results lists no cases"));
                }
                ExpectedOutcome::CaseResults(CaseResults { cases, exit_code })
            }
            (FixtureKind::StandaloneProgram, RawExpected::ReferenceProgram { sources }) => {
                if sources.is_empty() {
                    return Err(HarnessError::invalid(id, "reference_program lists no sources"));
                }
                ExpectedOutcome::ReferenceProgram(ReferenceProgram {
                    sources: resolve_sources(id, dir, &sources, "reference source")?,
                })
            }
            (FixtureKind::StandaloneProgram, RawExpected::CaseResults { .. }) => {
                return Err(HarnessError::invalid(
                    id,
                    "standalone_program requires an exact_bytes or reference_program expectation",
                ));
            }
            (
                FixtureKind::UnitTestSuite,
                RawExpected::ExactBytes { .. } | RawExpected::ReferenceProgram { .. },
            ) => {
                return Err(HarnessError::invalid(
                    id,
                    "unit_test_suite requires a case_results expectation",
                ));
            }
        };

        match (&raw.args, &raw.arg_sets, raw.kind) {
            (_, None, _) => {}
            (Some(_), Some(_), _) => {
                return Err(HarnessError::invalid(id, "args and arg_sets are mutually exclusive"));
            }
            (None, Some(_), FixtureKind::UnitTestSuite) => {
                return Err(HarnessError::invalid(
                    id,
                    "arg_sets applies to standalone_program only",
                ));
            }
            (None, Some(sets), FixtureKind::StandaloneProgram) if sets.is_empty() => {
                return Err(HarnessError::invalid(id, "arg_sets lists no argument sets"));
            }
            (None, Some(_), FixtureKind::StandaloneProgram) => {}
        }

        Ok(Self {
            id: id.to_string(),
            kind: raw.kind,
            dir: dir.to_path_buf(),
            sources,
            compiler: raw.compiler,
            flags: raw.flags,
            framework,
            args: raw.args,
            arg_sets: raw.arg_sets,
            expected,
        })
    }

    /// Load `<dir>/fixture.json`.
    pub fn load(id: &str, dir: &Path, registry: &FrameworkRegistry) -> Result<Self, HarnessError> {
        let path = dir.join(DESCRIPTOR_FILE);
        let json = std::fs::read_to_string(&path).map_err(|e| HarnessError::io(&path, e))?;
        Self::from_json(id, dir, &json, registry)
    }

    /// Program arguments for the run step.
    #[must_use]
    pub fn invocation_args(&self) -> &[String] {
        match (&self.args, &self.framework) {
            (Some(args), _) => args,
            (None, Some(framework)) => &framework.default_args,
            (None, None) => &[],
        }
    }

    /// Every argument vector the fixture runs with, in order. Never empty.
    #[must_use]
    pub fn invocations(&self) -> Vec<&[String]> {
        match &self.arg_sets {
            Some(sets) => sets.iter().map(Vec::as_slice).collect(),
            None => vec![self.invocation_args()],
        }
    }

    #[must_use]
    pub fn link_flags(&self) -> &[String] {
        self.framework
            .as_ref()
            .map_or(&[], |framework| framework.link_flags.as_slice())
    }
}

fn resolve_sources(
    id: &str,
    dir: &Path,
    listed: &[PathBuf],
    what: &str,
) -> Result<Vec<PathBuf>, HarnessError> {
    let mut sources = Vec::with_capacity(listed.len());
    for rel in listed {
        let path = dir.join(rel);
        if !path.is_file() {
            return Err(HarnessError::invalid(
                id,
                format!("{what} {} does not exist", rel.display()),
            ));
        }
        sources.push(path);
    }
    Ok(sources)
}

/// A descriptor that failed validation. It gets no verdict but is always reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedFixture {
    pub fixture_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Corpus {
    pub root: PathBuf,
    /// Sorted by id.
    pub fixtures: Vec<FixtureDescriptor>,
    /// Sorted by id.
    pub rejected: Vec<RejectedFixture>,
}

/// Walk `root` and load every fixture below it.
///
/// Only an unreadable corpus root is an `Err`; a bad descriptor lands in
/// [`Corpus::rejected`] and loading continues.
pub fn load_corpus(root: &Path, registry: &FrameworkRegistry) -> Result<Corpus, HarnessError> {
    let mut dirs = Vec::new();
    collect_fixture_dirs(root, root, &mut dirs)?;

    let mut fixtures = Vec::new();
    let mut rejected = Vec::new();
    for (id, dir) in dirs {
        match FixtureDescriptor::load(&id, &dir, registry) {
            Ok(fixture) => fixtures.push(fixture),
            Err(err) => rejected.push(RejectedFixture {
                reason: match err {
                    HarnessError::InvalidDescriptor { message, .. } => message,
                    other => other.to_string(),
                },
                fixture_id: id,
            }),
        }
    }
    fixtures.sort_by(|a, b| a.id.cmp(&b.id));
    rejected.sort_by(|a, b| a.fixture_id.cmp(&b.fixture_id));

    Ok(Corpus {
        root: root.to_path_buf(),
        fixtures,
        rejected,
    })
}

fn collect_fixture_dirs(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), HarnessError> {
    if dir.join(DESCRIPTOR_FILE).is_file() {
        out.push((fixture_id(root, dir), dir.to_path_buf()));
        return Ok(());
    }
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| HarnessError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_dir())
        .collect();
    children.sort();
    for child in children {
        collect_fixture_dirs(root, &child, out)?;
    }
    Ok(())
}

fn fixture_id(root: &Path, dir: &Path) -> String {
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return root
            .file_name()
            .map_or_else(|| ".".to_string(), |name| name.to_string_lossy().into_owned());
    }
    parts.join("/")
}

/// Decode a hex string; ASCII whitespace between digit pairs is ignored.
pub fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", digits.len()));
    }
    digits
        .chunks_exact(2)
        .map(|pair| -> Result<u8, String> { Ok((nibble(pair[0])? << 4) | nibble(pair[1])?) })
        .collect()
}

fn nibble(digit: u8) -> Result<u8, String> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        other => Err(format!("invalid hex digit '{}'", char::from(other))),
    }
}
