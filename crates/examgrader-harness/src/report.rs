//! Report generation for grading results.
//!
//! Reports carry no durations and no implicit timestamp, so grading an unchanged corpus
//! twice renders byte-identical output.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::fixtures::{CaseExpectation, FixtureDescriptor, RejectedFixture};
use crate::verify::{CaseStatus, GradeSummary, GradedFixture, Verdict};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeReport {
    pub title: String,
    /// Caller-supplied; never filled in from the clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub summary: GradeSummary,
    #[serde(default)]
    pub rejected: Vec<RejectedFixture>,
}

impl GradeReport {
    /// Assemble a report, checking that every loaded fixture has exactly one result.
    pub fn assemble(
        title: impl Into<String>,
        timestamp: Option<String>,
        fixtures: &[FixtureDescriptor],
        results: Vec<GradedFixture>,
        rejected: Vec<RejectedFixture>,
    ) -> Result<Self, HarnessError> {
        let mut seen = BTreeSet::new();
        for result in &results {
            if !seen.insert(result.fixture_id.as_str()) {
                return Err(HarnessError::Report(format!(
                    "fixture '{}' has more than one verdict",
                    result.fixture_id
                )));
            }
        }
        let loaded: BTreeSet<&str> = fixtures.iter().map(|f| f.id.as_str()).collect();
        if let Some(missing) = loaded.difference(&seen).next() {
            return Err(HarnessError::Report(format!(
                "fixture '{missing}' has no verdict"
            )));
        }
        if let Some(extra) = seen.difference(&loaded).next() {
            return Err(HarnessError::Report(format!(
                "verdict for unknown fixture '{extra}'"
            )));
        }

        let mut rejected = rejected;
        rejected.sort_by(|a, b| a.fixture_id.cmp(&b.fixture_id));
        Ok(Self {
            title: title.into(),
            timestamp,
            summary: GradeSummary::from_results(results),
            rejected,
        })
    }

    /// Every fixture passed and nothing was rejected.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.summary.all_passed() && self.rejected.is_empty()
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let summary = &self.summary;
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        if let Some(timestamp) = &self.timestamp {
            out.push_str(&format!("- Timestamp: {timestamp}\n"));
        }
        out.push_str(&format!("- Total: {}\n", summary.total));
        out.push_str(&format!("- Passed: {}\n", summary.passed));
        out.push_str(&format!("- Failed: {}\n", summary.failed));
        out.push_str(&format!("- Build errors: {}\n", summary.build_errors));
        out.push_str(&format!("- Run errors: {}\n", summary.run_errors));
        out.push_str(&format!("- Rejected descriptors: {}\n\n", self.rejected.len()));

        out.push_str("| Fixture | Kind | Verdict | Detail |\n");
        out.push_str("|---------|------|---------|--------|\n");
        for r in &summary.results {
            let mut detail = table_cell(&r.verdict.detail());
            if r.environment_sensitive {
                detail.push_str(" (environment-sensitive)");
            }
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                r.fixture_id,
                r.kind.as_str(),
                r.verdict.label(),
                detail
            ));
        }

        for r in summary.results.iter().filter(|r| !r.verdict.is_pass()) {
            out.push_str(&format!("\n## {}\n\n", r.fixture_id));
            if let Verdict::BuildError { diagnostics } = &r.verdict {
                out.push_str("```text\n");
                out.push_str(diagnostics);
                if !diagnostics.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("```\n");
            }
            if !r.cases.is_empty() {
                out.push_str("| Case | Expected | Actual | Status |\n");
                out.push_str("|------|----------|--------|--------|\n");
                for case in &r.cases {
                    out.push_str(&format!(
                        "| {} | {} | {} | {} |\n",
                        case.name,
                        expectation(case.expected),
                        expectation(case.actual),
                        case_status(case.status),
                    ));
                }
            }
            if let Some(trace) = &r.trace {
                out.push_str("```text\n");
                out.push_str(trace);
                out.push_str("```\n");
            }
            if matches!(r.verdict, Verdict::RunError { .. } | Verdict::Fail { .. })
                && r.cases.is_empty()
                && r.trace.is_none()
            {
                out.push_str(&format!("{}\n", r.verdict.detail()));
            }
        }

        if !self.rejected.is_empty() {
            out.push_str("\n## Rejected descriptors\n\n");
            for rejected in &self.rejected {
                out.push_str(&format!("- {}: {}\n", rejected.fixture_id, rejected.reason));
            }
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

fn table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn expectation(value: Option<CaseExpectation>) -> &'static str {
    match value {
        Some(CaseExpectation::Pass) => "pass",
        Some(CaseExpectation::Fail) => "fail",
        None => "-",
    }
}

fn case_status(status: CaseStatus) -> &'static str {
    match status {
        CaseStatus::Matched => "ok",
        CaseStatus::Mismatched => "MISMATCH",
        CaseStatus::Missing => "MISSING",
        CaseStatus::Duplicated => "DUPLICATE",
        CaseStatus::Unexpected => "unexpected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::FixtureKind;
    use crate::verify::{CaseOutcome, FailReason, RunErrorCause};

    fn graded(id: &str, verdict: Verdict) -> GradedFixture {
        GradedFixture::new(id, FixtureKind::StandaloneProgram, verdict)
    }

    fn sample() -> GradeReport {
        let mut suite = GradedFixture::new(
            "Z_incorrect_strlen",
            FixtureKind::UnitTestSuite,
            Verdict::Fail {
                reason: FailReason::CaseResults {
                    mismatched: vec!["strlen.short".into()],
                    missing: vec![],
                    duplicated: vec![],
                },
            },
        );
        suite.cases = vec![CaseOutcome {
            name: "strlen.short".into(),
            expected: Some(CaseExpectation::Fail),
            actual: Some(CaseExpectation::Pass),
            status: CaseStatus::Mismatched,
        }];
        GradeReport {
            title: "Grading Report".into(),
            timestamp: Some("2026-01-01T00:00:00Z".into()),
            summary: GradeSummary::from_results(vec![
                graded("hello_world", Verdict::Pass),
                suite,
                graded(
                    "spin",
                    Verdict::RunError {
                        cause: RunErrorCause::Timeout { limit_ms: 100 },
                    },
                ),
                graded(
                    "broken",
                    Verdict::BuildError {
                        diagnostics: "main.c:1:1: error: expected ';'".into(),
                    },
                ),
            ]),
            rejected: vec![RejectedFixture {
                fixture_id: "bad".into(),
                reason: "no sources listed".into(),
            }],
        }
    }

    #[test]
    fn markdown_lists_fixtures_in_id_order() {
        let md = sample().to_markdown();
        assert!(md.starts_with("# Grading Report\n\n- Timestamp: 2026-01-01T00:00:00Z\n"));
        let rows = ["| Z_incorrect_strlen |", "| broken |", "| hello_world |", "| spin |"];
        let order: Vec<usize> = rows
            .iter()
            .map(|row| md.find(row).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(md.contains("| strlen.short | fail | pass | MISMATCH |"));
        assert!(md.contains("timed out after 100 ms (environment-sensitive)"));
        assert!(md.contains("```text\nmain.c:1:1: error: expected ';'\n```"));
        assert!(md.contains("- bad: no sources listed"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = sample();
        let b = sample();
        assert_eq!(a.to_markdown(), b.to_markdown());
        assert_eq!(a.to_json(), b.to_json());
        let parsed: serde_json::Value = serde_json::from_str(&a.to_json()).unwrap();
        assert_eq!(parsed["summary"]["total"], 4);
        assert_eq!(parsed["summary"]["build_errors"], 1);
        assert_eq!(parsed["rejected"][0]["fixture_id"], "bad");
        assert!(!a.is_clean());
    }

    #[test]
    fn assembly_enforces_one_verdict_per_fixture() {
        let dir = std::env::temp_dir().join(format!("examgrader-report-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.c"), "").unwrap();
        let registry = crate::frameworks::FrameworkRegistry::new();
        let load = |id: &str| {
            FixtureDescriptor::from_json(
                id,
                &dir,
                r#"{"kind":"standalone_program","sources":["main.c"],"expected":{"kind":"exact_bytes","stdout":{"text":""}}}"#,
                &registry,
            )
            .unwrap()
        };
        let fixtures = vec![load("a"), load("b")];

        let missing =
            GradeReport::assemble("t", None, &fixtures, vec![graded("a", Verdict::Pass)], vec![]);
        assert!(missing.unwrap_err().to_string().contains("'b' has no verdict"));

        let doubled = GradeReport::assemble(
            "t",
            None,
            &fixtures,
            vec![
                graded("a", Verdict::Pass),
                graded("a", Verdict::Pass),
                graded("b", Verdict::Pass),
            ],
            vec![],
        );
        assert!(doubled.is_err());

        let ok = GradeReport::assemble(
            "t",
            None,
            &fixtures,
            vec![graded("b", Verdict::Pass), graded("a", Verdict::Pass)],
            vec![],
        )
        .unwrap();
        assert!(ok.is_clean());
        assert!(!ok.to_markdown().contains("Timestamp"));
    }
}
