//! googletest report parser and case-results oracle benchmarks.

use std::collections::BTreeMap;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use examgrader_exec::{ExecutionResult, ExitStatus, RunLimits};
use examgrader_harness::fixtures::{CaseExpectation, CaseResults, ExpectedOutcome};
use examgrader_harness::{gtest_report, oracle};

/// Console output for `cases` tests, every third one failing.
fn synthetic_report(cases: usize) -> Vec<u8> {
    let mut out = format!("[==========] Running {cases} tests from 1 test suite.\n");
    for i in 0..cases {
        out.push_str(&format!("[ RUN      ] suite.case_{i}\n"));
        if i % 3 == 0 {
            out.push_str("unit_test.cpp:10: Failure\nExpected equality of these values:\n");
            out.push_str(&format!("[  FAILED  ] suite.case_{i} (0 ms)\n"));
        } else {
            out.push_str(&format!("[       OK ] suite.case_{i} (0 ms)\n"));
        }
    }
    out.push_str(&format!(
        "[==========] {cases} tests from 1 test suite ran. (1 ms total)\n"
    ));
    out.into_bytes()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("gtest_report_parse");
    for &cases in &[4usize, 64, 1024] {
        let report = synthetic_report(cases);
        group.bench_with_input(BenchmarkId::from_parameter(cases), &report, |b, report| {
            b.iter(|| criterion::black_box(gtest_report::parse(report)));
        });
    }
    group.finish();
}

fn bench_case_oracle(c: &mut Criterion) {
    let cases = 1024;
    let expected = ExpectedOutcome::CaseResults(CaseResults {
        cases: (0..cases)
            .map(|i| {
                (
                    format!("suite.case_{i}"),
                    CaseExpectation::from_passed(i % 3 != 0),
                )
            })
            .collect::<BTreeMap<_, _>>(),
        exit_code: Some(1),
    });
    let run = ExecutionResult {
        stdout: synthetic_report(cases),
        stderr: Vec::new(),
        stdout_truncated: false,
        stderr_truncated: false,
        status: ExitStatus::Exited { code: 1 },
        duration: Duration::from_millis(1),
    };
    let limits = RunLimits::default();

    c.bench_function("case_results_oracle_1024", |b| {
        b.iter(|| criterion::black_box(oracle::compare(&expected, &run, &limits)));
    });
}

criterion_group!(benches, bench_parse, bench_case_oracle);
criterion_main!(benches);
