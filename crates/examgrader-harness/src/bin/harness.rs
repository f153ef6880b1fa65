//! CLI entrypoint for the exam grading harness.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use examgrader_exec::CancelToken;
use examgrader_harness::structured_log::{
    ArtifactIndex, LogEmitter, LogEntry, LogLevel, Phase, validate_log_file,
};
use examgrader_harness::{GradeReport, Grader, HarnessConfig, load_corpus};

/// Build, run and grade C exercise fixtures.
#[derive(Debug, Parser)]
#[command(name = "harness")]
#[command(about = "Grading harness for C exercise fixtures")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Grade every fixture under a corpus directory.
    Grade {
        /// Corpus root; each directory holding a fixture.json is one fixture.
        #[arg(long)]
        corpus: PathBuf,
        /// Harness configuration JSON.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Worker count (overrides the config file).
        #[arg(long)]
        jobs: Option<usize>,
        /// Per-binary wall-clock limit in milliseconds (overrides the config file).
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Output report path (markdown); JSON is written next to it.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Optional fixed timestamp string recorded in the report.
        #[arg(long)]
        timestamp: Option<String>,
        /// Keep per-fixture build directories after grading.
        #[arg(long)]
        keep_artifacts: bool,
    },
    /// List the fixtures a corpus defines, and any rejected descriptors.
    List {
        #[arg(long)]
        corpus: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Grade {
            corpus,
            config,
            jobs,
            timeout_ms,
            report,
            log,
            timestamp,
            keep_artifacts,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(jobs) = jobs {
                config.concurrency = Some(jobs);
            }
            if let Some(timeout_ms) = timeout_ms {
                config.limits.timeout_ms = timeout_ms;
            }
            config.keep_artifacts |= keep_artifacts;
            config.validate()?;

            let registry = config.registry()?;
            eprintln!("Loading fixtures from {}", corpus.display());
            let loaded = load_corpus(&corpus, &registry)?;
            for rejected in &loaded.rejected {
                eprintln!("Rejected {}: {}", rejected.fixture_id, rejected.reason);
            }

            let run_id = format!("grade-{}", std::process::id());
            let emitter = match &log {
                Some(path) => Some(Arc::new(LogEmitter::to_file(path, &run_id)?)),
                None => None,
            };
            if let Some(emitter) = &emitter {
                for rejected in &loaded.rejected {
                    emitter.emit_entry(
                        LogEntry::new("", LogLevel::Warn, "descriptor_rejected")
                            .with_fixture(&rejected.fixture_id)
                            .with_phase(Phase::Load)
                            .with_details(serde_json::json!({ "reason": rejected.reason })),
                    );
                }
            }

            let mut grader =
                Grader::new(&config).with_cancel(CancelToken::with_signal_handlers()?);
            if let Some(emitter) = &emitter {
                grader = grader.with_log(Arc::clone(emitter));
            }
            eprintln!(
                "Grading {} fixture(s) with {} worker(s)",
                loaded.fixtures.len(),
                config.workers()
            );
            let results = grader.grade_all(&loaded.fixtures);
            let cancelled = grader.cancel_token().is_cancelled();

            let report_doc = GradeReport::assemble(
                "Grading Report",
                timestamp,
                &loaded.fixtures,
                results,
                loaded.rejected,
            )?;
            let summary = &report_doc.summary;
            eprintln!(
                "Grading complete: total={}, passed={}, failed={}, build_errors={}, run_errors={}, rejected={}",
                summary.total,
                summary.passed,
                summary.failed,
                summary.build_errors,
                summary.run_errors,
                report_doc.rejected.len()
            );

            let json_path = report.as_ref().map(|path| path.with_extension("json"));
            if let (Some(report_path), Some(json_path)) = (&report, &json_path) {
                eprintln!("Writing report to {}", report_path.display());
                std::fs::write(report_path, report_doc.to_markdown())?;
                std::fs::write(json_path, report_doc.to_json())?;
            } else {
                print!("{}", report_doc.to_markdown());
            }

            if let Some(emitter) = &emitter {
                emitter.emit_entry(
                    LogEntry::new("", LogLevel::Info, "report_written")
                        .with_phase(Phase::Report)
                        .with_details(serde_json::json!({ "clean": report_doc.is_clean() })),
                );
                emitter.flush()?;
            }

            if let (Some(report_path), Some(json_path)) = (&report, &json_path) {
                let mut index = ArtifactIndex::new(&run_id);
                index.add_file(report_path, "report_markdown")?;
                index.add_file(json_path, "report_json")?;
                if let Some(log_path) = &log {
                    index.add_file(log_path, "structured_log")?;
                }
                std::fs::write(report_path.with_extension("index.json"), index.to_json()?)?;
            }

            if cancelled {
                return Err("grading cancelled".into());
            }
            if !report_doc.is_clean() {
                return Err(format!(
                    "{} of {} fixture(s) did not pass, {} descriptor(s) rejected",
                    summary.total - summary.passed,
                    summary.total,
                    report_doc.rejected.len()
                )
                .into());
            }
        }
        Command::List { corpus, config } => {
            let config = load_config(config.as_deref())?;
            let registry = config.registry()?;
            let loaded = load_corpus(&corpus, &registry)?;
            for fixture in &loaded.fixtures {
                println!(
                    "{}\t{}\t{} source(s)",
                    fixture.id,
                    fixture.kind.as_str(),
                    fixture.sources.len()
                );
            }
            for rejected in &loaded.rejected {
                eprintln!("Rejected {}: {}", rejected.fixture_id, rejected.reason);
            }
            if !loaded.rejected.is_empty() {
                return Err(format!("{} descriptor(s) rejected", loaded.rejected.len()).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!("{} invalid record(s) in {lines} line(s)", errors.len()).into());
            }
            eprintln!("{}: {lines} valid record(s)", log.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(HarnessConfig::from_file(path)?),
        None => Ok(HarnessConfig::default()),
    }
}
