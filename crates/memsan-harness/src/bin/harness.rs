//! CLI entrypoint for the memsan scenario harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use memsan_harness::structured_log::{ArtifactIndex, LogEmitter, validate_log_file};
use memsan_harness::{HarnessError, Scenario, ScenarioRunner};

/// Scenario tooling for memsan.
#[derive(Debug, Parser)]
#[command(name = "memsan-harness")]
#[command(about = "Run memsan engine scenarios and validate evidence logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the built-in scenarios.
    List,
    /// Run scenarios against fresh engines.
    Run {
        /// Scenario id (a-d), name, or "all".
        #[arg(long, default_value = "all")]
        scenario: String,
        /// JSONL evidence output path (if omitted, evidence goes to stdout).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Artifact index output path (requires --log).
        #[arg(long, requires = "log")]
        artifact_index: Option<PathBuf>,
        /// Run identifier stamped on every evidence line.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Validate a JSONL evidence log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), HarnessError> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for scenario in Scenario::ALL {
                println!("{}  {}", scenario.id(), scenario.name());
            }
        }
        Command::Run {
            scenario,
            log,
            artifact_index,
            run_id,
        } => {
            let scenarios = Scenario::select(&scenario)?;
            let runner = ScenarioRunner::new(&run_id);
            let summary = match &log {
                Some(path) => runner.run(&scenarios, &mut LogEmitter::to_file(path, &run_id)?)?,
                None => runner.run(&scenarios, &mut LogEmitter::new(std::io::stdout(), &run_id))?,
            };

            for outcome in &summary.outcomes {
                let verdict = if outcome.passed { "PASS" } else { "FAIL" };
                eprintln!(
                    "{verdict} {} ({} reports)",
                    outcome.scenario.name(),
                    outcome.reports.len()
                );
                for note in &outcome.notes {
                    eprintln!("    {note}");
                }
            }
            let totals: Vec<_> = summary.outcomes.iter().map(|o| &o.metrics).collect();
            eprintln!("metrics: {}", serde_json::to_string(&totals)?);

            if let (Some(log), Some(index_path)) = (&log, &artifact_index) {
                let mut index = ArtifactIndex::new(&run_id);
                index.add_file(log, "evidence_log")?;
                std::fs::write(index_path, index.to_json()?)?;
                eprintln!("Wrote artifact index to {}", index_path.display());
            }
            eprintln!("{}/{} scenarios passed", summary.passed, summary.total);
            summary.into_result()?;
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("{lines} lines, {} errors", errors.len());
            if !errors.is_empty() {
                return Err(HarnessError::InvalidEvidence {
                    count: errors.len(),
                });
            }
        }
    }

    Ok(())
}
