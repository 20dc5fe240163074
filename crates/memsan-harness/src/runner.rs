//! Scenario execution engine.

use std::io::Write;
use std::time::Instant;

use serde::Serialize;

use crate::HarnessError;
use crate::scenarios::{Scenario, ScenarioOutcome};
use crate::structured_log::{EvidenceEntry, LogEmitter, LogLevel, Outcome};

/// Runs scenarios and records evidence for each.
pub struct ScenarioRunner {
    /// Identifier stamped on every evidence line.
    pub run_id: String,
}

/// Totals for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub passed: usize,
    pub outcomes: Vec<ScenarioOutcome>,
}

impl RunSummary {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.total - self.passed
    }

    /// Error if any scenario failed.
    pub fn into_result(self) -> Result<Self, HarnessError> {
        match self.failed() {
            0 => Ok(self),
            failed => Err(HarnessError::ScenariosFailed {
                failed,
                total: self.total,
            }),
        }
    }
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    /// Run `scenarios` in order, writing evidence to `emitter`.
    pub fn run<W: Write>(
        &self,
        scenarios: &[Scenario],
        emitter: &mut LogEmitter<W>,
    ) -> Result<RunSummary, HarnessError> {
        emitter.emit_entry(
            EvidenceEntry::new(String::new(), LogLevel::Info, "run_start").with_details(
                serde_json::json!({ "scenarios": scenarios.iter().map(|s| s.name()).collect::<Vec<_>>() }),
            ),
        )?;

        let mut outcomes = Vec::with_capacity(scenarios.len());
        for &scenario in scenarios {
            let started = Instant::now();
            let outcome = scenario.run()?;
            let elapsed = started.elapsed().as_micros() as u64;

            for report in &outcome.reports {
                emitter.emit_entry(
                    EvidenceEntry::new(String::new(), LogLevel::Warn, "report")
                        .with_scenario(scenario.name())
                        .with_reason(report.reason.as_str())
                        .with_details(serde_json::to_value(report)?),
                )?;
            }

            let (level, verdict) = if outcome.passed {
                (LogLevel::Info, Outcome::Pass)
            } else {
                (LogLevel::Error, Outcome::Fail)
            };
            emitter.emit_entry(
                EvidenceEntry::new(String::new(), level, "scenario_result")
                    .with_scenario(scenario.name())
                    .with_outcome(verdict)
                    .with_duration_us(elapsed)
                    .with_details(serde_json::json!({
                        "notes": outcome.notes,
                        "metrics": outcome.metrics,
                    })),
            )?;
            outcomes.push(outcome);
        }

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            total: outcomes.len(),
            passed: outcomes.iter().filter(|o| o.passed).count(),
            outcomes,
        };
        emitter.emit_entry(
            EvidenceEntry::new(String::new(), LogLevel::Info, "run_end").with_details(
                serde_json::json!({ "total": summary.total, "passed": summary.passed }),
            ),
        )?;
        emitter.flush()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured_log::validate_log_line;

    #[test]
    fn full_run_passes_and_logs_valid_evidence() {
        let runner = ScenarioRunner::new("unit");
        let mut emitter = LogEmitter::to_buffer("unit");
        let summary = runner.run(&Scenario::ALL, &mut emitter).unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.failed(), 0);

        let text = String::from_utf8(emitter.into_inner()).unwrap();
        let entries: Vec<_> = text
            .lines()
            .enumerate()
            .map(|(i, line)| validate_log_line(line, i + 1).expect("valid evidence line"))
            .collect();
        assert_eq!(entries.first().map(|e| e.event.as_str()), Some("run_start"));
        assert_eq!(entries.last().map(|e| e.event.as_str()), Some("run_end"));
        let results = entries
            .iter()
            .filter(|e| e.event == "scenario_result")
            .count();
        assert_eq!(results, 4);
        // Scenarios A, C and D each report once.
        let reports = entries.iter().filter(|e| e.event == "report").count();
        assert_eq!(reports, 3);
    }

    #[test]
    fn empty_run_still_brackets_the_log() {
        let mut emitter = LogEmitter::to_buffer("empty");
        let summary = ScenarioRunner::new("empty")
            .run(&[], &mut emitter)
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(summary.total, 0);
        let text = String::from_utf8(emitter.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
