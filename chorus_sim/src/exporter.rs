//! JSON exporter for simulated runs.
//!
//! Captures the progress reports and normalized results of every run a
//! scenario drives, for offline inspection.

use chorus_core::orchestrator::{NormalizedResult, RunProgress, RunState};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One orchestrator run inside a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub state: RunState,

    /// Virtual seconds the run took
    pub elapsed_secs: f64,

    pub progress: Vec<RunProgress>,

    pub results: Vec<NormalizedResult>,
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    pub runs: Vec<RunRecord>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            runs: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    pub fn add_run(&mut self, run: RunRecord) {
        self.runs.push(run);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
