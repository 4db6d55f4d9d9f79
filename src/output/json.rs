//! JSON output formatting
//!
//! One document per run: host and timing information, the configuration
//! that ran, and every job's report with per-worker statistics and latency
//! percentiles.

use crate::config::Config;
use crate::job::JobReport;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Run information
#[derive(Debug, Clone, Serialize)]
pub struct JsonRunInfo {
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub success: bool,
}

/// Complete JSON report
#[derive(Debug, Clone, Serialize)]
pub struct JsonReport<'a> {
    pub run: JsonRunInfo,
    pub config: &'a Config,
    pub jobs: &'a [JobReport],
}

/// Assemble the report of a run that started at `start`
pub fn build_report<'a>(config: &'a Config, jobs: &'a [JobReport], start: DateTime<Local>) -> JsonReport<'a> {
    let end = Local::now();
    let duration = end.signed_duration_since(start).to_std().unwrap_or_default();
    JsonReport {
        run: JsonRunInfo {
            version: env!("CARGO_PKG_VERSION"),
            hostname: hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
            start_time: start.to_rfc3339(),
            end_time: end.to_rfc3339(),
            duration_secs: duration.as_secs_f64(),
            success: jobs.iter().all(|j| j.success),
        },
        config,
        jobs,
    }
}

/// Write JSON output to file
pub fn write_json_output(output_path: &Path, report: &JsonReport<'_>) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON report: {}", output_path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)
        .with_context(|| format!("Failed to write JSON report: {}", output_path.display()))?;
    writer.flush().context("Failed to flush JSON report")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::WorkerStatus;
    use crate::stats::{self, StatsSnapshot};

    fn report(success: bool) -> JobReport {
        let threads = vec![StatsSnapshot::empty(0, "t0", "vol")];
        let totals = stats::aggregate(&threads).unwrap();
        JobReport {
            id: 1,
            tag: Some("nightly".into()),
            success,
            stop_reason: None,
            statuses: vec![WorkerStatus::Success],
            threads,
            totals,
        }
    }

    #[test]
    fn test_report_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let config = Config::default();
        let jobs = vec![report(true)];

        write_json_output(&path, &build_report(&config, &jobs, Local::now())).unwrap();

        let doc: serde_json::Value = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(doc["run"]["success"], true);
        assert_eq!(doc["jobs"][0]["tag"], "nightly");
        assert_eq!(doc["jobs"][0]["statuses"][0], "success");
        assert_eq!(doc["config"]["test"]["block_size"], 512);
    }

    #[test]
    fn test_failure_propagates_to_run() {
        let config = Config::default();
        let jobs = vec![report(true), report(false)];
        assert!(!build_report(&config, &jobs, Local::now()).run.success);
    }
}
