//! Human-readable text output

use crate::config::Config;
use crate::job::{JobReport, WorkerStatus};
use crate::stats::histogram::LatencySummary;
use crate::stats::StatsSnapshot;
use crate::util::time::{
    calculate_rate, calculate_throughput, format_bytes, format_elapsed, format_rate, format_throughput,
};
use std::time::Duration;

/// Print the run plan for `--dry-run`
pub fn print_plan(config: &Config) {
    let t = &config.test;
    println!("═══════════════════════════════════════════════════════════");
    println!("                    TEST PLAN");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Mode:        {}", t.mode);
    if let Some(input) = &t.input {
        println!("Input:       {} ({})", input.display(), t.device);
    }
    if let Some(output) = &t.output {
        println!("Output:      {} ({})", output.display(), t.device);
    }
    if let Some(size) = t.size {
        println!("Size:        {}", format_bytes(size));
    }
    println!("Block size:  {}", format_bytes(t.block_size));
    match (t.records, t.data_limit) {
        (Some(r), _) => println!("Records:     {} per pass", format_number(r)),
        (None, Some(l)) => println!("Limit:       {} per pass", format_bytes(l)),
        (None, None) => println!("Records:     to end of device"),
    }
    match t.runtime {
        Some(rt) => println!("Runtime:     {:?} (pass limit ignored)", rt),
        None => println!("Passes:      {}", t.passes),
    }
    println!("Workers:     {}", config.worker_count());
    println!("Access:      {} {}", t.iotype, t.iodir);
    println!(
        "Pattern:     {}{}{}",
        config.pattern.pattern.as_deref().unwrap_or("table"),
        if config.pattern.unique { ", unique" } else { "" },
        if config.pattern.btag { ", btag" } else { "" }
    );
    println!("Verify:      {}", if t.verify { "yes" } else { "no" });
    println!("Errors:      limit {}, on error {}", config.errors.effective_error_limit(), config.errors.oncerr);
    println!("Dispose:     {}", t.dispose);
}

/// Print the final report of every job
pub fn print_reports(reports: &[JobReport]) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                    TEST RESULTS");
    println!("═══════════════════════════════════════════════════════════");
    for report in reports {
        println!();
        print_job(report);
    }
}

fn print_job(report: &JobReport) {
    let totals = &report.totals;
    let c = &totals.counters;
    let elapsed = Duration::from_secs_f64(totals.elapsed_secs);

    match &report.tag {
        Some(tag) => println!("Job {} [{}]: {}", report.id, tag, verdict(report)),
        None => println!("Job {}: {}", report.id, verdict(report)),
    }
    if let Some(reason) = report.stop_reason {
        println!("  Stopped:  {}", reason);
    }
    println!("  Elapsed:  {}, {} pass(es)", format_elapsed(elapsed), totals.passes);
    println!();

    println!("  Read:     {} records ({}) - {} rec/s, {}",
        format_number(c.records_read),
        format_bytes(c.bytes_read),
        format_rate(calculate_rate(c.records_read, elapsed)),
        format_throughput(calculate_throughput(c.bytes_read, elapsed)));
    println!("  Write:    {} records ({}) - {} rec/s, {}",
        format_number(c.records_written),
        format_bytes(c.bytes_written),
        format_rate(calculate_rate(c.records_written, elapsed)),
        format_throughput(calculate_throughput(c.bytes_written, elapsed)));
    println!("  Errors:   {} ({} mismatches, {} retries)", c.errors, c.mismatches, c.retries);
    println!();

    println!("  Latency:");
    print_latency("read", &totals.read_latency);
    print_latency("write", &totals.write_latency);

    if report.threads.len() > 1 {
        println!();
        println!("  Workers:");
        for (snap, status) in report.threads.iter().zip(&report.statuses) {
            print_worker(snap, *status);
        }
    }
}

fn print_latency(label: &str, l: &LatencySummary) {
    if l.count == 0 {
        return;
    }
    println!(
        "    {:<5}  min {:>9.1}us  mean {:>9.1}us  p50 {:>9.1}us  p99 {:>9.1}us  p99.9 {:>9.1}us  max {:>9.1}us",
        label, l.min_us, l.mean_us, l.p50_us, l.p99_us, l.p999_us, l.max_us
    );
}

fn print_worker(snap: &StatsSnapshot, status: WorkerStatus) {
    let c = &snap.counters;
    println!(
        "    {:<6} {:<24} {:>8}  passes {:>3}  read {:>10}  written {:>10}  errors {}",
        snap.name,
        snap.device,
        format!("{:?}", status),
        snap.passes,
        format_number(c.records_read),
        format_number(c.records_written),
        c.errors
    );
}

fn verdict(report: &JobReport) -> &'static str {
    if report.success {
        "SUCCESS"
    } else {
        "FAILURE"
    }
}

/// Format number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
