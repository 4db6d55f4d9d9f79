mod common;

use common::*;
use iovet::config::{IoType, NoSpacePolicy, OnErrorAction};
use iovet::context::{IoContext, Outcome};
use iovet::device::memory::MemoryDevice;
use iovet::job::{JobSelector, JobState, ThreadState, WorkerStatus};
use iovet::ProcessState;
use std::time::Duration;

#[test]
fn write_then_verify_reports_no_mismatches() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(100);
    config.pattern.pattern = Some("0xAAAAAAAA".into());
    let dev = MemoryDevice::new("vol", 100 * BS);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert!(report.success);
    assert_eq!(c.records_written, 100);
    assert_eq!(c.records_read, 100);
    assert_eq!(c.mismatches, 0);
    assert_eq!(report.totals.passes, 1);
    assert_eq!(report.statuses, vec![WorkerStatus::Success]);

    let data = dev.snapshot();
    assert!(data.chunks(4).all(|w| w == [0xAA; 4]));
}

#[test]
fn error_limit_counts_exactly_that_many_failures() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(100);
    config.errors.error_limit = Some(5);
    let dev = MemoryDevice::new("vol", 100 * BS);
    dev.faults().fail_writes_after(0, false);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    assert!(!report.success);
    assert_eq!(report.totals.counters.errors, 5);
    assert_eq!(report.totals.counters.records_written, 0);
    assert_eq!(report.statuses, vec![WorkerStatus::Failure]);
}

#[test]
fn retryable_failures_are_retried_before_counting() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(8);
    config.errors.retry_limit = 2;
    config.errors.retry_delay = Duration::from_millis(1);
    config.errors.error_limit = Some(8);
    let dev = MemoryDevice::new("vol", 8 * BS);
    dev.faults().fail_writes_after(0, true);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert_eq!(c.errors, 8);
    assert_eq!(c.retries, 16);
    // one try plus two retries per record
    assert_eq!(dev.faults().writes(), 24);
}

#[test]
fn verify_read_failures_are_counted() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(16);
    config.errors.error_limit = Some(100);
    let dev = MemoryDevice::new("vol", 16 * BS);
    dev.faults().fail_reads_after(12, false);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert!(!report.success);
    assert_eq!(c.records_written, 16);
    assert_eq!(c.records_read, 12);
    assert_eq!(c.errors, 4);
    assert_eq!(c.mismatches, 0);
}

#[test]
fn failed_writes_are_not_verified() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(16);
    config.errors.error_limit = Some(100);
    let dev = MemoryDevice::new("vol", 16 * BS);
    dev.faults().fail_writes_after(12, false);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert!(!report.success);
    assert_eq!(c.records_written, 12);
    assert_eq!(c.errors, 4);
    assert_eq!(c.mismatches, 0);
    assert_eq!(c.records_read, 12);
}

#[test]
fn paused_job_does_no_io_until_resumed() {
    let state = ProcessState::new(false);
    let dev = MemoryDevice::new("vol", 16 * BS);

    let id = launch(&state, exercise_config(16), &dev, true);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(dev.faults().writes(), 0);
    assert_eq!(dev.faults().reads(), 0);
    assert_eq!(state.jobs.get(id).unwrap().state(), JobState::Paused);

    assert_eq!(state.resume_job(&JobSelector::Id(id)), Ok(1));
    let report = reap(&state, id);
    assert!(report.success);
    assert_eq!(dev.faults().writes(), 16);
    assert_eq!(report.totals.counters.records_written, 16);
}

#[test]
fn running_job_pauses_and_resumes() {
    let state = ProcessState::new(false);
    let dev = MemoryDevice::new("vol", 64 * BS);
    dev.faults().set_latency(Duration::from_millis(5));
    let id = launch(&state, exercise_config(64), &dev, false);

    assert!(eventually(Duration::from_secs(5), || dev.faults().writes() >= 5));
    assert_eq!(state.pause_job(&JobSelector::Id(id)), Ok(1));
    assert!(eventually(Duration::from_secs(5), || {
        let info = state.query_job(&JobSelector::Id(id)).unwrap();
        info[0].threads[0].state == ThreadState::Paused
    }));
    let before = (dev.faults().writes(), dev.faults().reads());
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!((dev.faults().writes(), dev.faults().reads()), before);
    assert_eq!(state.jobs.get(id).unwrap().state(), JobState::Paused);

    assert_eq!(state.resume_job(&JobSelector::Id(id)), Ok(1));
    let report = reap(&state, id);
    assert!(report.success);
    assert_eq!(report.totals.counters.records_written, 64);
    assert_eq!(report.totals.counters.records_read, 64);
}

#[test]
fn barrier_job_verifies_every_slice() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(64);
    config.test.records = None;
    config.test.threads = 2;
    config.test.slices = Some(2);
    config.test.barrier = true;
    let dev = MemoryDevice::new("vol", 64 * BS);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert!(report.success);
    assert_eq!(report.statuses, vec![WorkerStatus::Success, WorkerStatus::Success]);
    assert_eq!(c.records_written, 64);
    assert_eq!(c.records_read, 64);
    assert_eq!(c.mismatches, 0);
}

#[test]
fn random_iot_round_trip() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(64);
    config.test.iotype = IoType::Random;
    config.pattern.pattern = Some("iot".into());
    let dev = MemoryDevice::new("vol", 64 * BS);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert!(report.success);
    assert_eq!(c.records_written, 64);
    assert_eq!(c.records_read, 64);
    assert_eq!(c.mismatches, 0);
}

#[test]
fn varied_order_passes_verify() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(32);
    config.test.passes = 4;
    config.test.vary_iotype = true;
    config.test.vary_iodir = true;
    let dev = MemoryDevice::new("vol", 32 * BS);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert!(report.success);
    assert_eq!(report.totals.passes, 4);
    assert_eq!(c.records_written, 4 * 32);
    assert_eq!(c.records_read, 4 * 32);
    assert_eq!(c.mismatches, 0);
}

#[test]
fn corrupted_block_is_saved() {
    let state = ProcessState::new(false);
    let dir = tempfile::tempdir().unwrap();
    let mut config = exercise_config(16);
    config.errors.error_limit = Some(10);
    config.errors.retry_dc_limit = 0;
    config.pattern.save_corrupted = Some(dir.path().to_path_buf());
    let dev = MemoryDevice::new("vol", 16 * BS);
    dev.faults().corrupt_reads_at(5 * BS + 10, 1);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);
    assert_eq!(report.totals.counters.mismatches, 1);

    let mut files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    files.sort();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].extension().unwrap(), "exp");
    assert_eq!(files[1].extension().unwrap(), "rcv");
    assert!(files[0].file_name().unwrap().to_string_lossy().ends_with("-p1-r5.exp"));

    let expected = std::fs::read(&files[0]).unwrap();
    let received = std::fs::read(&files[1]).unwrap();
    assert_eq!(expected.len(), BS as usize);
    let diffs: Vec<usize> = (0..expected.len()).filter(|&i| expected[i] != received[i]).collect();
    assert_eq!(diffs, vec![10]);
}

#[test]
fn stop_on_finished_job_is_a_noop() {
    let state = ProcessState::new(false);
    let dev = MemoryDevice::new("vol", 16 * BS);
    let id = launch(&state, exercise_config(16), &dev, false);

    let job = state.jobs.get(id).unwrap();
    job.wait();
    assert_eq!(state.stop_job(&JobSelector::Id(id)), Ok(1));
    assert_eq!(job.state(), JobState::Finished);
    assert!(reap(&state, id).success);
}

#[test]
fn end_of_media_truncates_the_pass() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(16);
    config.errors.enospc = NoSpacePolicy::EndOfMedia;
    let dev = MemoryDevice::new("vol", 16 * BS);
    dev.faults().limit_space(10 * BS);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert!(report.success);
    assert_eq!(c.records_written, 10);
    assert_eq!(c.records_read, 10);
    assert_eq!(c.errors, 0);
}

#[test]
fn delete_and_resume_is_bounded() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(16);
    config.errors.enospc = NoSpacePolicy::DeleteAndResume;
    config.errors.enospc_retries = 3;
    let dev = MemoryDevice::new("vol", 16 * BS);
    dev.faults().limit_space(10 * BS);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    // three recreations, each rewriting the ten blocks that fit, then a failure
    assert!(!report.success);
    assert_eq!(report.totals.counters.records_written, 40);
    assert_eq!(report.totals.counters.errors, 1);
}

#[test]
fn transient_corruption_counts_once() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(16);
    config.errors.error_limit = Some(10);
    config.errors.retry_dc_limit = 2;
    config.errors.retry_dc_delay = Duration::from_millis(5);
    let dev = MemoryDevice::new("vol", 16 * BS);
    dev.faults().corrupt_reads_at(5 * BS + 10, 1);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    let c = report.totals.counters;
    assert!(!report.success);
    assert_eq!(c.mismatches, 1);
    assert_eq!(c.errors, 1);
    // the corruption re-read is not a record
    assert_eq!(c.records_read, 16);
}

#[test]
fn persistent_corruption_counts_once_per_record() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(16);
    config.errors.error_limit = Some(10);
    config.errors.retry_dc_limit = 2;
    config.errors.retry_dc_delay = Duration::from_millis(5);
    let dev = MemoryDevice::new("vol", 16 * BS);
    dev.faults().corrupt_reads_at(3 * BS, 100);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    assert_eq!(report.totals.counters.mismatches, 1);
    assert_eq!(report.totals.counters.errors, 1);
}

#[test]
fn abort_policy_stops_siblings() {
    let state = ProcessState::new(false);
    let mut config = exercise_config(64);
    config.test.threads = 2;
    config.test.slices = Some(2);
    config.errors.oncerr = OnErrorAction::Abort;
    let dev = MemoryDevice::new("vol", 64 * BS);
    dev.faults().fail_writes_after(4, false);

    let id = launch(&state, config, &dev, false);
    let report = reap(&state, id);

    assert!(!report.success);
    assert!(report.statuses.contains(&WorkerStatus::Failure));
}

#[test]
fn cleanup_twice_is_safe() {
    let config = exercise_config(4);
    let template = IoContext::from_config(&config).unwrap();
    let mut ctx = IoContext::clone_for_thread(&template, 0, true).unwrap();
    ctx.initialize().unwrap();
    ctx.open().unwrap();

    ctx.cleanup(Outcome::Success).unwrap();
    ctx.cleanup(Outcome::Success).unwrap();
    assert!(ctx.is_cleaned());
}
