mod common;

use common::*;
use iovet::config::{Mode, NoSpacePolicy};
use iovet::device::memory::MemoryDevice;
use iovet::ProcessState;

fn pair_config(mode: Mode, records: u64) -> iovet::Config {
    let mut config = exercise_config(records);
    config.test.mode = mode;
    config.test.input = Some("in".into());
    config.test.output = Some("out".into());
    config
}

fn source(records: u64) -> MemoryDevice {
    let data = (0..records * BS).map(|i| (i * 7 % 251) as u8).collect();
    MemoryDevice::with_data("in", data)
}

#[test]
fn copy_output_matches_input() {
    let state = ProcessState::new(false);
    let input = source(32);
    let output = MemoryDevice::new("out", 32 * BS);

    let id = launch_pair(&state, pair_config(Mode::Copy, 32), &input, &output);
    let report = reap(&state, id);

    assert!(report.success);
    assert_eq!(report.totals.counters.records_written, 32);
    assert_eq!(report.totals.counters.mismatches, 0);
    assert!(output.snapshot() == input.snapshot());
}

#[test]
fn copy_verify_catches_a_bad_output_block() {
    let state = ProcessState::new(false);
    let mut config = pair_config(Mode::Copy, 32);
    config.errors.error_limit = Some(10);
    config.errors.retry_dc_limit = 0;
    let input = source(32);
    let output = MemoryDevice::new("out", 32 * BS);
    output.faults().corrupt_reads_at(9 * BS + 100, 1);

    let id = launch_pair(&state, config, &input, &output);
    let report = reap(&state, id);

    assert!(!report.success);
    assert_eq!(report.totals.counters.mismatches, 1);
}

#[test]
fn copy_stops_cleanly_at_end_of_input() {
    let state = ProcessState::new(false);
    let mut config = pair_config(Mode::Copy, 32);
    config.test.passes = 3;
    let input = source(20);
    let output = MemoryDevice::new("out", 32 * BS);

    let id = launch_pair(&state, config, &input, &output);
    let report = reap(&state, id);

    assert!(report.success);
    assert_eq!(report.totals.counters.records_written, 20);
    assert_eq!(report.totals.passes, 1);
    assert!(output.snapshot()[..(20 * BS) as usize] == input.snapshot()[..]);
}

#[test]
fn copy_stops_cleanly_when_output_is_full() {
    let state = ProcessState::new(false);
    let mut config = pair_config(Mode::Copy, 32);
    config.test.passes = 3;
    config.errors.enospc = NoSpacePolicy::EndOfMedia;
    let input = source(32);
    let output = MemoryDevice::new("out", 32 * BS);
    output.faults().limit_space(20 * BS);

    let id = launch_pair(&state, config, &input, &output);
    let report = reap(&state, id);

    assert!(report.success);
    assert_eq!(report.totals.passes, 1);
    assert_eq!(report.totals.counters.records_written, 20);
    assert_eq!(report.totals.counters.mismatches, 0);
    assert!(output.snapshot()[..(20 * BS) as usize] == input.snapshot()[..(20 * BS) as usize]);
}

#[test]
fn mirror_reads_back_every_record() {
    let state = ProcessState::new(false);
    let output = MemoryDevice::new("vol", 16 * BS);
    let input = output.handle();

    let id = launch_pair(&state, pair_config(Mode::Mirror, 16), &input, &output);
    let report = reap(&state, id);

    assert!(report.success);
    assert_eq!(report.totals.counters.records_written, 16);
    assert_eq!(report.totals.counters.mismatches, 0);
}

#[test]
fn mirror_catches_a_bad_read_back() {
    let state = ProcessState::new(false);
    let mut config = pair_config(Mode::Mirror, 16);
    config.errors.error_limit = Some(10);
    config.errors.retry_dc_limit = 0;
    let output = MemoryDevice::new("vol", 16 * BS);
    let input = output.handle();
    output.faults().corrupt_reads_at(4 * BS + 1, 1);

    let id = launch_pair(&state, config, &input, &output);
    let report = reap(&state, id);

    assert!(!report.success);
    assert_eq!(report.totals.counters.records_written, 16);
    assert_eq!(report.totals.counters.mismatches, 1);
}
