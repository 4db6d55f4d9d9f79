#![allow(dead_code)]

use iovet::config::{Config, DeviceKind, DisposeMode, Mode};
use iovet::context::{IoContext, Role};
use iovet::device::memory::MemoryDevice;
use iovet::job::{JobId, JobReport, JobSelector};
use iovet::ProcessState;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const BS: u64 = 4096;

/// Exercise over a memory volume of exactly `records` blocks
pub fn exercise_config(records: u64) -> Config {
    let mut config = Config::default();
    config.test.mode = Mode::Exercise;
    config.test.device = DeviceKind::Memory;
    config.test.output = Some("vol".into());
    config.test.size = Some(records * BS);
    config.test.block_size = BS;
    config.test.records = Some(records);
    config.test.seed = Some(7);
    config.test.dispose = DisposeMode::Keep;
    config
}

/// Start a job whose output is `dev` (sharing its volume and fault plan)
pub fn launch(state: &ProcessState, config: Config, dev: &MemoryDevice, paused: bool) -> JobId {
    let config = Arc::new(config);
    let template = IoContext::template(&config, Role::Write, Box::new(dev.handle())).unwrap();
    state.create_job(config, &template, paused).unwrap()
}

/// Start a copy or mirror job from `input` to `output`
pub fn launch_pair(state: &ProcessState, config: Config, input: &MemoryDevice, output: &MemoryDevice) -> JobId {
    let config = Arc::new(config);
    let partner = IoContext::template(&config, Role::Read, Box::new(input.handle())).unwrap();
    let template = IoContext::template(&config, Role::Write, Box::new(output.handle()))
        .unwrap()
        .with_partner(partner);
    state.create_job(config, &template, false).unwrap()
}

pub fn reap(state: &ProcessState, id: JobId) -> JobReport {
    let mut reports = state.wait_job(&JobSelector::Id(id)).unwrap();
    assert_eq!(reports.len(), 1);
    reports.remove(0)
}

/// Poll `cond` for up to `timeout`
pub fn eventually(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
