//! Configuration validation

use super::*;
use crate::monitor::keepalive;
use crate::pattern::btag::BTAG_SIZE;
use anyhow::{Context, Result};
use tracing::warn;

/// Alignment O_DIRECT requires of offsets and transfer sizes
const DIRECT_IO_ALIGNMENT: u64 = 512;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_test(&config.test)?;
    validate_pattern(&config.pattern, config.test.block_size)?;
    validate_errors(&config.errors, &config.test)?;
    validate_monitor(&config.monitor)?;
    validate_hooks(&config.hooks, &config.test)?;
    validate_shared_writes(config)?;

    Ok(())
}

/// Validate devices, limits, and thread layout
pub fn validate_test(test: &TestConfig) -> Result<()> {
    match test.mode {
        Mode::Exercise => {
            if test.input.is_none() && test.output.is_none() {
                anyhow::bail!("exercise mode needs --if (read/verify) or --of (write/verify)");
            }
            if test.input.is_some() && test.output.is_some() {
                anyhow::bail!("exercise mode takes either --if or --of, not both");
            }
        }
        Mode::Copy | Mode::Mirror => {
            if test.input.is_none() || test.output.is_none() {
                anyhow::bail!("{} mode needs both --if and --of", test.mode);
            }
            if test.input == test.output && test.device == DeviceKind::File {
                anyhow::bail!("{} mode input and output must differ", test.mode);
            }
        }
    }

    if test.block_size == 0 {
        anyhow::bail!("block_size must be greater than 0");
    }
    if test.direct && test.block_size % DIRECT_IO_ALIGNMENT != 0 {
        anyhow::bail!(
            "block_size {} must be a multiple of {} with direct I/O",
            test.block_size,
            DIRECT_IO_ALIGNMENT
        );
    }
    if test.direct && test.device == DeviceKind::Memory {
        warn!("direct I/O has no effect on memory devices");
    }

    if test.passes == 0 && test.runtime.is_none() {
        anyhow::bail!("passes must be at least 1 (or give a runtime)");
    }
    if test.runtime == Some(Duration::ZERO) {
        anyhow::bail!("runtime must be greater than 0");
    }
    if test.records == Some(0) {
        anyhow::bail!("records must be greater than 0");
    }
    if let Some(limit) = test.data_limit {
        if limit < test.block_size {
            anyhow::bail!(
                "data limit {} is smaller than the block size {}",
                limit,
                test.block_size
            );
        }
    }
    if let Some(size) = test.size {
        if size < test.block_size {
            anyhow::bail!("size {} is smaller than the block size {}", size, test.block_size);
        }
    }

    if test.device == DeviceKind::Memory && test.size.is_none() {
        anyhow::bail!("memory devices need --size");
    }

    let writes = test.output.is_some();
    if writes
        && test.device == DeviceKind::File
        && test.records.is_none()
        && test.data_limit.is_none()
        && test.size.is_none()
    {
        anyhow::bail!("writing needs a limit: --records, --limit, or --size");
    }

    if test.threads == 0 {
        anyhow::bail!("threads must be at least 1");
    }
    if test.slices == Some(0) {
        anyhow::bail!("slices must be at least 1");
    }
    if test.slices.is_some() && test.threads > 1 {
        warn!("both slices and threads given; slices decide the worker count");
    }
    if test.threads > 1024 {
        warn!(
            threads = test.threads,
            "very high thread count, this may cause performance issues"
        );
    }

    Ok(())
}

/// Validate the pattern selection
pub fn validate_pattern(pattern: &PatternConfig, block_size: u64) -> Result<()> {
    if pattern.pattern.is_some() && pattern.pattern_file.is_some() {
        warn!("both pattern and pattern_file given; using the pattern file");
    }
    if pattern.pattern_file.is_none() {
        pattern.resolve().context("invalid pattern")?;
    }
    if pattern.btag && block_size <= BTAG_SIZE as u64 {
        anyhow::bail!(
            "block tags need blocks larger than {} bytes (block_size is {})",
            BTAG_SIZE,
            block_size
        );
    }
    if let Some(dir) = &pattern.save_corrupted {
        if dir.exists() && !dir.is_dir() {
            anyhow::bail!("save_corrupted {} is not a directory", dir.display());
        }
    }
    Ok(())
}

/// Validate retry and error limits
pub fn validate_errors(errors: &ErrorConfig, test: &TestConfig) -> Result<()> {
    if errors.error_limit == Some(0) {
        anyhow::bail!("error_limit must be greater than 0 if specified");
    }
    if let Some(limit) = errors.error_limit {
        if limit < u64::from(errors.retry_limit) {
            warn!(
                error_limit = limit,
                retry_limit = errors.retry_limit,
                "error limit is below the retry limit; retried runs may stop early"
            );
        }
    }
    if errors.enospc == NoSpacePolicy::DeleteAndResume {
        if test.output.is_none() {
            anyhow::bail!("enospc=delete-and-resume needs an output device");
        }
        if errors.enospc_retries == 0 {
            anyhow::bail!("enospc_retries must be at least 1 with delete-and-resume");
        }
    }
    Ok(())
}

/// Validate monitor thresholds
pub fn validate_monitor(monitor: &MonitorConfig) -> Result<()> {
    if monitor.alarm.is_zero() {
        anyhow::bail!("alarm must be greater than 0");
    }
    if monitor.alarm < Duration::from_secs(1) {
        warn!("alarm below 1s; the monitor never ticks faster than once per second");
    }
    if monitor.noprog == Some(Duration::ZERO) || monitor.noprog_trigger == Some(Duration::ZERO) {
        anyhow::bail!("no-progress thresholds must be greater than 0");
    }
    if let (Some(noprog), Some(trigger)) = (monitor.noprog, monitor.noprog_trigger) {
        if trigger < noprog {
            anyhow::bail!(
                "noprog_trigger ({:?}) must not be shorter than noprog ({:?})",
                trigger,
                noprog
            );
        }
    }
    if monitor.keepalive == Some(Duration::ZERO) {
        anyhow::bail!("keepalive interval must be greater than 0");
    }
    if let Some(fmt) = &monitor.keepalive_fmt {
        keepalive::validate_format(fmt).context("invalid keepalive format")?;
    }
    if monitor.rate == Some(0) {
        anyhow::bail!("rate must be greater than 0 if specified");
    }
    for (name, gain) in [("rate_gain_up", monitor.rate_gain_up), ("rate_gain_down", monitor.rate_gain_down)] {
        if !(gain > 0.0 && gain <= 1.0) {
            anyhow::bail!("{} must be in (0, 1], got {}", name, gain);
        }
    }
    Ok(())
}

/// Validate per-pass hooks
pub fn validate_hooks(hooks: &HookConfig, test: &TestConfig) -> Result<()> {
    if (hooks.delete_per_pass || hooks.trim || hooks.post_write_cmd.is_some()) && test.output.is_none() {
        anyhow::bail!("delete_per_pass, trim, and post_write_cmd need an output device");
    }
    if hooks.delete_per_pass && test.slices.is_some() {
        anyhow::bail!("delete_per_pass cannot be combined with slices of one shared file");
    }
    Ok(())
}

/// Detect writers that overlap without a way to tell their data apart
///
/// Separate threads on one regular file each get their own file. Slices split
/// one file into disjoint ranges. What remains risky is several threads on one
/// shared block device without slices: they overwrite each other, and only a
/// unique pattern turns that into a detectable (expected) mismatch.
pub fn validate_shared_writes(config: &Config) -> Result<()> {
    let test = &config.test;
    if test.slices.is_some() || test.threads <= 1 || test.output.is_none() {
        return Ok(());
    }
    if let Some(path) = &test.output {
        if is_block_device(path) {
            anyhow::bail!(
                "{} threads would overwrite each other on block device {}; use --slices",
                test.threads,
                path.display()
            );
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_block_device(path: &std::path::Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_block_device(_path: &std::path::Path) -> bool {
    false
}
