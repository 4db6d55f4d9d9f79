//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! A [`Config`] is built from defaults, then a TOML file (if given), then CLI
//! flags (which always win). [`validator::validate_config`] checks it and
//! resolves derived values such as the effective error limit.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::pattern::PatternSpec;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Complete test configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub test: TestConfig,
    pub pattern: PatternConfig,
    pub errors: ErrorConfig,
    pub monitor: MonitorConfig,
    pub hooks: HookConfig,
    pub output: OutputConfig,
}

/// Operating mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Write then read-verify one device
    #[default]
    Exercise,
    /// Read the input device, write the output device
    Copy,
    /// Write the output device, read back from the input device
    Mirror,
}

/// Address order within a pass
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IoType {
    #[default]
    #[value(alias = "seq")]
    Sequential,
    Random,
}

/// Direction of a sequential pass
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IoDir {
    #[default]
    Forward,
    Reverse,
}

/// Backing device category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Regular file or raw block device
    #[default]
    File,
    /// In-memory volume (fault injection, testing)
    Memory,
}

/// What happens to output files when a thread finishes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DisposeMode {
    Delete,
    Keep,
    /// Delete on success, keep the evidence on failure
    #[default]
    KeepOnError,
}

/// Job action when a thread fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OnErrorAction {
    /// Stop the sibling threads
    Abort,
    /// Pause the sibling threads
    Pause,
    /// Let the siblings run on
    #[default]
    Continue,
}

/// Recovery when the destination runs out of space
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NoSpacePolicy {
    /// Count it as an error
    #[default]
    Fail,
    /// Treat as end of media; verify what was written
    EndOfMedia,
    /// Delete the output and restart the pass
    DeleteAndResume,
}

/// Default outcome of a no-progress escalation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerAction {
    #[default]
    Continue,
    Terminate,
    Wedge,
    Abort,
}

/// Test shape: devices, limits, threads, address order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub mode: Mode,
    /// Input device (read side)
    pub input: Option<PathBuf>,
    /// Output device (write side)
    pub output: Option<PathBuf>,
    pub device: DeviceKind,
    /// Capacity for memory devices, creation size for files
    #[serde(with = "size_opt")]
    pub size: Option<u64>,
    #[serde(with = "size")]
    pub block_size: u64,
    /// Records per pass
    pub records: Option<u64>,
    /// Bytes per pass
    #[serde(with = "size_opt")]
    pub data_limit: Option<u64>,
    pub passes: u64,
    /// Run passes until this much time elapsed
    #[serde(with = "duration_opt")]
    pub runtime: Option<Duration>,
    pub threads: usize,
    /// Split the device into this many disjoint ranges, one worker each
    pub slices: Option<usize>,
    pub verify: bool,
    pub iotype: IoType,
    pub iodir: IoDir,
    pub vary_iotype: bool,
    pub vary_iodir: bool,
    pub seed: Option<u64>,
    pub direct: bool,
    /// Writers rendezvous before readers on a shared file
    pub barrier: bool,
    pub tag: Option<String>,
    /// End the job cleanly once this file exists
    pub stop_on: Option<PathBuf>,
    pub dispose: DisposeMode,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Exercise,
            input: None,
            output: None,
            device: DeviceKind::File,
            size: None,
            block_size: default_block_size(),
            records: None,
            data_limit: None,
            passes: 1,
            runtime: None,
            threads: 1,
            slices: None,
            verify: true,
            iotype: IoType::Sequential,
            iodir: IoDir::Forward,
            vary_iotype: false,
            vary_iodir: false,
            seed: None,
            direct: false,
            barrier: false,
            tag: None,
            stop_on: None,
            dispose: DisposeMode::KeepOnError,
        }
    }
}

fn default_block_size() -> u64 {
    512
}

/// Data pattern selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// `table`, `iot`, `incr`, a 32-bit word, or `str:TEXT`
    pub pattern: Option<String>,
    /// Use this file's content as the pattern
    pub pattern_file: Option<PathBuf>,
    /// Derive the pattern from (thread, pass)
    pub unique: bool,
    /// Stamp a block tag at the front of every block
    pub btag: bool,
    /// Save expected/received blocks of a mismatch here
    pub save_corrupted: Option<PathBuf>,
}

impl PatternConfig {
    /// Resolve the configured pattern, reading the pattern file if set
    pub fn resolve(&self) -> crate::Result<PatternSpec> {
        use anyhow::Context;

        if let Some(path) = &self.pattern_file {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read pattern file: {}", path.display()))?;
            if bytes.is_empty() {
                anyhow::bail!("pattern file {} is empty", path.display());
            }
            return Ok(PatternSpec::Bytes(bytes));
        }
        match &self.pattern {
            Some(s) => s.parse(),
            None => Ok(PatternSpec::Table),
        }
    }
}

/// Retry and error-limit policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    /// Counted failures before the loop stops; auto-raised to at least
    /// `retry_limit` when unset
    pub error_limit: Option<u64>,
    pub retry_limit: u32,
    #[serde(with = "duration")]
    pub retry_delay: Duration,
    /// Re-reads of a corrupted block before it is counted
    pub retry_dc_limit: u32,
    #[serde(with = "duration")]
    pub retry_dc_delay: Duration,
    pub oncerr: OnErrorAction,
    pub enospc: NoSpacePolicy,
    /// Delete-and-resume attempts per pass
    pub enospc_retries: u32,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            error_limit: None,
            retry_limit: 0,
            retry_delay: Duration::from_secs(5),
            retry_dc_limit: 1,
            retry_dc_delay: Duration::from_secs(1),
            oncerr: OnErrorAction::Continue,
            enospc: NoSpacePolicy::Fail,
            enospc_retries: 3,
        }
    }
}

impl ErrorConfig {
    /// Error limit after the auto-raise rule
    pub fn effective_error_limit(&self) -> u64 {
        match self.error_limit {
            Some(limit) => limit,
            None => u64::from(self.retry_limit).max(1),
        }
    }
}

/// Keepalive, no-progress, and rate control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_opt")]
    pub noprog: Option<Duration>,
    #[serde(with = "duration_opt")]
    pub noprog_trigger: Option<Duration>,
    pub trigger_action: TriggerAction,
    /// Run on escalation; exit status picks the outcome
    pub trigger_cmd: Option<String>,
    #[serde(with = "duration_opt")]
    pub keepalive: Option<Duration>,
    pub keepalive_fmt: Option<String>,
    /// Monitor tick
    #[serde(with = "duration")]
    pub alarm: Duration,
    /// Grace period before a stopping thread is force-cancelled
    #[serde(with = "duration")]
    pub term_wait: Duration,
    /// Target bytes per second per thread
    #[serde(with = "size_opt")]
    pub rate: Option<u64>,
    /// Proportional gain while under target
    pub rate_gain_up: f64,
    /// Proportional gain while over target
    pub rate_gain_down: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            noprog: None,
            noprog_trigger: None,
            trigger_action: TriggerAction::Continue,
            trigger_cmd: None,
            keepalive: None,
            keepalive_fmt: None,
            alarm: Duration::from_secs(3),
            term_wait: Duration::from_secs(180),
            rate: None,
            rate_gain_up: 0.5,
            rate_gain_down: 0.25,
        }
    }
}

/// Per-pass hooks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Delete and recreate the output file between passes
    pub delete_per_pass: bool,
    /// Deallocate (trim) the written range after each pass
    pub trim: bool,
    /// Shell command run after each write sub-pass
    pub post_write_cmd: Option<String>,
}

/// Output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Write a JSON report here
    pub json: Option<PathBuf>,
    pub verbosity: u8,
    pub debug: bool,
    pub dry_run: bool,
}

impl Config {
    /// Number of worker threads the job launches
    pub fn worker_count(&self) -> usize {
        self.test.slices.unwrap_or(self.test.threads).max(1)
    }

    /// True when an exercise job only reads and verifies existing data
    pub fn read_only(&self) -> bool {
        self.test.mode == Mode::Exercise && self.test.output.is_none()
    }
}

// Display trait implementations

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "  Test: {}", self.test)?;
        writeln!(
            f,
            "  Pattern: {}{}{}",
            self.pattern.pattern.as_deref().unwrap_or("table"),
            if self.pattern.unique { ", unique" } else { "" },
            if self.pattern.btag { ", btag" } else { "" }
        )?;
        writeln!(
            f,
            "  Errors: limit={}, retries={} ({:?}), dc retries={} ({:?}), oncerr={}",
            self.errors.effective_error_limit(),
            self.errors.retry_limit,
            self.errors.retry_delay,
            self.errors.retry_dc_limit,
            self.errors.retry_dc_delay,
            self.errors.oncerr
        )?;
        writeln!(f, "  Monitor: {}", self.monitor)?;
        Ok(())
    }
}

impl fmt::Display for TestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode)?;
        if let Some(input) = &self.input {
            write!(f, ", if={}", input.display())?;
        }
        if let Some(output) = &self.output {
            write!(f, ", of={}", output.display())?;
        }
        write!(
            f,
            ", bs={}, passes={}, threads={}, {} {}",
            self.block_size,
            self.passes,
            self.slices.unwrap_or(self.threads),
            self.iotype,
            self.iodir
        )?;
        if let Some(records) = self.records {
            write!(f, ", records={}", records)?;
        }
        if let Some(limit) = self.data_limit {
            write!(f, ", limit={}", limit)?;
        }
        if let Some(runtime) = self.runtime {
            write!(f, ", runtime={:?}", runtime)?;
        }
        if !self.verify {
            write!(f, ", no verify")?;
        }
        Ok(())
    }
}

impl fmt::Display for MonitorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alarm={:?}, term_wait={:?}", self.alarm, self.term_wait)?;
        if let Some(n) = self.noprog {
            write!(f, ", noprog={:?}", n)?;
        }
        if let Some(t) = self.noprog_trigger {
            write!(f, ", trigger={:?} ({})", t, self.trigger_action)?;
        }
        if let Some(k) = self.keepalive {
            write!(f, ", keepalive={:?}", k)?;
        }
        if let Some(r) = self.rate {
            write!(f, ", rate={}/s", r)?;
        }
        Ok(())
    }
}

macro_rules! display_value_enum {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    match self.to_possible_value() {
                        Some(v) => f.write_str(v.get_name()),
                        None => write!(f, "{:?}", self),
                    }
                }
            }
        )*
    };
}

display_value_enum!(
    Mode,
    IoType,
    IoDir,
    DeviceKind,
    DisposeMode,
    OnErrorAction,
    NoSpacePolicy,
    TriggerAction
);

/// Durations in TOML: a string such as "500ms", "5s", "2m", or integer seconds
mod duration {
    use super::cli_convert::parse_duration;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Raw {
        Secs(u64),
        Text(String),
    }

    pub(super) fn from_raw<E: de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Secs(s) => Ok(Duration::from_secs(s)),
            Raw::Text(t) => parse_duration(&t).map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        from_raw(Raw::deserialize(d)?)
    }
}

mod duration_opt {
    use super::duration::{from_raw, Raw};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => super::duration::serialize(d, s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            Some(raw) => from_raw(raw).map(Some),
            None => Ok(None),
        }
    }
}

/// Sizes in TOML: integer bytes or a string such as "4k", "64M"
mod size {
    use super::cli_convert::parse_size;
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Raw {
        Bytes(u64),
        Text(String),
    }

    pub(super) fn from_raw<E: de::Error>(raw: Raw) -> Result<u64, E> {
        match raw {
            Raw::Bytes(b) => Ok(b),
            Raw::Text(t) => parse_size(&t).map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(*v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        from_raw(Raw::deserialize(d)?)
    }
}

mod size_opt {
    use super::size::{from_raw, Raw};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_u64(*v),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            Some(raw) => from_raw(raw).map(Some),
            None => Ok(None),
        }
    }
}
