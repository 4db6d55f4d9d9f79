//! CLI argument parsing using clap
//!
//! Every tunable is optional here so that a TOML file can supply it; see
//! [`merge_cli_with_config`](super::toml::merge_cli_with_config) for the
//! precedence rules.

use super::cli_convert::{duration_arg, size_arg};
use super::{DeviceKind, DisposeMode, IoDir, IoType, Mode, NoSpacePolicy, OnErrorAction, TriggerAction};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// iovet - concurrent data-integrity tester for disks, files, and media
#[derive(Parser, Debug, Default)]
#[command(name = "iovet")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file (CLI flags override it)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    // === Devices ===
    /// Input device or file
    #[arg(long = "if", value_name = "PATH")]
    pub input: Option<PathBuf>,

    /// Output device or file
    #[arg(long = "of", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Operating mode
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Device category backing the paths
    #[arg(long, value_enum)]
    pub device: Option<DeviceKind>,

    /// Device capacity (memory) or file size to create (e.g., 64M)
    #[arg(long, value_parser = size_arg)]
    pub size: Option<u64>,

    /// Open with O_DIRECT
    #[arg(long)]
    pub direct: bool,

    // === Limits ===
    /// Block size (e.g., 512, 4k, 1M)
    #[arg(short = 'b', long = "bs", value_parser = size_arg)]
    pub block_size: Option<u64>,

    /// Records per pass
    #[arg(long)]
    pub records: Option<u64>,

    /// Bytes per pass (e.g., 1G)
    #[arg(long = "limit", value_parser = size_arg)]
    pub data_limit: Option<u64>,

    /// Number of passes
    #[arg(long)]
    pub passes: Option<u64>,

    /// Keep running passes for this long (e.g., 10m)
    #[arg(long, value_parser = duration_arg)]
    pub runtime: Option<Duration>,

    /// Worker threads
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Split the device into N disjoint slices, one worker each
    #[arg(long)]
    pub slices: Option<usize>,

    // === Pattern ===
    /// Data pattern: table, iot, incr, 0xWORD, or str:TEXT
    #[arg(long)]
    pub pattern: Option<String>,

    /// Use a file's content as the data pattern
    #[arg(long, value_name = "PATH")]
    pub pattern_file: Option<PathBuf>,

    /// Derive the pattern from (thread, pass)
    #[arg(long)]
    pub unique: bool,

    /// Stamp a block tag at the front of each block
    #[arg(long)]
    pub btag: bool,

    /// Skip the read-verify sub-pass
    #[arg(long)]
    pub no_verify: bool,

    /// Save expected and received data of corrupted blocks here
    #[arg(long, value_name = "DIR")]
    pub save_corrupted: Option<PathBuf>,

    // === Address order ===
    /// Sequential or random addressing
    #[arg(long, value_enum)]
    pub iotype: Option<IoType>,

    /// Forward or reverse sequential direction
    #[arg(long, value_enum)]
    pub iodir: Option<IoDir>,

    /// Pick sequential or random anew each pass
    #[arg(long)]
    pub vary_iotype: bool,

    /// Pick forward or reverse anew each pass
    #[arg(long)]
    pub vary_iodir: bool,

    /// Random seed (default: time based)
    #[arg(long)]
    pub seed: Option<u64>,

    // === Errors ===
    /// Error limit (default 1, raised to the retry limit)
    #[arg(long = "errors")]
    pub error_limit: Option<u64>,

    /// Retries of a retryable device error
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Delay between retries
    #[arg(long, value_parser = duration_arg)]
    pub retry_delay: Option<Duration>,

    /// Re-reads of a corrupted block
    #[arg(long)]
    pub retry_dc_limit: Option<u32>,

    /// Delay between corrupted block re-reads
    #[arg(long, value_parser = duration_arg)]
    pub retry_dc_delay: Option<Duration>,

    /// Job action when a thread fails
    #[arg(long, value_enum)]
    pub oncerr: Option<OnErrorAction>,

    /// Output file disposition
    #[arg(long, value_enum)]
    pub dispose: Option<DisposeMode>,

    /// Out of space policy
    #[arg(long, value_enum)]
    pub enospc: Option<NoSpacePolicy>,

    // === Monitor ===
    /// Report operations taking longer than this
    #[arg(long, value_parser = duration_arg)]
    pub noprog: Option<Duration>,

    /// Escalate operations taking longer than this
    #[arg(long, value_parser = duration_arg)]
    pub noprog_trigger: Option<Duration>,

    /// Escalation outcome when no trigger command is set
    #[arg(long, value_enum)]
    pub trigger_action: Option<TriggerAction>,

    /// Command run on escalation (exit 0 continue, 1 terminate, 2 wedge, else abort)
    #[arg(long)]
    pub trigger_cmd: Option<String>,

    /// Keepalive interval
    #[arg(long, value_parser = duration_arg)]
    pub keepalive: Option<Duration>,

    /// Keepalive format (%d %j %t %p %r %b %e %s %%)
    #[arg(long)]
    pub keepalive_fmt: Option<String>,

    /// Monitor tick
    #[arg(long, value_parser = duration_arg)]
    pub alarm: Option<Duration>,

    /// Grace period before a stopping thread is force-cancelled
    #[arg(long, value_parser = duration_arg)]
    pub term_wait: Option<Duration>,

    /// Target throughput per thread (e.g., 10M)
    #[arg(long, value_parser = size_arg)]
    pub rate: Option<u64>,

    /// Stop cleanly once this file exists
    #[arg(long, value_name = "PATH")]
    pub stop_on: Option<PathBuf>,

    // === Hooks ===
    /// Delete and recreate the output between passes
    #[arg(long)]
    pub delete_per_pass: bool,

    /// Deallocate the written range after each pass
    #[arg(long)]
    pub trim: bool,

    /// Shell command run after each write sub-pass
    #[arg(long)]
    pub post_write_cmd: Option<String>,

    // === Job ===
    /// Rendezvous writers before readers each pass (shared files)
    #[arg(long)]
    pub barrier: bool,

    /// Job tag
    #[arg(long)]
    pub tag: Option<String>,

    // === Output ===
    /// Write a JSON report to this path
    #[arg(long, value_name = "PATH")]
    pub json: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Debug logging for every record
    #[arg(long)]
    pub debug: bool,

    /// Validate and print the plan without running
    #[arg(long)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_exercise_flags() {
        let cli = Cli::try_parse_from([
            "iovet", "--of", "/tmp/x", "-b", "4k", "--records", "100", "--pattern", "0xAAAAAAAA",
            "--noprog", "2s", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.output, Some(PathBuf::from("/tmp/x")));
        assert_eq!(cli.block_size, Some(4096));
        assert_eq!(cli.records, Some(100));
        assert_eq!(cli.noprog, Some(Duration::from_secs(2)));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_parse_enums() {
        let cli = Cli::try_parse_from([
            "iovet", "--mode", "copy", "--iotype", "random", "--dispose", "keep-on-error",
            "--enospc", "delete-and-resume", "--oncerr", "abort",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(Mode::Copy));
        assert_eq!(cli.iotype, Some(IoType::Random));
        assert_eq!(cli.dispose, Some(DisposeMode::KeepOnError));
        assert_eq!(cli.enospc, Some(NoSpacePolicy::DeleteAndResume));
        assert_eq!(cli.oncerr, Some(OnErrorAction::Abort));
    }
}
