//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config =
        ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Build the configuration for a command line: the TOML file (or defaults)
/// with CLI overrides applied
pub fn load(cli: &Cli) -> Result<Config> {
    let base = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(cli, base)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
///
/// Options override when given; boolean flags can only switch a feature on.
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    let test = &mut config.test;
    if let Some(mode) = cli.mode {
        test.mode = mode;
    }
    if cli.input.is_some() {
        test.input = cli.input.clone();
    }
    if cli.output.is_some() {
        test.output = cli.output.clone();
    }
    if let Some(device) = cli.device {
        test.device = device;
    }
    if cli.size.is_some() {
        test.size = cli.size;
    }
    if let Some(bs) = cli.block_size {
        test.block_size = bs;
    }
    if cli.records.is_some() {
        test.records = cli.records;
    }
    if cli.data_limit.is_some() {
        test.data_limit = cli.data_limit;
    }
    if let Some(passes) = cli.passes {
        test.passes = passes;
    }
    if cli.runtime.is_some() {
        test.runtime = cli.runtime;
    }
    if let Some(threads) = cli.threads {
        test.threads = threads;
    }
    if cli.slices.is_some() {
        test.slices = cli.slices;
    }
    if cli.no_verify {
        test.verify = false;
    }
    if let Some(iotype) = cli.iotype {
        test.iotype = iotype;
    }
    if let Some(iodir) = cli.iodir {
        test.iodir = iodir;
    }
    test.vary_iotype |= cli.vary_iotype;
    test.vary_iodir |= cli.vary_iodir;
    if cli.seed.is_some() {
        test.seed = cli.seed;
    }
    test.direct |= cli.direct;
    test.barrier |= cli.barrier;
    if cli.tag.is_some() {
        test.tag = cli.tag.clone();
    }
    if cli.stop_on.is_some() {
        test.stop_on = cli.stop_on.clone();
    }
    if let Some(dispose) = cli.dispose {
        test.dispose = dispose;
    }

    let pattern = &mut config.pattern;
    if cli.pattern.is_some() {
        pattern.pattern = cli.pattern.clone();
        pattern.pattern_file = None;
    }
    if cli.pattern_file.is_some() {
        pattern.pattern_file = cli.pattern_file.clone();
    }
    pattern.unique |= cli.unique;
    pattern.btag |= cli.btag;
    if cli.save_corrupted.is_some() {
        pattern.save_corrupted = cli.save_corrupted.clone();
    }

    let errors = &mut config.errors;
    if cli.error_limit.is_some() {
        errors.error_limit = cli.error_limit;
    }
    if let Some(n) = cli.retry_limit {
        errors.retry_limit = n;
    }
    if let Some(d) = cli.retry_delay {
        errors.retry_delay = d;
    }
    if let Some(n) = cli.retry_dc_limit {
        errors.retry_dc_limit = n;
    }
    if let Some(d) = cli.retry_dc_delay {
        errors.retry_dc_delay = d;
    }
    if let Some(action) = cli.oncerr {
        errors.oncerr = action;
    }
    if let Some(policy) = cli.enospc {
        errors.enospc = policy;
    }

    let monitor = &mut config.monitor;
    if cli.noprog.is_some() {
        monitor.noprog = cli.noprog;
    }
    if cli.noprog_trigger.is_some() {
        monitor.noprog_trigger = cli.noprog_trigger;
    }
    if let Some(action) = cli.trigger_action {
        monitor.trigger_action = action;
    }
    if cli.trigger_cmd.is_some() {
        monitor.trigger_cmd = cli.trigger_cmd.clone();
    }
    if cli.keepalive.is_some() {
        monitor.keepalive = cli.keepalive;
    }
    if cli.keepalive_fmt.is_some() {
        monitor.keepalive_fmt = cli.keepalive_fmt.clone();
    }
    if let Some(alarm) = cli.alarm {
        monitor.alarm = alarm;
    }
    if let Some(wait) = cli.term_wait {
        monitor.term_wait = wait;
    }
    if cli.rate.is_some() {
        monitor.rate = cli.rate;
    }

    let hooks = &mut config.hooks;
    hooks.delete_per_pass |= cli.delete_per_pass;
    hooks.trim |= cli.trim;
    if cli.post_write_cmd.is_some() {
        hooks.post_write_cmd = cli.post_write_cmd.clone();
    }

    let output = &mut config.output;
    if cli.json.is_some() {
        output.json = cli.json.clone();
    }
    output.verbosity = output.verbosity.max(cli.verbose);
    output.debug |= cli.debug;
    output.dry_run |= cli.dry_run;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_parse_toml_basic() {
        let toml = r#"
            [test]
            mode = "copy"
            input = "/tmp/a"
            output = "/tmp/b"
            block_size = "4k"
            records = 100
            runtime = "10m"

            [errors]
            retry_limit = 3
            retry_delay = "250ms"
            oncerr = "abort"

            [monitor]
            noprog = 2
            noprog_trigger = "30s"
            trigger_action = "terminate"
        "#;
        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.test.mode, Mode::Copy);
        assert_eq!(config.test.block_size, 4096);
        assert_eq!(config.test.records, Some(100));
        assert_eq!(config.test.runtime, Some(Duration::from_secs(600)));
        assert_eq!(config.errors.retry_delay, Duration::from_millis(250));
        assert_eq!(config.errors.oncerr, OnErrorAction::Abort);
        assert_eq!(config.errors.effective_error_limit(), 3);
        assert_eq!(config.monitor.noprog, Some(Duration::from_secs(2)));
        assert_eq!(config.monitor.trigger_action, TriggerAction::Terminate);
        // untouched sections keep their defaults
        assert_eq!(config.monitor.term_wait, Duration::from_secs(180));
        assert!(config.test.verify);
    }

    #[test]
    fn test_parse_toml_rejects_unknown_enum() {
        assert!(parse_toml_string("[test]\nmode = \"shred\"\n").is_err());
    }

    #[test]
    fn test_parse_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[test]\nthreads = 4\n[pattern]\npattern = \"iot\"\nunique = true").unwrap();
        let config = parse_toml_file(file.path()).unwrap();
        assert_eq!(config.test.threads, 4);
        assert_eq!(config.pattern.pattern.as_deref(), Some("iot"));
        assert!(config.pattern.unique);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let base = parse_toml_string("[test]\nthreads = 4\npasses = 3\n[errors]\nerror_limit = 9").unwrap();
        let cli = Cli::try_parse_from(["iovet", "-t", "2", "--errors", "5", "--no-verify"]).unwrap();
        let merged = merge_cli_with_config(&cli, base).unwrap();
        assert_eq!(merged.test.threads, 2);
        assert_eq!(merged.test.passes, 3);
        assert_eq!(merged.errors.error_limit, Some(5));
        assert!(!merged.test.verify);
    }

    #[test]
    fn test_cli_pattern_replaces_pattern_file() {
        let mut base = Config::default();
        base.pattern.pattern_file = Some("/tmp/pat".into());
        let cli = Cli::try_parse_from(["iovet", "--pattern", "incr"]).unwrap();
        let merged = merge_cli_with_config(&cli, base).unwrap();
        assert!(merged.pattern.pattern_file.is_none());
        assert_eq!(merged.pattern.pattern.as_deref(), Some("incr"));
    }
}
