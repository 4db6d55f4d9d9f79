//! I/O context
//!
//! An [`IoContext`] is everything one worker needs to drive one device role:
//! the resolved parameters, the device handle, its buffers, the pattern state,
//! statistics, error accounting, and the address sequence. A context is built
//! once as a *template* from the configuration and then cloned per worker
//! thread with [`IoContext::clone_for_thread`].
//!
//! Copy and mirror jobs drive two roles from one task. The write role is the
//! primary context; the read role rides along as its `partner`, cloned and
//! cleaned up together with it.
//!
//! # Lifecycle
//!
//! 1. [`IoContext::from_config`] (or [`IoContext::template`]) builds the template
//! 2. [`IoContext::clone_for_thread`] per worker
//! 3. [`IoContext::initialize`] allocates buffers and sizes the address range
//! 4. the I/O loop runs
//! 5. [`IoContext::cleanup`] closes handles and applies the dispose policy

use crate::config::{
    Config, DeviceKind, DisposeMode, HookConfig, IoDir, IoType, Mode, NoSpacePolicy, OnErrorAction,
};
use crate::device::file::FileDevice;
use crate::device::memory::MemoryDevice;
use crate::device::{Device, OpenFlags};
use crate::distribution::{AddressSequence, SliceRange};
use crate::pattern::PatternState;
use crate::stats::{IoStats, StatsSnapshot};
use crate::util::buffer::{IoBuffers, DEFAULT_ALIGNMENT};
use crate::Result;
use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Which side of the transfer a context drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Read,
    Write,
}

/// How a worker ended, for the dispose policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Parameters resolved from the configuration
///
/// Plain data; cloning it is a deep copy.
#[derive(Debug, Clone)]
pub struct IoParams {
    pub mode: Mode,
    pub role: Role,
    pub block_size: u64,
    pub alignment: usize,
    /// Device size override
    pub size: Option<u64>,
    pub records: Option<u64>,
    pub data_limit: Option<u64>,
    pub pass_limit: u64,
    /// Runtime mode: passes repeat until the monitor ends the run
    pub runtime: Option<Duration>,
    pub workers: usize,
    /// Workers split one device into disjoint slices
    pub sliced: bool,
    /// Clones address the template's storage instead of a per-thread copy
    pub shared_device: bool,
    pub verify: bool,
    pub io_type: IoType,
    pub io_dir: IoDir,
    pub vary_iotype: bool,
    pub vary_iodir: bool,
    pub seed: u64,
    pub direct: bool,
    pub barrier: bool,
    pub dispose: DisposeMode,
    pub oncerr: OnErrorAction,
    pub error_limit: u64,
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub retry_dc_limit: u32,
    pub retry_dc_delay: Duration,
    pub enospc: NoSpacePolicy,
    pub enospc_retries: u32,
    pub save_corrupted: Option<PathBuf>,
    pub hooks: HookConfig,
    pub stop_on: Option<PathBuf>,
}

impl IoParams {
    pub fn from_config(config: &Config, role: Role) -> Self {
        let test = &config.test;
        let errors = &config.errors;
        let workers = config.worker_count();
        let sliced = test.slices.is_some();
        let shared_device = match (test.mode, role) {
            // every copy worker reads the same input
            (Mode::Copy, Role::Read) => true,
            _ => sliced || workers == 1,
        };

        Self {
            mode: test.mode,
            role,
            block_size: test.block_size,
            alignment: DEFAULT_ALIGNMENT,
            size: test.size,
            records: test.records,
            data_limit: test.data_limit,
            pass_limit: test.passes,
            runtime: test.runtime,
            workers,
            sliced,
            shared_device,
            verify: test.verify,
            io_type: test.iotype,
            io_dir: test.iodir,
            vary_iotype: test.vary_iotype,
            vary_iodir: test.vary_iodir,
            seed: test.seed.unwrap_or_else(rand::random),
            direct: test.direct,
            barrier: test.barrier,
            dispose: test.dispose,
            oncerr: errors.oncerr,
            error_limit: errors.effective_error_limit(),
            retry_limit: errors.retry_limit,
            retry_delay: errors.retry_delay,
            retry_dc_limit: errors.retry_dc_limit,
            retry_dc_delay: errors.retry_dc_delay,
            enospc: errors.enospc,
            enospc_retries: errors.enospc_retries,
            save_corrupted: config.pattern.save_corrupted.clone(),
            hooks: config.hooks.clone(),
            stop_on: test.stop_on.clone(),
        }
    }

    /// True while another pass may start
    pub fn wants_pass(&self, completed: u64) -> bool {
        self.runtime.is_some() || completed < self.pass_limit
    }
}

/// Counted failures against the limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    pub count: u64,
    pub limit: u64,
}

impl ErrorCounters {
    pub fn new(limit: u64) -> Self {
        Self { count: 0, limit }
    }

    /// Count one failure; true once the limit is reached
    pub fn record(&mut self) -> bool {
        self.count += 1;
        self.limit_reached()
    }

    pub fn limit_reached(&self) -> bool {
        self.count >= self.limit
    }
}

/// Per-worker I/O state for one device role
pub struct IoContext {
    pub params: IoParams,
    pub thread: usize,
    pub is_master: bool,
    /// Worker name used in messages
    pub name: String,
    pub device: Option<Box<dyn Device>>,
    pub buffers: Option<IoBuffers>,
    pub pattern: PatternState,
    pub stats: IoStats,
    pub errors: ErrorCounters,
    pub seq: Option<AddressSequence>,
    pub pass_count: u64,
    /// Read role of a copy/mirror pair
    pub partner: Option<Box<IoContext>>,
    /// First open still pending (outputs are created on it)
    first_open: bool,
    cleaned: bool,
}

impl IoContext {
    /// Template context for `device`
    pub fn template(config: &Config, role: Role, device: Box<dyn Device>) -> Result<Self> {
        let spec = config.pattern.resolve().context("Failed to resolve pattern")?;
        let params = IoParams::from_config(config, role);
        Ok(Self {
            errors: ErrorCounters::new(params.error_limit),
            params,
            thread: 0,
            is_master: true,
            name: "template".to_string(),
            device: Some(device),
            buffers: None,
            pattern: PatternState::new(spec, config.pattern.unique, config.pattern.btag),
            stats: IoStats::new()?,
            seq: None,
            pass_count: 0,
            partner: None,
            first_open: true,
            cleaned: false,
        })
    }

    /// Attach the read role of a copy/mirror pair
    pub fn with_partner(mut self, partner: IoContext) -> Self {
        self.partner = Some(Box::new(partner));
        self
    }

    /// Build the template (and partner) from the configured device paths
    pub fn from_config(config: &Config) -> Result<Self> {
        let test = &config.test;
        let size = test.size.unwrap_or(0);

        match test.mode {
            Mode::Exercise => {
                let (role, path) = match (&test.output, &test.input) {
                    (Some(out), _) => (Role::Write, out),
                    (None, Some(input)) => (Role::Read, input),
                    (None, None) => return Err(anyhow!("no device given")),
                };
                let device: Box<dyn Device> = match test.device {
                    DeviceKind::File => Box::new(FileDevice::new(path.clone())),
                    DeviceKind::Memory => Box::new(MemoryDevice::new(path.display().to_string(), size)),
                };
                Self::template(config, role, device)
            }
            Mode::Copy | Mode::Mirror => {
                let (input, output) = match (&test.input, &test.output) {
                    (Some(i), Some(o)) => (i, o),
                    _ => return Err(anyhow!("{} mode needs an input and an output", test.mode)),
                };
                let (out_dev, in_dev): (Box<dyn Device>, Box<dyn Device>) = match test.device {
                    DeviceKind::File => (
                        Box::new(FileDevice::new(output.clone())),
                        Box::new(FileDevice::new(input.clone())),
                    ),
                    DeviceKind::Memory => {
                        let out = MemoryDevice::new(output.display().to_string(), size);
                        let inp = if input == output {
                            out.handle()
                        } else {
                            MemoryDevice::new(input.display().to_string(), size)
                        };
                        (Box::new(out), Box::new(inp))
                    }
                };
                let partner = Self::template(config, Role::Read, in_dev)?;
                Ok(Self::template(config, Role::Write, out_dev)?.with_partner(partner))
            }
        }
    }

    /// Clone a template for worker `thread`
    ///
    /// Field groups:
    /// - deep-copied: `params`, the worker name, `pattern` (including a user
    ///   byte string, which is owned by the clone)
    /// - reset: device open state (a fresh handle from [`Device::clone_for`]),
    ///   buffers (allocated by `initialize`), statistics, error counters,
    ///   pass count, timing, address sequence
    /// - shared read-only: the static pattern table
    ///
    /// Nothing mutable is shared between the template and the clone. The
    /// partner role, if any, is cloned the same way.
    pub fn clone_for_thread(template: &IoContext, thread: usize, is_master: bool) -> Result<Self> {
        let device = template
            .device
            .as_ref()
            .map(|d| d.clone_for(thread, template.params.shared_device));

        let partner = match &template.partner {
            Some(p) => Some(Box::new(Self::clone_for_thread(p, thread, is_master)?)),
            None => None,
        };

        let mut pattern = template.pattern.clone();
        pattern.derive(thread, 0);

        Ok(Self {
            params: template.params.clone(),
            thread,
            is_master,
            name: format!("t{}", thread),
            device,
            buffers: None,
            pattern,
            stats: IoStats::new()?,
            errors: ErrorCounters::new(template.params.error_limit),
            seq: None,
            pass_count: 0,
            partner,
            first_open: true,
            cleaned: false,
        })
    }

    pub fn device_name(&self) -> &str {
        self.device.as_ref().map(|d| d.name()).unwrap_or("<none>")
    }

    /// Allocate buffers and size the address range
    pub fn initialize(&mut self) -> Result<()> {
        self.initialize_role()?;
        if let Some(partner) = self.partner.as_mut() {
            partner.initialize_role()?;
        }

        let bs = self.params.block_size;
        let capacity = self.resolve_capacity()?;
        let range = if self.params.sliced {
            let slices = SliceRange::split(capacity, bs, self.params.workers);
            slices
                .get(self.thread)
                .copied()
                .ok_or_else(|| anyhow!("{}: no slice for thread {}", self.name, self.thread))?
        } else {
            SliceRange {
                base: 0,
                blocks: capacity / bs,
            }
        };
        if range.blocks == 0 {
            return Err(anyhow!(
                "{}: {} has no room for a {} byte block",
                self.name,
                self.device_name(),
                bs
            ));
        }

        let records = self
            .params
            .records
            .or_else(|| self.params.data_limit.map(|l| l / bs))
            .unwrap_or(range.blocks);

        debug!(
            thread = %self.name,
            base = range.base,
            blocks = range.blocks,
            records,
            "address range"
        );
        self.seq = Some(AddressSequence::new(
            range,
            bs,
            records,
            self.params.io_type,
            self.params.io_dir,
        ));
        Ok(())
    }

    fn initialize_role(&mut self) -> Result<()> {
        let bs = self.params.block_size;
        self.buffers = Some(
            IoBuffers::new(bs as usize, self.params.alignment)
                .with_context(|| format!("{}: failed to allocate buffers", self.name))?,
        );
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| anyhow!("{}: no device bound", self.name))?;
        device
            .validate_parameters(bs, self.params.direct)
            .with_context(|| format!("{}: invalid parameters for {}", self.name, device.name()))?;
        self.cleaned = false;
        Ok(())
    }

    /// Usable bytes: explicit size, device size, partner size, record count
    fn resolve_capacity(&self) -> Result<u64> {
        if let Some(size) = self.params.size {
            return Ok(size);
        }
        let known = |ctx: &IoContext| -> Result<Option<u64>> {
            match &ctx.device {
                Some(d) => Ok(d.capacity()?.filter(|&c| c > 0)),
                None => Ok(None),
            }
        };
        if let Some(c) = known(self)? {
            return Ok(c);
        }
        if let Some(partner) = &self.partner {
            if let Some(c) = known(partner)? {
                return Ok(c);
            }
        }
        let bs = self.params.block_size;
        if let Some(records) = self.params.records {
            return Ok(records * bs);
        }
        if let Some(limit) = self.params.data_limit {
            return Ok(limit);
        }
        Err(anyhow!(
            "{}: cannot determine the size of {}; give --size or --records",
            self.name,
            self.device_name()
        ))
    }

    /// Flags for the next open of this role
    pub fn open_flags(&self) -> OpenFlags {
        match self.params.role {
            Role::Write if self.first_open => OpenFlags::create(self.params.direct),
            Role::Write => OpenFlags::read_write(self.params.direct),
            Role::Read => OpenFlags::read_only(self.params.direct),
        }
    }

    /// Open the device (creating outputs on the first open)
    pub fn open(&mut self) -> Result<()> {
        let flags = self.open_flags();
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| anyhow!("no device bound"))?;
        device
            .open(flags)
            .with_context(|| format!("Failed to open {}", device.name()))?;
        if self.first_open {
            device
                .start_test()
                .with_context(|| format!("start_test failed on {}", device.name()))?;
            self.first_open = false;
        }
        Ok(())
    }

    /// Close and open again between sub-passes
    pub fn reopen(&mut self) -> Result<()> {
        let flags = self.open_flags();
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| anyhow!("no device bound"))?;
        device
            .reopen(flags)
            .with_context(|| format!("Failed to reopen {}", device.name()))
    }

    /// Delete the output and create it again, leaving it open
    pub fn recreate(&mut self) -> Result<()> {
        if self.params.role != Role::Write {
            return Err(anyhow!("{}: only outputs can be recreated", self.name));
        }
        let flags = OpenFlags::create(self.params.direct);
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| anyhow!("no device bound"))?;
        if device.is_open() {
            device
                .close()
                .with_context(|| format!("Failed to close {}", device.name()))?;
        }
        device
            .remove()
            .with_context(|| format!("Failed to remove {}", device.name()))?;
        device
            .open(flags)
            .with_context(|| format!("Failed to recreate {}", device.name()))?;
        debug!(device = device.name(), "output recreated");
        Ok(())
    }

    /// Statistics of this context merged with its partner's
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snap = self.stats.snapshot(self.thread, &self.name, self.device_name());
        if let Some(partner) = &self.partner {
            let other = partner.stats.snapshot(partner.thread, &partner.name, partner.device_name());
            snap.counters.add(&other.counters);
            snap.device = format!("{} <- {}", snap.device, other.device);
            if let (Some(mine), Some(theirs)) = (snap.read_hist.as_mut(), other.read_hist.as_ref()) {
                if mine.merge(theirs).is_ok() {
                    snap.read_latency = mine.summary();
                }
            }
            if let (Some(mine), Some(theirs)) = (snap.write_hist.as_mut(), other.write_hist.as_ref()) {
                if mine.merge(theirs).is_ok() {
                    snap.write_latency = mine.summary();
                }
            }
        }
        snap
    }

    /// Release buffers, close handles, and apply the dispose policy
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn cleanup(&mut self, outcome: Outcome) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;
        self.buffers = None;

        let mut first_err: Option<anyhow::Error> = None;
        if let Some(device) = self.device.as_mut() {
            if device.is_open() {
                if self.params.role == Role::Write {
                    if let Err(e) = device.flush() {
                        warn!(device = device.name(), error = %e, "flush at cleanup failed");
                    }
                }
                if let Err(e) = device.end_test().and_then(|_| device.close()) {
                    let name = device.name().to_string();
                    first_err = first_err.or(Some(anyhow::Error::new(e).context(format!("Failed to close {}", name))));
                }
            }

            let delete = self.params.role == Role::Write
                && match self.params.dispose {
                    DisposeMode::Delete => true,
                    DisposeMode::Keep => false,
                    DisposeMode::KeepOnError => outcome == Outcome::Success,
                };
            if delete {
                debug!(device = device.name(), "disposing output");
                if let Err(e) = device.remove() {
                    let name = device.name().to_string();
                    first_err = first_err.or(Some(anyhow::Error::new(e).context(format!("Failed to remove {}", name))));
                }
            }
        }

        if let Some(partner) = self.partner.as_mut() {
            if let Err(e) = partner.cleanup(outcome) {
                first_err = first_err.or(Some(e));
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{ActivePattern, PatternSpec};

    fn memory_config(size: u64) -> Config {
        let mut config = Config::default();
        config.test.device = DeviceKind::Memory;
        config.test.output = Some("mem0".into());
        config.test.size = Some(size);
        config.test.block_size = 512;
        config.test.seed = Some(42);
        config
    }

    #[test]
    fn test_clone_resets_transient_state() {
        let config = memory_config(64 * 1024);
        let mut template = IoContext::from_config(&config).unwrap();
        template.pass_count = 7;
        template.errors.count = 3;

        let clone = IoContext::clone_for_thread(&template, 2, false).unwrap();
        assert_eq!(clone.thread, 2);
        assert_eq!(clone.name, "t2");
        assert_eq!(clone.pass_count, 0);
        assert_eq!(clone.errors.count, 0);
        assert!(clone.buffers.is_none());
        assert!(!clone.device.as_ref().unwrap().is_open());
        assert_eq!(clone.params.seed, 42);
    }

    #[test]
    fn test_clone_deep_copies_user_pattern() {
        let mut config = memory_config(4096);
        config.pattern.pattern = Some("str:abc".into());
        let template = IoContext::from_config(&config).unwrap();
        let clone = IoContext::clone_for_thread(&template, 0, true).unwrap();
        drop(template);
        assert_eq!(clone.pattern.spec(), &PatternSpec::Bytes(b"abc".to_vec()));
        assert_eq!(clone.pattern.active(), ActivePattern::Bytes);
    }

    #[test]
    fn test_initialize_sizes_range_from_records() {
        let mut config = memory_config(1 << 20);
        config.test.records = Some(10);
        let template = IoContext::from_config(&config).unwrap();
        let mut ctx = IoContext::clone_for_thread(&template, 0, true).unwrap();
        ctx.initialize().unwrap();
        let seq = ctx.seq.as_ref().unwrap();
        assert_eq!(seq.records_per_pass(), 10);
        assert_eq!(ctx.buffers.as_ref().unwrap().block_size(), 512);
    }

    #[test]
    fn test_slices_are_disjoint() {
        let mut config = memory_config(8 * 512);
        config.test.slices = Some(2);
        let template = IoContext::from_config(&config).unwrap();
        let mut a = IoContext::clone_for_thread(&template, 0, true).unwrap();
        let mut b = IoContext::clone_for_thread(&template, 1, false).unwrap();
        a.initialize().unwrap();
        b.initialize().unwrap();
        assert_eq!(a.seq.as_ref().unwrap().range(), SliceRange { base: 0, blocks: 4 });
        assert_eq!(b.seq.as_ref().unwrap().range(), SliceRange { base: 2048, blocks: 4 });
    }

    #[test]
    fn test_cleanup_twice_is_safe() {
        let mut config = memory_config(4096);
        config.test.dispose = DisposeMode::Delete;
        let template = IoContext::from_config(&config).unwrap();
        let mut ctx = IoContext::clone_for_thread(&template, 0, true).unwrap();
        ctx.initialize().unwrap();
        ctx.open().unwrap();

        ctx.cleanup(Outcome::Success).unwrap();
        assert!(ctx.is_cleaned());
        assert!(ctx.buffers.is_none());
        assert!(!ctx.device.as_ref().unwrap().is_open());
        ctx.cleanup(Outcome::Failure).unwrap();
    }

    #[test]
    fn test_copy_template_has_partner() {
        let mut config = memory_config(4096);
        config.test.mode = Mode::Copy;
        config.test.input = Some("src".into());
        let template = IoContext::from_config(&config).unwrap();
        assert_eq!(template.params.role, Role::Write);
        let partner = template.partner.as_ref().unwrap();
        assert_eq!(partner.params.role, Role::Read);
        assert!(partner.params.shared_device);
    }

    #[test]
    fn test_recreate_clears_output() {
        let config = memory_config(4096);
        let template = IoContext::from_config(&config).unwrap();
        let mut ctx = IoContext::clone_for_thread(&template, 0, true).unwrap();
        ctx.initialize().unwrap();
        ctx.open().unwrap();
        ctx.device.as_mut().unwrap().write(0, &[7u8; 512]).unwrap();

        ctx.recreate().unwrap();
        assert!(ctx.device.as_ref().unwrap().is_open());
        let mut buf = [1u8; 512];
        ctx.device.as_mut().unwrap().read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_error_counters() {
        let mut errors = ErrorCounters::new(2);
        assert!(!errors.record());
        assert!(errors.record());
        assert!(errors.limit_reached());
    }
}
