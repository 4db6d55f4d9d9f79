//! Retry policy for device operations
//!
//! Only failures the device marks retryable are retried; everything else is
//! returned on the first attempt. Delays sleep on the worker's cancel token,
//! so a stop cuts a retry wait short.

use crate::context::IoParams;
use crate::device::{DeviceError, DeviceResult};
use crate::util::cancel::CancelToken;
use std::time::Duration;

/// Retry behaviour for one class of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries)
    pub limit: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(limit: u32, delay: Duration) -> Self {
        Self { limit, delay }
    }

    /// Transport retries
    pub fn transport(params: &IoParams) -> Self {
        Self::new(params.retry_limit, params.retry_delay)
    }

    /// Re-reads of a block that failed to compare
    pub fn corruption(params: &IoParams) -> Self {
        Self::new(params.retry_dc_limit, params.retry_dc_delay)
    }

    /// Run `op` until it succeeds, fails for good, or the retries run out
    ///
    /// `on_retry(attempt, error)` is called before each retry.
    pub fn run<T>(
        &self,
        token: &CancelToken,
        mut op: impl FnMut() -> DeviceResult<T>,
        mut on_retry: impl FnMut(u32, &DeviceError),
    ) -> DeviceResult<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.limit => {
                    attempt += 1;
                    on_retry(attempt, &e);
                    if !token.sleep(self.delay) {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
