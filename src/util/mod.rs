//! Shared utilities

pub mod buffer;
pub mod cancel;
pub mod time;
