//! Final reports: a text summary on stdout and an optional JSON document

pub mod json;
pub mod text;
