//! Time and rate formatting helpers
//!
//! Used by keepalive messages, no-progress diagnostics, and the final report.

use std::time::Duration;

const BINARY_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
const DECIMAL_SUFFIXES: [&str; 4] = ["", "K", "M", "G"];

/// Short latency-style rendering: `ns` below a microsecond, then two
/// decimals in the largest unit that keeps the value at or above one
///
/// ```
/// use std::time::Duration;
/// use iovet::util::time::format_duration;
///
/// assert_eq!(format_duration(Duration::from_nanos(800)), "800ns");
/// assert_eq!(format_duration(Duration::from_micros(3250)), "3.25ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    let (scale, unit) = match nanos {
        n if n < 1_000_000 => (1e3, "us"),
        n if n < 1_000_000_000 => (1e6, "ms"),
        _ => (1e9, "s"),
    };
    format!("{:.2}{}", nanos as f64 / scale, unit)
}

/// Wall time as `1h02m03s`, `4m05s` or `6.78s`
pub fn format_elapsed(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{}.{:02}s", s, duration.subsec_millis() / 10),
        (0, _) => format!("{}m{:02}s", m, s),
        _ => format!("{}h{:02}m{:02}s", h, m, s),
    }
}

/// Bytes per second over `duration`; zero for an empty interval
pub fn calculate_throughput(bytes: u64, duration: Duration) -> f64 {
    match duration.as_secs_f64() {
        secs if secs > 0.0 => bytes as f64 / secs,
        _ => 0.0,
    }
}

/// Records (or any count) per second over `duration`
pub fn calculate_rate(count: u64, duration: Duration) -> f64 {
    calculate_throughput(count, duration)
}

/// ```
/// use iovet::util::time::format_throughput;
///
/// assert_eq!(format_throughput(2_621_440.0), "2.50 MB/s");
/// ```
pub fn format_throughput(bytes_per_sec: f64) -> String {
    format!("{}/s", scale_binary(bytes_per_sec))
}

pub fn format_bytes(bytes: u64) -> String {
    scale_binary(bytes as f64)
}

fn scale_binary(mut value: f64) -> String {
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < BINARY_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, BINARY_UNITS[unit])
}

/// Operation rate with a K/M/G suffix; whole numbers below a thousand
pub fn format_rate(mut rate: f64) -> String {
    if rate < 1_000.0 {
        return format!("{:.0}", rate);
    }
    let mut suffix = 0;
    while rate >= 1_000.0 && suffix + 1 < DECIMAL_SUFFIXES.len() {
        rate /= 1_000.0;
        suffix += 1;
    }
    format!("{:.2}{}", rate, DECIMAL_SUFFIXES[suffix])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_units() {
        assert_eq!(format_duration(Duration::from_nanos(999)), "999ns");
        assert_eq!(format_duration(Duration::from_nanos(1_000)), "1.00us");
        assert_eq!(format_duration(Duration::from_micros(40)), "40.00us");
        assert_eq!(format_duration(Duration::from_millis(12)), "12.00ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "90.00s");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(2500)), "2.50s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m05s");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 61)), "3h01m01s");
    }

    #[test]
    fn test_rate_suffixes() {
        assert_eq!(format_rate(42.4), "42");
        assert_eq!(format_rate(12_500.0), "12.50K");
        assert_eq!(format_rate(2_000_000.0), "2.00M");
        assert_eq!(format_rate(7e12), "7000.00G");
    }

    #[test]
    fn test_throughput_of_empty_interval() {
        assert_eq!(calculate_throughput(4096, Duration::ZERO), 0.0);
        assert_eq!(calculate_throughput(8192, Duration::from_secs(2)), 4096.0);
    }

    #[test]
    fn test_binary_scaling() {
        assert_eq!(format_bytes(100), "100.00 B");
        assert_eq!(format_bytes(409_600), "400.00 KB");
        assert_eq!(format_throughput(3.0 * 1024.0 * 1024.0 * 1024.0), "3.00 GB/s");
        assert_eq!(format_bytes(5 << 50), "5120.00 TB");
    }
}
