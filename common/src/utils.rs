//! Common Utilities
//!
//! Provides utility functions used across the UE implementation

use bytes::Bytes;
use std::time::Duration;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex preview of the first `max` bytes of a payload, for trace logs
pub fn payload_preview(data: &Bytes, max: usize) -> String {
    let shown = data.len().min(max);
    let mut out = bytes_to_hex(&data[..shown]);
    if data.len() > shown {
        out.push_str(&format!(" .. ({} bytes)", data.len()));
    }
    out
}

/// Throughput in Mbit/s of `bytes` delivered over `period`
pub fn throughput_mbps(bytes: u64, period: Duration) -> f64 {
    let secs = period.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs / 1e6
}

/// Time utilities for virtual-time bookkeeping
pub mod time {
    use std::time::Duration;

    /// Render a virtual timestamp as seconds with microsecond precision
    pub fn format_sim_time(t: Duration) -> String {
        format!("{:.6}s", t.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_payload_preview_truncates() {
        let data = Bytes::from_static(&[1, 2, 3, 4, 5]);
        assert_eq!(payload_preview(&data, 2), "01 02 .. (5 bytes)");
        assert_eq!(payload_preview(&data, 8), "01 02 03 04 05");
    }

    #[test]
    fn test_throughput() {
        assert!((throughput_mbps(125_000, Duration::from_millis(100)) - 10.0).abs() < 1e-9);
        assert_eq!(throughput_mbps(1, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_format_sim_time() {
        assert_eq!(time::format_sim_time(Duration::from_millis(1500)), "1.500000s");
    }
}
