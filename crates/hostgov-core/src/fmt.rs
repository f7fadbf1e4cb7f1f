//! Human-readable formatting for log lines and the daemon report.
//!
//! Byte sizes use binary units. Every function here is pure.

use std::time::Duration;

use crate::metering::{ResourceKind, ResourceUsage};

/// Short table-style output vs spelled-out log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmtStyle {
    /// No spaces, one-letter suffixes (`"1.5G"`, `"3m5s"`)
    Compact,
    /// Spaces and IEC suffixes (`"1.5 GiB"`, `"3m 5s"`)
    Detail,
}

const UNITS: [(u64, &str, &str); 4] = [
    (1 << 40, "T", " TiB"),
    (1 << 30, "G", " GiB"),
    (1 << 20, "M", " MiB"),
    (1 << 10, "K", " KiB"),
];

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Format a byte count.
///
/// Compact: `"1.5G"`, `"50.0K"`, `"512B"`
/// Detail:  `"1.5 GiB"`, `"50.0 KiB"`, `"512 B"`
pub fn format_bytes(bytes: u64, style: FmtStyle) -> String {
    for (scale, compact, detail) in UNITS {
        if bytes >= scale {
            let suffix = match style {
                FmtStyle::Compact => compact,
                FmtStyle::Detail => detail,
            };
            return format!("{:.1}{}", bytes as f64 / scale as f64, suffix);
        }
    }
    match style {
        FmtStyle::Compact => format!("{}B", bytes),
        FmtStyle::Detail => format!("{} B", bytes),
    }
}

/// Format a signed byte difference, always carrying a sign.
pub fn format_bytes_delta(delta: i64, style: FmtStyle) -> String {
    let sign = if delta < 0 { "-" } else { "+" };
    format!("{}{}", sign, format_bytes(delta.unsigned_abs(), style))
}

/// Format a duration at second resolution; sub-second durations print in ms.
///
/// Compact: `"250ms"`, `"45s"`, `"3m5s"`, `"2h10m"`, `"1d4h"`
/// Detail:  `"250ms"`, `"45s"`, `"3m 5s"`, `"2h 10m"`, `"1d 4h"`
pub fn format_duration(d: Duration, style: FmtStyle) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    let sep = match style {
        FmtStyle::Compact => "",
        FmtStyle::Detail => " ",
    };
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}{}s", secs / 60, sep, secs % 60)
    } else if secs < 86400 {
        format!("{}h{}{}m", secs / 3600, sep, (secs % 3600) / 60)
    } else {
        format!("{}d{}{}h", secs / 86400, sep, (secs % 86400) / 3600)
    }
}

/// `"42.5%"`; NaN and negatives print as `"0.0%"`.
pub fn format_percent(value: f64) -> String {
    if value.is_nan() || value < 0.0 {
        return "0.0%".to_string();
    }
    format!("{:.1}%", value)
}

/// Format a value in the unit limits of `kind` are expressed in: CPU as a
/// percent, everything else as bytes.
pub fn format_limit_value(kind: ResourceKind, value: u64) -> String {
    match kind {
        ResourceKind::Cpu => format!("{}%", value),
        _ => format_bytes(value, FmtStyle::Detail),
    }
}

/// One-line summary of a snapshot for periodic logging.
///
/// `cpu 12.5% mem 1.5G (3.1%) disk 40.0G (28.0%) net 1.2M/300.0K fds 6`
pub fn usage_line(usage: &ResourceUsage) -> String {
    format!(
        "cpu {} mem {} ({}) disk {} ({}) net {}/{} fds {}",
        format_percent(usage.cpu.usage),
        format_bytes(usage.memory.usage, FmtStyle::Compact),
        format_percent(usage.memory.percent),
        format_bytes(usage.disk.usage, FmtStyle::Compact),
        format_percent(usage.disk.percent),
        format_bytes(usage.network.bytes_sent, FmtStyle::Compact),
        format_bytes(usage.network.bytes_recv, FmtStyle::Compact),
        usage.process.descriptors,
    )
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Parse a byte size such as `"512"`, `"64K"`, `"1.5G"` or `"2 GiB"`.
/// Suffixes are binary and case-insensitive.
pub fn parse_bytes(input: &str) -> Result<u64, String> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid size: {:?}", input))?;
    let scale: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        other => return Err(format!("unknown size suffix {:?} in {:?}", other, input)),
    };
    let bytes = number * scale as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(format!("size out of range: {:?}", input));
    }
    Ok(bytes.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512, FmtStyle::Compact), "512B");
        assert_eq!(format_bytes(512, FmtStyle::Detail), "512 B");
        assert_eq!(format_bytes(51_200, FmtStyle::Compact), "50.0K");
        assert_eq!(format_bytes(3 << 29, FmtStyle::Compact), "1.5G");
        assert_eq!(format_bytes(3 << 29, FmtStyle::Detail), "1.5 GiB");
        assert_eq!(format_bytes(2 << 40, FmtStyle::Detail), "2.0 TiB");
    }

    #[test]
    fn test_format_bytes_delta() {
        assert_eq!(format_bytes_delta(-2048, FmtStyle::Compact), "-2.0K");
        assert_eq!(format_bytes_delta(0, FmtStyle::Compact), "+0B");
        assert_eq!(format_bytes_delta(i64::MIN, FmtStyle::Compact), "-8388608.0T");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250), FmtStyle::Compact), "250ms");
        assert_eq!(format_duration(Duration::from_secs(45), FmtStyle::Detail), "45s");
        assert_eq!(format_duration(Duration::from_secs(185), FmtStyle::Compact), "3m5s");
        assert_eq!(format_duration(Duration::from_secs(185), FmtStyle::Detail), "3m 5s");
        assert_eq!(format_duration(Duration::from_secs(7800), FmtStyle::Compact), "2h10m");
        assert_eq!(format_duration(Duration::from_secs(100_800), FmtStyle::Detail), "1d 4h");
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(42.46), "42.5%");
        assert_eq!(format_percent(-1.0), "0.0%");
        assert_eq!(format_percent(f64::NAN), "0.0%");
    }

    #[test]
    fn test_format_limit_value() {
        assert_eq!(format_limit_value(ResourceKind::Cpu, 80), "80%");
        assert_eq!(format_limit_value(ResourceKind::Memory, 1 << 30), "1.0 GiB");
    }

    #[test]
    fn test_usage_line() {
        let mut usage = ResourceUsage::default();
        usage.cpu.usage = 12.5;
        usage.memory.usage = 3 << 29;
        usage.memory.percent = 3.1;
        usage.disk.usage = 40 << 30;
        usage.disk.percent = 28.0;
        usage.network.bytes_sent = 1_258_291;
        usage.network.bytes_recv = 307_200;
        usage.process.descriptors = 6;
        assert_eq!(
            usage_line(&usage),
            "cpu 12.5% mem 1.5G (3.1%) disk 40.0G (28.0%) net 1.2M/300.0K fds 6"
        );
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("64K").unwrap(), 65_536);
        assert_eq!(parse_bytes("1.5g").unwrap(), 3 << 29);
        assert_eq!(parse_bytes(" 2 GiB ").unwrap(), 2 << 30);
        assert_eq!(parse_bytes("1tb").unwrap(), 1 << 40);
    }

    #[test]
    fn test_parse_bytes_rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("G").is_err());
        assert!(parse_bytes("12X").is_err());
        assert!(parse_bytes("1.2.3M").is_err());
    }
}
