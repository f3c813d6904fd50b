const BYTE_UNITS: [&str; 9] = ["Bytes", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

/// Human readable byte count with binary units, two decimals at most.
///
/// `0` renders as `"0 Bytes"`, `1536` as `"1.5 KiB"`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut unit = 0;
    let mut scale: u128 = 1;
    while unit + 1 < BYTE_UNITS.len() && u128::from(bytes) >= scale * 1024 {
        scale *= 1024;
        unit += 1;
    }

    let value = bytes as f64 / scale as f64;
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, BYTE_UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_reference_values() {
        assert_eq!(format_bytes(0), "0 Bytes");
        assert_eq!(format_bytes(1), "1 Bytes");
        assert_eq!(format_bytes(1023), "1023 Bytes");
        assert_eq!(format_bytes(1024), "1 KiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(1_073_741_824), "1 GiB");
    }

    #[test]
    fn rounds_to_two_decimals() {
        // 1234567 / 1024^2 = 1.17737...
        assert_eq!(format_bytes(1_234_567), "1.18 MiB");
        assert_eq!(format_bytes(u64::MAX), "16 EiB");
    }
}
