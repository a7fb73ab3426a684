//! Provides formatting helpers for byte sizes.
//!
//! Cache budgets and allocations are reported in log messages and diagnostic commands. To keep
//! these readable, sizes are rendered with an appropriate binary unit instead of raw byte
//! counts.

/// Formats a given size in bytes.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// Note that a helper function [format_size](format_size) is also provided
/// which directly returns a String.
pub fn format_bytes(size_in_bytes: usize, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if size_in_bytes == 1 {
        return write!(f, "1 byte");
    } else if size_in_bytes < 1024 {
        return write!(f, "{} bytes", size_in_bytes);
    }

    let mut magnitude = 0;
    let mut size = size_in_bytes as f32;
    while size > 1024. && magnitude < 5 {
        size /= 1024.;
        magnitude += 1;
    }

    if size <= 10. {
        write!(f, "{:.2} ", size)?;
    } else if size <= 100. {
        write!(f, "{:.1} ", size)?;
    } else {
        write!(f, "{:.0} ", size)?;
    }

    match magnitude {
        0 => write!(f, "Bytes"),
        1 => write!(f, "KiB"),
        2 => write!(f, "MiB"),
        3 => write!(f, "GiB"),
        4 => write!(f, "TiB"),
        _ => write!(f, "PiB"),
    }
}

/// Formats a given size in bytes and returns the result as String.
///
/// # Examples
///
/// ```
/// assert_eq!(ganymede::fmt::format_size(0), "0 bytes");
/// assert_eq!(ganymede::fmt::format_size(1), "1 byte");
/// assert_eq!(ganymede::fmt::format_size(512), "512 bytes");
/// assert_eq!(ganymede::fmt::format_size(2048), "2.00 KiB");
/// assert_eq!(ganymede::fmt::format_size(64 * 1024 * 1024), "64.0 MiB");
/// assert_eq!(ganymede::fmt::format_size(873_400_000), "833 MiB");
/// assert_eq!(ganymede::fmt::format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    let mut result = String::new();
    let _ = format_bytes(size_in_bytes, &mut result);

    result
}
