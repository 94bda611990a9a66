//! Human-readable byte counts for `/stats`.

/// Format a byte count with binary units (`K`, `M`, `G`, `T`), two decimals,
/// and a trailing `.00` dropped.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];

    if bytes == 0 {
        return "0".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{value:.2}");
    let trimmed = formatted.strip_suffix(".00").unwrap_or(&formatted);
    format!("{trimmed}{}", UNITS[unit])
}
