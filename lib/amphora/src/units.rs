// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-size parsing and rendering for config values and progress output.
//! Accepts both SI (kB, 1000-based) and IEC (KiB, 1024-based) suffixes;
//! a bare number means bytes.

/// Parses a human byte-size string (`"10GiB"`, `"500MB"`, `"4096"`).
/// An empty string parses as zero. Errors carry a message suitable for
/// per-key config reporting.
pub fn parse_byte_size(value: &str) -> Result<i64, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }

    let split =
        value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let number: i64 = digits
        .parse()
        .map_err(|_| format!("invalid byte size {value:?}"))?;

    let multiplier: i64 = match suffix.trim() {
        "" | "B" => 1,
        "kB" => 1000,
        "MB" => 1000i64.pow(2),
        "GB" => 1000i64.pow(3),
        "TB" => 1000i64.pow(4),
        "PB" => 1000i64.pow(5),
        "EB" => 1000i64.pow(6),
        "KiB" => 1024,
        "MiB" => 1024i64.pow(2),
        "GiB" => 1024i64.pow(3),
        "TiB" => 1024i64.pow(4),
        "PiB" => 1024i64.pow(5),
        "EiB" => 1024i64.pow(6),
        other => return Err(format!("invalid byte size suffix {other:?}")),
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size {value:?} out of range"))
}

/// Renders a byte count with an SI suffix, e.g. `"1.50GB"`.
pub fn byte_size_string(bytes: i64, precision: usize) -> String {
    if bytes < 1000 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    for suffix in ["kB", "MB", "GB", "TB", "PB", "EB"] {
        value /= 1000.0;
        if value < 1000.0 {
            return format!("{value:.precision$}{suffix}");
        }
    }
    format!("{value:.precision$}EB")
}
