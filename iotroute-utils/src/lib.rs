//! Small helpers shared by the iotroute crates.
//!
//! - Human-readable durations (`"1h30m"`, `"250ms"`) for configuration files
//! - Serde helpers to read those durations straight into [`Duration`]
//! - [`Counter`], a current/peak gauge for cache sizes and queue depths
//!
//! ```
//! use iotroute_utils::to_duration;
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(to_duration("250ms").as_millis(), 250);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{de::Deserializer, Deserialize};

mod counter;

pub use counter::Counter;

/// Parses a duration made of `<number><unit>` groups.
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. Groups may be chained (`"1h30m15s"`).
/// A bare number is read as seconds. Malformed groups contribute nothing.
///
/// ```
/// let d = iotroute_utils::to_duration("2h15m");
/// assert_eq!(d.as_secs(), 8100);
///
/// assert_eq!(iotroute_utils::to_duration("45").as_secs(), 45);
/// ```
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_ascii_lowercase();
    let mut total_ms: u64 = 0;
    let mut number = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let unit_ms = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            'w' => 604_800_000,
            _ => 0,
        };
        if let Ok(v) = number.parse::<u64>() {
            total_ms = total_ms.saturating_add(v.saturating_mul(unit_ms));
        }
        number.clear();
    }

    if let Ok(v) = number.parse::<u64>() {
        total_ms = total_ms.saturating_add(v.saturating_mul(1_000));
    }

    Duration::from_millis(total_ms)
}

/// Deserialize a [`Duration`] from its human-readable form
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Deserialize an optional [`Duration`]; an empty string or `"0"` means none
#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    let d = to_duration(&v);
    if d.is_zero() {
        Ok(None)
    } else {
        Ok(Some(d))
    }
}
