//! # Config
//!
//! Shared configuration conventions: the dedup window and the duration strings
//! it is configured with.
use std::str::FromStr;
use std::time;

use thiserror::Error;
use tracing::warn;

pub const DEFAULT_DEDUP_WINDOW: time::Duration = time::Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0:?} is not a valid duration, expected e.g. 500ms, 30s, 15m, 24h or 7d")]
pub struct ParseDurationError(pub String);

/// Parse a duration string such as `"24h"`. Supported units are `ms`, `s`, `m`,
/// `h` and `d`; a bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<time::Duration, ParseDurationError> {
    let trimmed = s.trim();
    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (amount, unit) = trimmed.split_at(split_at);

    let amount: u64 = amount
        .parse()
        .map_err(|_| ParseDurationError(s.to_owned()))?;

    let seconds_per_unit = match unit.trim() {
        "ms" => return Ok(time::Duration::from_millis(amount)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(ParseDurationError(s.to_owned())),
    };

    amount
        .checked_mul(seconds_per_unit)
        .map(time::Duration::from_secs)
        .ok_or_else(|| ParseDurationError(s.to_owned()))
}

/// How long a fingerprint's view of an entity suppresses further counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupWindow(pub time::Duration);

impl DedupWindow {
    /// Resolve the configured window, falling back to the default when unset or
    /// invalid. A misconfigured window must not stop views from being counted.
    pub fn resolve(configured: Option<&str>) -> Self {
        match configured.map(str::trim).filter(|s| !s.is_empty()) {
            None => Self::default(),
            Some(value) => match value.parse::<DedupWindow>() {
                Ok(window) => window,
                Err(error) => {
                    warn!(
                        %error,
                        default_secs = DEFAULT_DEDUP_WINDOW.as_secs(),
                        "invalid dedup window, using default"
                    );
                    Self::default()
                }
            },
        }
    }

    pub fn as_duration(&self) -> time::Duration {
        self.0
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self(DEFAULT_DEDUP_WINDOW)
    }
}

impl FromStr for DedupWindow {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(DedupWindow)
    }
}
