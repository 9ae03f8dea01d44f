//! Poll interval expressions.
//!
//! Accepted forms:
//! - `30s`, `5m`, `1h` and plain seconds (`120`)
//! - cron-style minute steps: `H/2 * * * *` or `*/2 * * * *`

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;

use crate::domain::{GantryError, Result};

/// Interval used when a pipeline file does not set `poll`.
pub const DEFAULT_POLL: Duration = Duration::from_secs(120);

/// A fixed polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    interval: Duration,
}

const DURATION_PATTERN: &str = r"^(\d+)\s*(s|m|h)?$";
const CRON_STEP_PATTERN: &str = r"^(?:H|\*)/(\d+)\s+\*\s+\*\s+\*\s+\*$";

fn pattern(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| GantryError::Schedule(e.to_string()))
}

impl PollSchedule {
    pub fn every(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let invalid = |why: &str| GantryError::Schedule(format!("{expr:?}: {why}"));

        let secs = if let Some(caps) = pattern(DURATION_PATTERN)?.captures(expr) {
            let n: u64 = caps[1].parse().map_err(|_| invalid("number out of range"))?;
            let unit = match caps.get(2).map(|m| m.as_str()) {
                Some("m") => 60,
                Some("h") => 3600,
                _ => 1,
            };
            n.checked_mul(unit).ok_or_else(|| invalid("interval too large"))?
        } else if let Some(caps) = pattern(CRON_STEP_PATTERN)?.captures(expr) {
            let n: u64 = caps[1].parse().map_err(|_| invalid("number out of range"))?;
            if n > 59 {
                return Err(invalid("minute step must be below 60"));
            }
            n * 60
        } else {
            return Err(invalid("expected 30s, 5m, 1h, seconds, or H/N * * * *"));
        };

        if secs == 0 {
            return Err(invalid("interval must be positive"));
        }
        Ok(Self::every(Duration::from_secs(secs)))
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::every(DEFAULT_POLL)
    }
}

impl FromStr for PollSchedule {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PollSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.interval.as_secs();
        if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}
