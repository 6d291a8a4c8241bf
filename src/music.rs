//! Musical time primitives shared by requests, commits and tempo handling.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Native ticks per quarter note in the timeline.
pub const PPQ: f64 = 960.0;

/// Tolerance for comparing quarter-note positions.
pub const QN_EPSILON: f64 = 1e-6;

/// A time signature such as 4/4 or 6/8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub num: u32,
    pub denom: u32,
}

impl TimeSignature {
    pub const COMMON: TimeSignature = TimeSignature { num: 4, denom: 4 };

    /// Build a time signature, rejecting zero numerators and non power-of-two denominators.
    pub fn new(num: u32, denom: u32) -> Option<Self> {
        if Self::is_valid(num, denom) {
            Some(Self { num, denom })
        } else {
            None
        }
    }

    pub fn is_valid(num: u32, denom: u32) -> bool {
        (1..=64).contains(&num) && (1..=64).contains(&denom) && denom.is_power_of_two()
    }

    pub fn quarters_per_bar(&self) -> f64 {
        self.num as f64 * 4.0 / self.denom as f64
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::COMMON
    }
}

impl std::fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.denom)
    }
}

impl std::str::FromStr for TimeSignature {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, denom) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| anyhow!("Invalid time signature '{}': expected N/D", s))?;
        let num: u32 = num
            .trim()
            .parse()
            .map_err(|_| anyhow!("Invalid time signature numerator in '{}'", s))?;
        let denom: u32 = denom
            .trim()
            .parse()
            .map_err(|_| anyhow!("Invalid time signature denominator in '{}'", s))?;
        Self::new(num, denom).ok_or_else(|| anyhow!("Invalid time signature '{}'", s))
    }
}

/// A wall-clock time selection in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_sec: f64,
    pub end_sec: f64,
}

impl TimeWindow {
    pub fn new(start_sec: f64, end_sec: f64) -> Self {
        Self { start_sec, end_sec }
    }

    pub fn is_valid(&self) -> bool {
        self.start_sec.is_finite()
            && self.end_sec.is_finite()
            && self.start_sec >= 0.0
            && self.end_sec > self.start_sec
    }

    pub fn length_sec(&self) -> f64 {
        (self.end_sec - self.start_sec).max(0.0)
    }
}

/// A window expressed in absolute quarter notes from the project start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QnWindow {
    pub start_qn: f64,
    pub end_qn: f64,
}

impl QnWindow {
    pub fn length_q(&self) -> f64 {
        (self.end_qn - self.start_qn).max(0.0)
    }

    /// Number of whole bars covered, never less than one.
    pub fn bars(&self, time_sig: TimeSignature) -> u32 {
        let bars = (self.length_q() / time_sig.quarters_per_bar()).round();
        if bars.is_finite() && bars >= 1.0 {
            bars as u32
        } else {
            1
        }
    }
}

/// Convert an absolute quarter-note position to native ticks.
pub fn qn_to_tick(qn: f64) -> i64 {
    (qn * PPQ).round() as i64
}

pub fn tick_to_qn(tick: i64) -> f64 {
    tick as f64 / PPQ
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_signature_parse() {
        let ts: TimeSignature = "6/8".parse().unwrap();
        assert_eq!(ts, TimeSignature { num: 6, denom: 8 });
        assert_eq!(ts.to_string(), "6/8");
        assert!((ts.quarters_per_bar() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_signature_rejects_bad_denominator() {
        assert!("4/3".parse::<TimeSignature>().is_err());
        assert!("0/4".parse::<TimeSignature>().is_err());
        assert!("four".parse::<TimeSignature>().is_err());
    }

    #[test]
    fn test_window_validity() {
        assert!(TimeWindow::new(0.0, 8.0).is_valid());
        assert!(!TimeWindow::new(8.0, 8.0).is_valid());
        assert!(!TimeWindow::new(-1.0, 2.0).is_valid());
        assert!(!TimeWindow::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn test_bars_never_below_one() {
        let w = QnWindow {
            start_qn: 0.0,
            end_qn: 1.0,
        };
        assert_eq!(w.bars(TimeSignature::COMMON), 1);
        let w = QnWindow {
            start_qn: 4.0,
            end_qn: 20.0,
        };
        assert_eq!(w.bars(TimeSignature::COMMON), 4);
    }

    #[test]
    fn test_tick_conversion() {
        assert_eq!(qn_to_tick(1.5), 1440);
        assert!((tick_to_qn(480) - 0.5).abs() < 1e-9);
    }
}
