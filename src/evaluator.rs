use std::fmt;
use std::str::FromStr;

pub const DEFAULT_CRITICAL_HIGH: i32 = 120;
pub const DEFAULT_CRITICAL_LOW: i32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Normal,
    CriticalHigh,
    CriticalLow,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Normal => "normal",
            Verdict::CriticalHigh => "critical_high",
            Verdict::CriticalLow => "critical_low",
        }
    }

    /// Alert text for a critical verdict; `None` for normal readings.
    pub fn alert_message(self, bpm: i32) -> Option<String> {
        match self {
            Verdict::Normal => None,
            Verdict::CriticalHigh => Some(format!("Critical high heart rate detected: {bpm} bpm")),
            Verdict::CriticalLow => Some(format!("Critical low heart rate detected: {bpm} bpm")),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "normal" => Ok(Verdict::Normal),
            "critical_high" => Ok(Verdict::CriticalHigh),
            "critical_low" => Ok(Verdict::CriticalLow),
            other => Err(format!("unknown verdict {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub high: i32,
    pub low: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: DEFAULT_CRITICAL_HIGH,
            low: DEFAULT_CRITICAL_LOW,
        }
    }
}

/// Classifies heart-rate readings. Both bounds are strict: a reading equal
/// to a threshold is normal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator {
    thresholds: Thresholds,
}

impl Evaluator {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn evaluate(&self, bpm: i32) -> Verdict {
        if bpm > self.thresholds.high {
            Verdict::CriticalHigh
        } else if bpm < self.thresholds.low {
            Verdict::CriticalLow
        } else {
            Verdict::Normal
        }
    }
}
