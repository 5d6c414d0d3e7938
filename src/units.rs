//! Blood glucose units and display preferences
//!
//! Glucose values are converted between mg/dL and mmol/L with the factor
//! 18.01559. Converted values are clamped at zero and left unrounded so a
//! round trip reproduces the input within floating point tolerance.

use serde::{Deserialize, Serialize};

/// mg/dL per mmol/L
pub const MGDL_PER_MMOLL: f64 = 18.01559;

/// Glucose unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BgUnits {
    /// Milligrams per decilitre
    #[default]
    #[serde(rename = "mg/dL")]
    MgDl,
    /// Millimoles per litre
    #[serde(rename = "mmol/L")]
    MmolL,
}

impl BgUnits {
    /// Parse the unit strings devices emit (`mg/dL`, `mmol/L`, case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mg/dl" | "mgdl" => Some(BgUnits::MgDl),
            "mmol/l" | "mmoll" => Some(BgUnits::MmolL),
            _ => None,
        }
    }

    /// Canonical string form
    pub fn as_str(&self) -> &'static str {
        match self {
            BgUnits::MgDl => "mg/dL",
            BgUnits::MmolL => "mmol/L",
        }
    }
}

/// Convert a glucose value between units, clamped at zero
pub fn convert_bg(value: f64, from: BgUnits, to: BgUnits) -> f64 {
    let converted = match (from, to) {
        (BgUnits::MmolL, BgUnits::MgDl) => value * MGDL_PER_MMOLL,
        (BgUnits::MgDl, BgUnits::MmolL) => value / MGDL_PER_MMOLL,
        _ => value,
    };
    converted.max(0.0)
}

/// Glucose thresholds used to classify readings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BgBounds {
    /// Upper bound of the very-low band
    pub very_low_threshold: f64,
    /// Lower bound of the target range
    pub target_lower_bound: f64,
    /// Upper bound of the target range
    pub target_upper_bound: f64,
    /// Lower bound of the very-high band
    pub very_high_threshold: f64,
    /// Values above this are displayed clamped
    pub clamp_threshold: f64,
}

impl BgBounds {
    /// Default bounds for a display unit
    pub fn defaults_for(units: BgUnits) -> Self {
        match units {
            BgUnits::MgDl => Self {
                very_low_threshold: 54.0,
                target_lower_bound: 70.0,
                target_upper_bound: 180.0,
                very_high_threshold: 250.0,
                clamp_threshold: 600.0,
            },
            BgUnits::MmolL => Self {
                very_low_threshold: 3.0,
                target_lower_bound: 3.9,
                target_upper_bound: 10.0,
                very_high_threshold: 13.9,
                clamp_threshold: 33.3,
            },
        }
    }

    /// Classify a value already expressed in the bounds' unit
    pub fn classify(&self, value: f64) -> BgClass {
        if value < self.very_low_threshold {
            BgClass::VeryLow
        } else if value < self.target_lower_bound {
            BgClass::Low
        } else if value <= self.target_upper_bound {
            BgClass::Target
        } else if value <= self.very_high_threshold {
            BgClass::High
        } else {
            BgClass::VeryHigh
        }
    }
}

/// Glucose classification band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BgClass {
    /// Below the very-low threshold
    VeryLow,
    /// Below target
    Low,
    /// Inside target
    Target,
    /// Above target
    High,
    /// Above the very-high threshold
    VeryHigh,
}

/// Glucose display preferences
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BgPrefs {
    /// Display unit
    pub bg_units: BgUnits,
    /// Classification bounds, in `bg_units`
    pub bg_bounds: BgBounds,
}

impl BgPrefs {
    /// Preferences for a unit with its default bounds
    pub fn for_units(units: BgUnits) -> Self {
        Self {
            bg_units: units,
            bg_bounds: BgBounds::defaults_for(units),
        }
    }
}

impl Default for BgPrefs {
    fn default() -> Self {
        Self::for_units(BgUnits::MgDl)
    }
}

/// Partial preferences as accepted in query options
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BgPrefsInput {
    /// Display unit
    #[serde(default)]
    pub bg_units: Option<BgUnits>,
    /// Classification bounds; defaults follow the unit
    #[serde(default)]
    pub bg_bounds: Option<BgBounds>,
}

impl BgPrefsInput {
    /// Fill missing pieces with defaults
    pub fn resolve(&self) -> BgPrefs {
        let units = self.bg_units.unwrap_or_default();
        BgPrefs {
            bg_units: units,
            bg_bounds: self.bg_bounds.unwrap_or_else(|| BgBounds::defaults_for(units)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_180() {
        let mmol = convert_bg(180.0, BgUnits::MgDl, BgUnits::MmolL);
        let back = convert_bg(mmol, BgUnits::MmolL, BgUnits::MgDl);
        assert!((back - 180.0).abs() < 1e-9);
        assert!((mmol - 9.991346).abs() < 1e-5);
    }

    #[test]
    fn test_negative_clamped() {
        assert_eq!(convert_bg(-2.0, BgUnits::MmolL, BgUnits::MgDl), 0.0);
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(BgUnits::parse("mmol/L"), Some(BgUnits::MmolL));
        assert_eq!(BgUnits::parse("MG/DL"), Some(BgUnits::MgDl));
        assert_eq!(BgUnits::parse("stones"), None);
    }

    #[test]
    fn test_classify() {
        let bounds = BgBounds::defaults_for(BgUnits::MgDl);
        assert_eq!(bounds.classify(40.0), BgClass::VeryLow);
        assert_eq!(bounds.classify(60.0), BgClass::Low);
        assert_eq!(bounds.classify(180.0), BgClass::Target);
        assert_eq!(bounds.classify(200.0), BgClass::High);
        assert_eq!(bounds.classify(300.0), BgClass::VeryHigh);
    }

    #[test]
    fn test_prefs_input_defaults_follow_units() {
        let input = BgPrefsInput {
            bg_units: Some(BgUnits::MmolL),
            bg_bounds: None,
        };
        let prefs = input.resolve();
        assert_eq!(prefs.bg_bounds.target_upper_bound, 10.0);
    }
}
