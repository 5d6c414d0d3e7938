//! Engine-derived classification flags
//!
//! Only flags that are set are serialized, so an untagged record emits `{}`.

use serde::Serialize;

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Boolean classification computed by the tagger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tags {
    /// Basal: temporary rate
    #[serde(skip_serializing_if = "is_false")]
    pub temp: bool,
    /// Basal: delivery suspended
    #[serde(skip_serializing_if = "is_false")]
    pub suspend: bool,
    /// Bolus: entered by hand; SMBG: typed in rather than metered
    #[serde(skip_serializing_if = "is_false")]
    pub manual: bool,
    /// Bolus: issued by an automated controller
    #[serde(skip_serializing_if = "is_false")]
    pub automated: bool,
    /// Bolus: produced by a calculator or dosing decision
    #[serde(skip_serializing_if = "is_false")]
    pub wizard: bool,
    /// Bolus: correction-only dose
    #[serde(skip_serializing_if = "is_false")]
    pub correction: bool,
    /// Bolus: has an extended portion
    #[serde(skip_serializing_if = "is_false")]
    pub extended: bool,
    /// Bolus: delivered less than programmed
    #[serde(skip_serializing_if = "is_false")]
    pub interrupted: bool,
    /// Bolus: more than recommended
    #[serde(rename = "override", skip_serializing_if = "is_false")]
    pub override_: bool,
    /// Bolus: less than recommended
    #[serde(skip_serializing_if = "is_false")]
    pub underride: bool,
    /// SMBG: read from a meter
    #[serde(skip_serializing_if = "is_false")]
    pub meter: bool,
    /// Device event: sensor calibration
    #[serde(skip_serializing_if = "is_false")]
    pub calibration: bool,
    /// Device event: reservoir change
    #[serde(skip_serializing_if = "is_false")]
    pub reservoir_change: bool,
    /// Device event: cannula prime
    #[serde(skip_serializing_if = "is_false")]
    pub cannula_prime: bool,
    /// Device event: tubing prime
    #[serde(skip_serializing_if = "is_false")]
    pub tubing_prime: bool,
    /// Device event: suspend issued by the controller
    #[serde(skip_serializing_if = "is_false")]
    pub automated_suspend: bool,
}

impl Tags {
    /// True when no flag is set
    pub fn is_empty(&self) -> bool {
        *self == Tags::default()
    }

    /// Any of the site-change flags
    pub fn is_site_change(&self) -> bool {
        self.reservoir_change || self.cannula_prime || self.tubing_prime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_set_flags_serialize() {
        let tags = Tags {
            override_: true,
            manual: true,
            ..Tags::default()
        };
        let json = serde_json::to_value(tags).unwrap();
        assert_eq!(json, serde_json::json!({"manual": true, "override": true}));
        assert!(Tags::default().is_empty());
    }
}
