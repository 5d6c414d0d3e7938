//! Derived classification tags
//!
//! Tags are a pure function of a record and its resolved links. The bolus
//! source tags (`manual`, `automated`, `wizard`) are mutually exclusive;
//! every other bolus tag is computed independently, so `override` and
//! `manual` may both be set.

use serde_json::Value;

use super::join::with_dosing_fields;
use crate::record::{
    BgReading, Bolus, BolusSubType, DeliveryType, DeviceEvent, Record, RecordKind, Tags,
};

/// Compute tags for a record
pub fn tag(record: &Record) -> Tags {
    match &record.kind {
        RecordKind::Basal(basal) => Tags {
            temp: basal.delivery_type == DeliveryType::Temp,
            suspend: basal.delivery_type == DeliveryType::Suspend,
            ..Tags::default()
        },
        RecordKind::Bolus(bolus) => tag_bolus(bolus),
        RecordKind::Smbg(reading) => tag_smbg(reading),
        RecordKind::DeviceEvent(event) => tag_device_event(event),
        _ => Tags::default(),
    }
}

fn tag_bolus(stored: &Bolus) -> Tags {
    let bolus = with_dosing_fields(stored);
    let mut tags = Tags::default();

    if bolus.wizard.is_some() || bolus.dosing_decision.is_some() {
        tags.wizard = true;
    } else if bolus.sub_type == BolusSubType::Automated {
        tags.automated = true;
    } else {
        tags.manual = true;
    }

    let wizard = bolus
        .wizard
        .as_ref()
        .and_then(|link| link.resolved())
        .and_then(Record::as_wizard);
    let recommended = wizard.and_then(|w| w.recommended.as_ref());

    if let Some(rec) = recommended {
        let correction = rec.correction.unwrap_or(0.0);
        let carb = rec.carb.unwrap_or(0.0);
        tags.correction = correction > 0.0 && carb == 0.0;
    }

    tags.extended = matches!(bolus.sub_type, BolusSubType::Square | BolusSubType::DualSquare)
        || bolus.extended.unwrap_or(0.0) > 0.0;

    let normal_short = bolus
        .expected_normal
        .is_some_and(|expected| expected > bolus.normal.unwrap_or(0.0));
    let extended_short = bolus
        .expected_extended
        .is_some_and(|expected| expected > bolus.extended.unwrap_or(0.0));
    tags.interrupted = normal_short || extended_short;

    let recommended_net = recommended
        .and_then(|rec| {
            rec.net.or_else(|| match (rec.carb, rec.correction) {
                (None, None) => None,
                (carb, correction) => Some(carb.unwrap_or(0.0) + correction.unwrap_or(0.0)),
            })
        })
        .or_else(|| {
            bolus
                .dosing_decision
                .as_ref()
                .and_then(|dd| match &dd.kind {
                    RecordKind::DosingDecision(decision) => decision.recommended_bolus.as_ref(),
                    _ => None,
                })
                .and_then(|amount| amount.amount)
        });
    if let Some(net) = recommended_net {
        let programmed = bolus.programmed();
        tags.override_ = programmed > net;
        tags.underride = programmed < net;
    }

    tags
}

fn tag_smbg(reading: &BgReading) -> Tags {
    let manual = reading.sub_type.as_deref() == Some("manual");
    Tags {
        manual,
        meter: !manual,
        ..Tags::default()
    }
}

fn tag_device_event(event: &DeviceEvent) -> Tags {
    let sub_type = event.sub_type.as_deref();
    let prime_target = event.prime_target.as_deref();
    let automated_suspend = sub_type == Some("status")
        && event.status.as_deref() == Some("suspended")
        && (event
            .reason
            .as_ref()
            .and_then(|r| r.get("suspended"))
            .and_then(Value::as_str)
            == Some("automatic")
            || event
                .payload
                .as_ref()
                .and_then(|p| p.get("cause"))
                .and_then(Value::as_str)
                == Some("auto_suspend"));

    Tags {
        calibration: sub_type == Some("calibration"),
        reservoir_change: sub_type == Some("reservoirChange"),
        cannula_prime: sub_type == Some("prime") && prime_target == Some("cannula"),
        tubing_prime: sub_type == Some("prime") && prime_target == Some("tubing"),
        automated_suspend,
        ..Tags::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Basal, Link, Recommended, Wizard};
    use serde_json::json;

    fn bolus_record(bolus: Bolus) -> Record {
        Record::new("b", 0, RecordKind::Bolus(bolus))
    }

    fn wizard_link(recommended: Recommended) -> Option<Link> {
        let wizard = Wizard {
            recommended: Some(recommended),
            ..Wizard::default()
        };
        Some(Link::Resolved(Box::new(Record::new(
            "w",
            0,
            RecordKind::Wizard(wizard),
        ))))
    }

    #[test]
    fn test_interrupted() {
        let tags = tag(&bolus_record(Bolus {
            normal: Some(60.0),
            expected_normal: Some(80.0),
            ..Bolus::default()
        }));
        assert!(tags.interrupted);
        assert!(tags.manual);
        assert!(!tags.wizard);
    }

    #[test]
    fn test_source_tags_exclusive() {
        let automated = tag(&bolus_record(Bolus {
            sub_type: BolusSubType::Automated,
            normal: Some(0.3),
            ..Bolus::default()
        }));
        assert!(automated.automated && !automated.manual && !automated.wizard);

        let wizard = tag(&bolus_record(Bolus {
            sub_type: BolusSubType::Automated,
            wizard: Some(Link::Id("w".to_string())),
            ..Bolus::default()
        }));
        assert!(wizard.wizard && !wizard.automated && !wizard.manual);
    }

    #[test]
    fn test_correction_and_override() {
        let tags = tag(&bolus_record(Bolus {
            normal: Some(3.0),
            wizard: wizard_link(Recommended {
                correction: Some(2.0),
                carb: Some(0.0),
                net: Some(2.0),
                ..Recommended::default()
            }),
            ..Bolus::default()
        }));
        assert!(tags.correction);
        assert!(tags.override_);
        assert!(!tags.underride);
        assert!(tags.wizard);
    }

    #[test]
    fn test_underride_without_correction() {
        let tags = tag(&bolus_record(Bolus {
            normal: Some(1.0),
            wizard: wizard_link(Recommended {
                carb: Some(2.0),
                correction: Some(0.5),
                ..Recommended::default()
            }),
            ..Bolus::default()
        }));
        assert!(!tags.correction);
        assert!(tags.underride);
    }

    #[test]
    fn test_extended() {
        let tags = tag(&bolus_record(Bolus {
            sub_type: BolusSubType::DualSquare,
            normal: Some(1.0),
            extended: Some(1.0),
            ..Bolus::default()
        }));
        assert!(tags.extended);
    }

    #[test]
    fn test_basal_tags() {
        let tags = tag(&Record::new(
            "t",
            0,
            RecordKind::Basal(Basal {
                delivery_type: DeliveryType::Temp,
                ..Basal::default()
            }),
        ));
        assert!(tags.temp && !tags.suspend);
    }

    #[test]
    fn test_smbg_tags() {
        let manual = tag(&Record::new(
            "s",
            0,
            RecordKind::Smbg(BgReading {
                value: 100.0,
                sub_type: Some("manual".to_string()),
                ..BgReading::default()
            }),
        ));
        assert!(manual.manual && !manual.meter);
    }

    #[test]
    fn test_device_event_tags() {
        let event = |value: serde_json::Value| {
            let event: DeviceEvent = serde_json::from_value(value).unwrap();
            tag(&Record::new("e", 0, RecordKind::DeviceEvent(event)))
        };
        assert!(event(json!({"subType": "calibration", "value": 100})).calibration);
        assert!(event(json!({"subType": "reservoirChange"})).reservoir_change);
        assert!(event(json!({"subType": "prime", "primeTarget": "tubing"})).tubing_prime);
        assert!(event(json!({"subType": "prime", "primeTarget": "cannula"})).cannula_prime);
        assert!(
            event(json!({"subType": "status", "status": "suspended", "reason": {"suspended": "automatic"}}))
                .automated_suspend
        );
        assert!(
            event(json!({"subType": "status", "status": "suspended", "payload": {"cause": "auto_suspend"}}))
                .automated_suspend
        );
        assert!(
            !event(json!({"subType": "status", "status": "suspended", "reason": {"suspended": "manual"}}))
                .automated_suspend
        );
    }
}
