//! Device inventory and upload summaries
//!
//! Everything here is derived from the index on demand; the metadata cache
//! stores the results between mutations.

use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::index::{RecordIndex, TimeField};
use crate::record::{RecordType, Upload};

lazy_static! {
    /// Tandem device ids: `tandem<serial>` or `tandemCIQ<serial>`
    static ref TANDEM_DEVICE: Regex =
        Regex::new(r"^tandem(CIQ)?(\d+)").expect("tandem device pattern is valid");
}

/// Known device id prefixes and their display labels
const DEVICE_LABELS: &[(&str, &str)] = &[
    ("tandemCIQ", "Tandem t:slim X2 with Control-IQ"),
    ("tandem", "Tandem"),
    ("InsOmn", "Insulet OmniPod"),
    ("MMT-", "Medtronic MiniMed"),
    ("DexG6", "Dexcom G6"),
    ("DexG5", "Dexcom G5"),
    ("DexG4", "Dexcom G4"),
    ("DexHealthKit", "Dexcom API"),
    ("AbbottFreeStyleLibre", "FreeStyle Libre"),
];

/// Manufacturer and model capabilities of automated pumps
struct PumpCapabilities {
    manufacturer: &'static str,
    /// `None` covers every model
    models: Option<&'static [&'static str]>,
    automated_basal: bool,
    automated_bolus: bool,
    settings_override: bool,
}

const PUMP_CAPABILITIES: &[PumpCapabilities] = &[
    PumpCapabilities {
        manufacturer: "medtronic",
        models: Some(&["1580", "1581", "1582", "1780", "1781", "1782"]),
        automated_basal: true,
        automated_bolus: false,
        settings_override: false,
    },
    PumpCapabilities {
        manufacturer: "tandem",
        models: None,
        automated_basal: true,
        automated_bolus: true,
        settings_override: true,
    },
    PumpCapabilities {
        manufacturer: "insulet",
        models: Some(&["Omnipod 5"]),
        automated_basal: true,
        automated_bolus: false,
        settings_override: false,
    },
];

// ============================================================================
// Devices
// ============================================================================

/// One device that contributed data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device id as sent by the uploader
    pub id: String,
    /// Human-readable label
    pub label: String,
    /// Serial number, when an upload reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Delivers insulin
    pub pump: bool,
    /// Continuous glucose monitor
    pub cgm: bool,
    /// Blood glucose meter
    pub bgm: bool,
}

/// Build the device list and the ids that should be hidden by default
///
/// A plain Tandem entry is hidden when a Control-IQ entry for the same
/// serial exists; both ids describe the same pump.
pub fn inventory(index: &RecordIndex) -> (Vec<Device>, Vec<String>) {
    let uploads = uploads_by_device(index);
    let not_rejected = index.all().and_not(index.rejected());
    let pump_data = index.of_types(&[RecordType::Basal, RecordType::Bolus]);

    let mut devices = Vec::new();
    for device_id in index.device_ids() {
        let of_device = index
            .of_devices(std::iter::once(device_id))
            .and(&not_rejected);
        if of_device.is_empty() {
            continue;
        }
        let upload = uploads.get(device_id.as_str()).copied();
        let tagged = |tag: &str| upload.is_some_and(|u| u.device_tags.iter().any(|t| t == tag));
        let has = |bitmap: &crate::index::SlotBitmap| !of_device.and(bitmap).is_empty();

        devices.push(Device {
            id: device_id.clone(),
            label: label_for(device_id, upload),
            serial_number: upload.and_then(|u| u.device_serial_number.clone()),
            pump: tagged("insulin-pump") || has(&pump_data),
            cgm: tagged("cgm") || has(index.of_type(&RecordType::Cbg)),
            bgm: tagged("bgm") || has(index.of_type(&RecordType::Smbg)),
        });
    }

    let excluded = superseded_tandem_ids(devices.iter().map(|d| d.id.as_str()));
    (devices, excluded)
}

fn label_for(device_id: &str, upload: Option<&Upload>) -> String {
    if let Some((_, label)) = DEVICE_LABELS
        .iter()
        .find(|(prefix, _)| device_id.starts_with(prefix))
    {
        return (*label).to_string();
    }
    upload
        .and_then(|u| {
            let manufacturer = u.device_manufacturers.first()?;
            Some(match &u.device_model {
                Some(model) => format!("{} {}", manufacturer, model),
                None => manufacturer.clone(),
            })
        })
        .unwrap_or_else(|| device_id.to_string())
}

/// Plain Tandem ids whose serial also appears under a Control-IQ id
pub fn superseded_tandem_ids<'a, I: IntoIterator<Item = &'a str>>(ids: I) -> Vec<String> {
    let mut control_iq_serials = BTreeSet::new();
    let mut plain = Vec::new();
    for id in ids {
        let Some(caps) = TANDEM_DEVICE.captures(id) else {
            continue;
        };
        let serial = caps.get(2).map_or("", |m| m.as_str()).to_string();
        if caps.get(1).is_some() {
            control_iq_serials.insert(serial);
        } else {
            plain.push((id.to_string(), serial));
        }
    }
    plain
        .into_iter()
        .filter(|(_, serial)| control_iq_serials.contains(serial))
        .map(|(id, _)| id)
        .collect()
}

/// Latest upload per device id
fn uploads_by_device(index: &RecordIndex) -> BTreeMap<&str, &Upload> {
    let mut latest = BTreeMap::new();
    for slot in index.sorted(TimeField::Time, index.of_type(&RecordType::Upload)) {
        let Some(record) = index.record(slot) else {
            continue;
        };
        if let (Some(device_id), Some(upload)) = (record.device_id.as_deref(), record.as_upload()) {
            latest.insert(device_id, upload);
        }
    }
    latest
}

// ============================================================================
// Uploads
// ============================================================================

/// Source and serial of one upload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    /// Uploader or manufacturer label
    pub source: String,
    /// Serial number or `Unknown`
    pub device_serial_number: String,
}

/// Upload sessions keyed by upload id
pub fn upload_map(index: &RecordIndex) -> BTreeMap<String, UploadInfo> {
    index
        .of_type(&RecordType::Upload)
        .iter()
        .filter_map(|slot| index.record(slot))
        .filter_map(|record| {
            let upload = record.as_upload()?;
            let key = record.upload_id.clone().unwrap_or_else(|| record.id.clone());
            Some((
                key,
                UploadInfo {
                    source: upload.resolved_source(),
                    device_serial_number: upload.serial_or_unknown(),
                },
            ))
        })
        .collect()
}

/// Summary of the most recent pump upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestPumpUpload {
    /// Lowercased first manufacturer
    pub manufacturer: String,
    /// Pump model
    pub device_model: Option<String>,
    /// Pump adjusts basal automatically
    pub is_automated_basal_device: bool,
    /// Pump delivers automated boluses
    pub is_automated_bolus_device: bool,
    /// Pump supports temporary settings overrides
    pub is_settings_override_device: bool,
    /// Schedule resumed when automation stops
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_manual_basal_schedule: Option<String>,
}

/// Latest pump upload with capability flags
pub fn latest_pump_upload(index: &RecordIndex) -> Option<LatestPumpUpload> {
    let upload = index
        .sorted(TimeField::Time, index.of_type(&RecordType::Upload))
        .into_iter()
        .rev()
        .filter_map(|slot| index.record(slot))
        .filter(|r| !r.reject)
        .find_map(|r| r.as_upload().filter(|u| u.is_pump()))?;

    let manufacturer = upload
        .device_manufacturers
        .first()
        .map(|m| m.to_lowercase())
        .unwrap_or_default();
    let capabilities = PUMP_CAPABILITIES.iter().find(|c| {
        c.manufacturer == manufacturer
            && c.models.map_or(true, |models| {
                upload
                    .device_model
                    .as_deref()
                    .is_some_and(|m| models.contains(&m))
            })
    });
    let automated_basal = capabilities.is_some_and(|c| c.automated_basal);

    let last_manual_basal_schedule = if automated_basal {
        index
            .latest_of_type(&RecordType::PumpSettings, TimeField::Time)
            .and_then(|r| r.as_pump_settings())
            .and_then(|ps| ps.last_manual_basal_schedule.clone())
    } else {
        None
    };

    Some(LatestPumpUpload {
        manufacturer,
        device_model: upload.device_model.clone(),
        is_automated_basal_device: automated_basal,
        is_automated_bolus_device: capabilities.is_some_and(|c| c.automated_bolus),
        is_settings_override_device: capabilities.is_some_and(|c| c.settings_override),
        last_manual_basal_schedule,
    })
}
