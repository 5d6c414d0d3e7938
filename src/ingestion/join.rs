//! Cross-reference joiner
//!
//! Links between records are re-resolved in one pass over the index after
//! each mutating batch, so a target that arrives later, changes, or
//! disappears is reflected without tracking individual edges.
//!
//! ```text
//! relink
//!   ├── 1. de-convert Medtronic wizard carbs (once per record, annotated)
//!   ├── 2. bolus.wizard          ──> stripped wizard copy   (uploadIds must match)
//!   │      bolus.dosingDecision  ──> closest Loop decision  (+ pumpSettings)
//!   ├── 3. wizard.bolus          ──> stripped bolus copy    (uploadIds must match)
//!   └── 4. retag every record whose tags changed
//! ```
//!
//! A provenance mismatch rejects the referencing record and leaves the link
//! as a bare id. Validation rejections are never cleared here: they are
//! stored as `Unparsed` records, which the joiner does not touch.

use std::borrow::Cow;
use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use super::tagger;
use crate::config::IngestConfig;
use crate::index::{RecordIndex, Slot, TimeField};
use crate::record::{
    Bolus, Link, Record, RecordKind, RecordType, Upload, Wizard, ANNOTATION_CARB_DECONVERTED,
};
use crate::types::TimeRange;

lazy_static! {
    /// Origin names of Loop-family controllers
    static ref LOOP_ORIGIN: Regex =
        Regex::new(r"^(com\.loopkit\.Loop|org\.tidepool\.Loop)").expect("loop origin pattern");
}

/// Dosing decision reasons that describe a user-initiated bolus
pub const JOINABLE_DECISION_REASONS: &[&str] = &["normalBolus", "simpleBolus", "watchBolus"];

/// Grams of carbohydrate in one exchange
const GRAMS_PER_EXCHANGE: f64 = 15.0;

/// Outcome counters of one relink pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    /// Links resolved to embedded copies
    pub resolved: usize,
    /// Records rejected for mismatched provenance
    pub rejected: usize,
    /// Dosing decisions attached to boluses
    pub decisions: usize,
    /// Wizards whose carbs were de-converted
    pub deconverted: usize,
    /// Records whose tags changed
    pub retagged: usize,
}

// ============================================================================
// Relink pass
// ============================================================================

/// Re-resolve every cross-record link and refresh derived tags
pub fn relink(index: &mut RecordIndex, config: &IngestConfig) -> JoinStats {
    let mut stats = JoinStats {
        deconverted: deconvert_wizard_carbs(index),
        ..JoinStats::default()
    };

    // bolus id -> wizard id, for boluses that only the wizard points at
    let wizard_by_bolus: HashMap<String, String> = records_of(index, &RecordType::Wizard)
        .filter_map(|r| {
            let link = r.as_wizard()?.bolus.as_ref()?;
            Some((link.target_id().to_string(), r.id.clone()))
        })
        .collect();

    let bolus_joins: Vec<(Slot, Option<Link>, Option<Box<Record>>, Option<String>)> =
        slots_of(index, &RecordType::Bolus)
            .into_iter()
            .filter_map(|slot| {
                let record = index.record(slot)?;
                let bolus = record.as_bolus()?;
                let wizard_id = bolus
                    .wizard
                    .as_ref()
                    .map(|l| l.target_id().to_string())
                    .or_else(|| wizard_by_bolus.get(&record.id).cloned());
                let (wizard, rejection) = match wizard_id {
                    Some(id) => resolve(index, record, &id, &RecordType::Wizard),
                    None => (None, None),
                };
                let decision = if is_loop_origin(bolus) {
                    closest_dosing_decision(index, record, config.dosing_decision_window_ms)
                } else {
                    None
                };
                Some((slot, wizard, decision, rejection))
            })
            .collect();

    for (slot, wizard, decision, rejection) in bolus_joins {
        tally(&mut stats, wizard.as_ref(), rejection.as_deref());
        stats.decisions += usize::from(decision.is_some());
        index.modify(slot, |record| {
            clear_join_rejection(record);
            if let RecordKind::Bolus(bolus) = &mut record.kind {
                bolus.wizard = wizard;
                bolus.dosing_decision = decision;
            }
            if let Some(reason) = rejection {
                record.reject_with(reason);
            }
            // wizards embed this copy next, so it must carry fresh tags
            record.tags = tagger::tag(record);
        });
    }

    // wizard id -> bolus id, from the boluses just linked
    let bolus_by_wizard: HashMap<String, String> = records_of(index, &RecordType::Bolus)
        .filter_map(|r| {
            let link = r.as_bolus()?.wizard.as_ref()?;
            Some((link.target_id().to_string(), r.id.clone()))
        })
        .collect();

    let wizard_joins: Vec<(Slot, Option<Link>, Option<String>)> =
        slots_of(index, &RecordType::Wizard)
            .into_iter()
            .filter_map(|slot| {
                let record = index.record(slot)?;
                let wizard = record.as_wizard()?;
                let bolus_id = wizard
                    .bolus
                    .as_ref()
                    .map(|l| l.target_id().to_string())
                    .or_else(|| bolus_by_wizard.get(&record.id).cloned());
                let (bolus, rejection) = match bolus_id {
                    Some(id) => resolve(index, record, &id, &RecordType::Bolus),
                    None => (None, None),
                };
                Some((slot, bolus, rejection))
            })
            .collect();

    for (slot, bolus, rejection) in wizard_joins {
        tally(&mut stats, bolus.as_ref(), rejection.as_deref());
        index.modify(slot, |record| {
            clear_join_rejection(record);
            if let RecordKind::Wizard(wizard) = &mut record.kind {
                wizard.bolus = bolus;
            }
            if let Some(reason) = rejection {
                record.reject_with(reason);
            }
        });
    }

    stats.retagged = retag(index);
    debug!(
        resolved = stats.resolved,
        rejected = stats.rejected,
        decisions = stats.decisions,
        deconverted = stats.deconverted,
        retagged = stats.retagged,
        "Relinked records"
    );
    stats
}

fn tally(stats: &mut JoinStats, link: Option<&Link>, rejection: Option<&str>) {
    if rejection.is_some() {
        stats.rejected += 1;
    } else if link.is_some_and(|l| l.resolved().is_some()) {
        stats.resolved += 1;
    }
}

fn slots_of(index: &RecordIndex, record_type: &RecordType) -> Vec<Slot> {
    index.of_type(record_type).iter().collect()
}

fn records_of<'a>(
    index: &'a RecordIndex,
    record_type: &RecordType,
) -> impl Iterator<Item = &'a Record> + 'a {
    slots_of(index, record_type)
        .into_iter()
        .filter_map(move |slot| index.record(slot))
}

fn clear_join_rejection(record: &mut Record) {
    record.reject = false;
    record.reject_reason.clear();
}

/// Resolve `id` from `referrer`'s point of view
///
/// Returns the link to store and, on provenance mismatch, a rejection reason.
fn resolve(
    index: &RecordIndex,
    referrer: &Record,
    id: &str,
    expected: &RecordType,
) -> (Option<Link>, Option<String>) {
    let target = index
        .get(id)
        .filter(|t| &t.record_type == expected && !matches!(t.kind, RecordKind::Unparsed(_)));
    let Some(target) = target else {
        return (Some(Link::Id(id.to_string())), None);
    };

    if target.upload_id == referrer.upload_id {
        return (Some(Link::Resolved(Box::new(target.stripped_for_embedding()))), None);
    }

    let reason = format!(
        "{} {} has uploadId {}, expected {}",
        expected,
        id,
        target.upload_id.as_deref().unwrap_or("none"),
        referrer.upload_id.as_deref().unwrap_or("none"),
    );
    warn!(id = %referrer.id, target = %id, "Join rejected: {}", reason);
    (Some(Link::Id(id.to_string())), Some(reason))
}

// ============================================================================
// Bolus <-> DosingDecision
// ============================================================================

fn is_loop_origin(bolus: &Bolus) -> bool {
    bolus
        .origin
        .as_ref()
        .and_then(|o| o.name.as_deref())
        .is_some_and(|name| LOOP_ORIGIN.is_match(name))
}

/// Closest joinable decision within `window_ms` of the bolus, pump settings resolved
fn closest_dosing_decision(
    index: &RecordIndex,
    bolus: &Record,
    window_ms: i64,
) -> Option<Box<Record>> {
    let range = TimeRange::unchecked(
        bolus.time.saturating_sub(window_ms),
        bolus.time.saturating_add(window_ms).saturating_add(1),
    );
    let candidates = index
        .in_range(TimeField::Time, range)
        .and(index.of_type(&RecordType::DosingDecision))
        .and_not(index.rejected());

    let closest = candidates
        .iter()
        .filter_map(|slot| index.record(slot))
        .filter(|r| match &r.kind {
            RecordKind::DosingDecision(d) => d
                .reason
                .as_deref()
                .is_some_and(|reason| JOINABLE_DECISION_REASONS.contains(&reason)),
            _ => false,
        })
        .min_by_key(|r| ((r.time - bolus.time).abs(), r.time))?;

    let mut decision = closest.clone();
    if let RecordKind::DosingDecision(d) = &mut decision.kind {
        let settings = d
            .pump_settings_id()
            .and_then(|id| index.get(id))
            .filter(|r| r.as_pump_settings().is_some())
            .or_else(|| index.latest_of_type(&RecordType::PumpSettings, TimeField::Time));
        d.pump_settings = settings.map(|s| Box::new(s.clone()));
    }
    Some(Box::new(decision))
}

/// Bolus view with the attached decision's values copied in
///
/// The stored bolus keeps its own fields; tagging and output read this view.
pub fn with_dosing_fields(bolus: &Bolus) -> Cow<'_, Bolus> {
    let Some(RecordKind::DosingDecision(decision)) =
        bolus.dosing_decision.as_ref().map(|r| &r.kind)
    else {
        return Cow::Borrowed(bolus);
    };

    let mut view = bolus.clone();
    if let Some(requested) = decision.requested_bolus.as_ref().and_then(|a| a.amount) {
        view.expected_normal = Some(requested);
    }
    if let Some(bg) = decision.bg_historical.last().and_then(|s| s.value) {
        view.bg_input = Some(bg);
        if let Some(units) = decision.units.as_ref().and_then(|u| u.bg.clone()) {
            view.units = Some(units);
        }
    }
    if let Some(carbs) = decision.carbs_net() {
        view.carb_input = Some(carbs);
    }
    if let Some(iob) = decision.insulin_on_board.as_ref().and_then(|a| a.amount) {
        view.insulin_on_board = Some(iob);
    }
    Cow::Owned(view)
}

// ============================================================================
// Medtronic carb exchanges
// ============================================================================

fn is_legacy_medtronic(upload: &Upload) -> bool {
    upload.resolved_source().eq_ignore_ascii_case("medtronic")
}

/// Whether a wizard's carbs were stored in grams but entered as exchanges
pub fn needs_carb_to_exchange_conversion(record: &Record, upload: Option<&Upload>) -> bool {
    let Some(wizard) = record.as_wizard() else {
        return false;
    };
    upload.is_some_and(is_legacy_medtronic)
        && wizard.carb_units.as_deref() == Some("exchanges")
        && wizard.carb_input.is_some_and(f64::is_finite)
        && !record.has_annotation(ANNOTATION_CARB_DECONVERTED)
}

fn deconvert(wizard: &mut Wizard) {
    if let Some(grams) = wizard.carb_input {
        wizard.carb_input = Some((grams / GRAMS_PER_EXCHANGE * 2.0).round() / 2.0);
    }
    if let Some(ratio) = wizard.insulin_carb_ratio.filter(|r| *r > 0.0) {
        wizard.insulin_carb_ratio = Some((GRAMS_PER_EXCHANGE / ratio * 10.0).round() / 10.0);
    }
}

fn deconvert_wizard_carbs(index: &mut RecordIndex) -> usize {
    let uploads: HashMap<&str, &Upload> = records_of(index, &RecordType::Upload)
        .filter_map(|r| {
            let key = r.upload_id.as_deref().unwrap_or(&r.id);
            Some((key, r.as_upload()?))
        })
        .collect();

    let pending: Vec<Slot> = slots_of(index, &RecordType::Wizard)
        .into_iter()
        .filter(|&slot| {
            index.record(slot).is_some_and(|r| {
                let upload = r.upload_id.as_deref().and_then(|u| uploads.get(u).copied());
                needs_carb_to_exchange_conversion(r, upload)
            })
        })
        .collect();

    for &slot in &pending {
        index.modify(slot, |record| {
            if let RecordKind::Wizard(wizard) = &mut record.kind {
                deconvert(wizard);
            }
            record.add_annotation(ANNOTATION_CARB_DECONVERTED);
        });
    }
    pending.len()
}

// ============================================================================
// Tags
// ============================================================================

fn retag(index: &mut RecordIndex) -> usize {
    let changed: Vec<(Slot, _)> = index
        .all()
        .iter()
        .filter_map(|slot| {
            let record = index.record(slot)?;
            let tags = tagger::tag(record);
            (tags != record.tags).then_some((slot, tags))
        })
        .collect();
    for &(slot, tags) in &changed {
        index.modify(slot, |record| record.tags = tags);
    }
    changed.len()
}

// ============================================================================
// Tests
// ============================================================================
