//! Ingest pipeline
//!
//! Raw JSON records pass through normalization, then the index, then one
//! relink pass for the whole batch.
//!
//! # Architecture
//!
//! ```text
//! [raw JSON] → [Normalizer] → [RecordIndex::upsert] ─┐
//!                  ↓                                  │ once per batch
//!              [Schema]                               v
//!                              [Joiner] → [Tagger] (relink pass)
//! ```
//!
//! # Components
//!
//! - **Schema**: per-type validation rules and the registry holding them
//! - **Normalize**: time parsing, fix-ups, link lifting
//! - **Join**: wizard/bolus/dosing-decision links, Medtronic carb fix-up
//! - **Tagger**: derived classification flags
//!
//! # Example
//!
//! ```rust
//! use diabetes_data_engine::config::IngestConfig;
//! use diabetes_data_engine::index::RecordIndex;
//! use diabetes_data_engine::ingestion::{ingest_batch, Normalizer};
//! use serde_json::json;
//!
//! let config = IngestConfig::default();
//! let normalizer = Normalizer::new(None, &config, 0);
//! let mut index = RecordIndex::new();
//!
//! let batch = vec![
//!     json!({"id": "a", "type": "smbg", "time": "2018-02-01T00:00:00Z", "value": 120}),
//!     json!({"type": "smbg", "value": 120}),
//! ];
//! let report = ingest_batch(&mut index, &batch, &normalizer, &config);
//! assert_eq!(report.added, 1);
//! assert_eq!(report.dropped, 1);
//! ```

pub mod join;
pub mod normalize;
pub mod schema;
pub mod tagger;

pub use join::{relink, with_dosing_fields, JoinStats};
pub use normalize::Normalizer;
pub use schema::{SchemaRegistry, ValidationError, ValidationResult};
pub use tagger::tag;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::index::RecordIndex;

/// Counts from one ingest batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    /// New ids stored
    pub added: usize,
    /// Existing ids overwritten
    pub replaced: usize,
    /// Stored but flagged as rejected (validation or join)
    pub rejected: usize,
    /// Not storable (no string id, reserved type, not an object)
    pub dropped: usize,
}

impl IngestReport {
    /// Records that reached the index
    pub fn stored(&self) -> usize {
        self.added + self.replaced
    }
}

/// Normalize, store and relink a batch
pub fn ingest_batch(
    index: &mut RecordIndex,
    raw: &[Value],
    normalizer: &Normalizer<'_>,
    config: &IngestConfig,
) -> IngestReport {
    let mut report = IngestReport::default();
    let mut stored_ids = Vec::with_capacity(raw.len());

    for value in raw {
        let record = match normalizer.normalize(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Dropping unstorable record");
                report.dropped += 1;
                continue;
            },
        };
        stored_ids.push(record.id.clone());
        let (_, replaced) = index.upsert(record);
        if replaced {
            report.replaced += 1;
        } else {
            report.added += 1;
        }
    }

    let joins = relink(index, config);

    // count after relink so join rejections are included
    report.rejected = stored_ids
        .iter()
        .filter(|id| index.get(id).is_some_and(|r| r.reject))
        .count();

    debug!(?joins, "Batch relinked");
    info!(
        added = report.added,
        replaced = report.replaced,
        rejected = report.rejected,
        dropped = report.dropped,
        total = index.len(),
        "Ingested batch"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reingest_same_id_is_idempotent() {
        let config = IngestConfig::default();
        let registry = SchemaRegistry::with_defaults();
        let normalizer = Normalizer::new(Some(&registry), &config, 0);
        let mut index = RecordIndex::new();
        let batch = vec![json!({
            "id": "c1", "type": "cbg", "time": "2018-02-01T00:00:00Z", "value": 100, "units": "mg/dL"
        })];

        let first = ingest_batch(&mut index, &batch, &normalizer, &config);
        let second = ingest_batch(&mut index, &batch, &normalizer, &config);
        assert_eq!(first.added, 1);
        assert_eq!(second.replaced, 1);
        assert_eq!(second.added, 0);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_rejections_counted() {
        let config = IngestConfig::default();
        let registry = SchemaRegistry::with_defaults();
        let normalizer = Normalizer::new(Some(&registry), &config, 0);
        let mut index = RecordIndex::new();
        let batch = vec![
            json!({"id": "bad", "type": "cbg", "time": "2018-02-01T00:00:00Z"}),
            json!({"id": "w", "type": "wizard", "time": "2018-02-01T00:00:00Z", "uploadId": "u1", "bolus": "b"}),
            json!({"id": "b", "type": "bolus", "subType": "normal", "normal": 1, "time": "2018-02-01T00:00:00Z", "uploadId": "u2"}),
            json!({"id": "ok", "type": "smbg", "time": "2018-02-01T00:00:00Z", "value": 5.5, "units": "mmol/L"}),
        ];
        let report = ingest_batch(&mut index, &batch, &normalizer, &config);
        assert_eq!(report.added, 4);
        assert_eq!(report.rejected, 3);
        assert_eq!(report.stored(), 4);
    }
}
