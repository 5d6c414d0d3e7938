//! Engine builder with pluggable collaborators
//!
//! Every collaborator has a default: the built-in schema registry, the
//! [`BasicStats`] provider and the system clock.

use std::sync::Arc;

use tracing::info;

use super::traits::{Clock, SchemaValidator, StatsProvider, SystemClock};
use super::DataEngine;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::index::RecordIndex;
use crate::ingestion::SchemaRegistry;
use crate::metadata::MetadataCache;
use crate::query::{TimePrefs, WindowPlanner};
use crate::stats::BasicStats;
use crate::timezone::LocalCalendar;
use crate::units::BgPrefs;

/// Builder for configuring a [`DataEngine`]
pub struct DataEngineBuilder {
    config: EngineConfig,
    validator: Option<Arc<dyn SchemaValidator>>,
    stats: Option<Arc<dyn StatsProvider>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DataEngineBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            validator: None,
            stats: None,
            clock: None,
        }
    }

    /// Set engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a custom validator
    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: SchemaValidator + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Set a custom statistics provider
    pub fn with_stats<S>(mut self, stats: S) -> Self
    where
        S: StatsProvider + 'static,
    {
        self.stats = Some(Arc::new(stats));
        self
    }

    /// Set the clock used to clamp ongoing records
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Build the engine
    ///
    /// Fails when the configuration does not validate. With
    /// `ingest.validate` off no validator is installed, even a custom one.
    pub fn build(self) -> Result<DataEngine> {
        self.config.validate()?;

        let validator = if self.config.ingest.validate {
            Some(
                self.validator
                    .unwrap_or_else(|| Arc::new(SchemaRegistry::with_defaults())),
            )
        } else {
            None
        };
        let stats = self.stats.unwrap_or_else(|| Arc::new(BasicStats));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let bg_prefs = BgPrefs::for_units(self.config.query.default_bg_units);

        info!(
            validator = validator.as_ref().map(|v| v.validator_id()),
            stats = stats.provider_id(),
            "Data engine built"
        );

        Ok(DataEngine {
            config: self.config,
            index: RecordIndex::new(),
            validator,
            stats,
            clock,
            metadata: MetadataCache::new(bg_prefs),
            time_prefs: TimePrefs::default(),
            planner: WindowPlanner::new(LocalCalendar::utc()),
            subject: None,
        })
    }
}

impl Default for DataEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
