//! Day to chunk-store schema selection.
//!
//! Chunk storage is reconfigured over time; each schema period says where
//! and how the chunks of the days it covers are stored. At most one period
//! matches a given day.

use anyhow::{bail, Error};
use chrono::NaiveDate;
use serde::Deserialize;

/// One schema period. `from` is the first day the period covers; it ends
/// where the next period begins.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub from: NaiveDate,
    /// Chunk store location for this period.
    pub store: String,
    /// Optional object prefix within the store.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Select the schema period covering `day`.
///
/// Periods must be sorted by `from`. A day equal to a period's `from` is
/// covered by that period. No covering period is a deployment error
/// surfaced to the caller.
pub fn schema_for_day(configs: &[SchemaConfig], day: NaiveDate) -> Result<&SchemaConfig, Error> {
    let mut selected = None;
    for (index, config) in configs.iter().enumerate() {
        if config.from > day {
            break;
        }
        if let Some(next) = configs.get(index + 1) {
            if next.from <= config.from {
                bail!("schema configs are not sorted by their start day");
            }
        }
        selected = Some(config);
    }
    match selected {
        Some(config) => Ok(config),
        None => bail!("no schema config for day {}", day),
    }
}
