use crate::config::LogPolicy;
use crate::types::RegionRecord;
use anyhow::{bail, Result};
use tracing::warn;

/// Natural log of a confirmed count. Zero gives negative infinity.
pub fn log_confirmed(confirmed: u64) -> f64 {
    (confirmed as f64).ln()
}

/// Derives the color channel for every record, in record order.
pub fn derive_log_confirmed(records: &[RegionRecord], policy: LogPolicy) -> Result<Vec<f64>> {
    records
        .iter()
        .map(|record| match (record.confirmed, policy) {
            (0, LogPolicy::Reject) => {
                bail!("Region '{}' has zero confirmed cases", record.name)
            }
            (0, LogPolicy::Clamp) => Ok(0.0),
            (0, LogPolicy::PassThrough) => {
                warn!(
                    "Region '{}' has zero confirmed cases; it will be left unshaded",
                    record.name
                );
                Ok(log_confirmed(0))
            }
            (c, _) => Ok(log_confirmed(c)),
        })
        .collect()
}
