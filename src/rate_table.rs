// src/rate_table.rs

use crate::charges::PROJECTION_YEARS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

const BUNDLED: &str = include_str!("../data/rate-of-increase.json");

/// Charge types echoed back to the caller as the carrier's published
/// rate of increase.
pub const SNAPSHOT_CHARGES: [&str; 11] = [
    "Base Rate",
    "Total Charge",
    "DAS",
    "EDAS",
    "Delivery and Returns",
    "Fuel Surcharge",
    "GRI",
    "Signature Required",
    "Return",
    "residential_surcharge",
    "additional_handling",
];

/// Year -> charge type -> percentage.
pub type CarrierRateOfIncrease = BTreeMap<String, BTreeMap<String, f64>>;

/// Historical rate increases: carrier -> year -> charge type -> percent.
/// Loaded once at startup and only read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateTable(BTreeMap<String, CarrierRateOfIncrease>);

impl RateTable {
    pub fn from_json(json: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let table: RateTable = serde_json::from_str(json)?;
        if table.0.is_empty() {
            return Err("rate table has no carriers".into());
        }
        Ok(table)
    }

    /// The table shipped with the service.
    pub fn bundled() -> Result<Self, Box<dyn std::error::Error>> {
        Self::from_json(BUNDLED)
    }

    /// Load from `path` when given, otherwise use the bundled table.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let table = match path {
            Some(p) => Self::from_json(&std::fs::read_to_string(p)?)?,
            None => Self::bundled()?,
        };
        info!(carriers = ?table.carriers(), "Rate table loaded");
        Ok(table)
    }

    pub fn carriers(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// Canonical carrier name for a case-insensitive match.
    pub fn resolve_carrier(&self, name: &str) -> Option<&str> {
        let wanted = name.trim();
        self.0
            .keys()
            .find(|k| k.eq_ignore_ascii_case(wanted))
            .map(String::as_str)
    }

    /// Compact JSON used inside prompts.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The carrier's entries for the projection years, limited to
    /// `SNAPSHOT_CHARGES`. Charges the table does not list are omitted.
    pub fn carrier_snapshot(&self, carrier: &str) -> CarrierRateOfIncrease {
        let Some(years) = self.0.get(carrier) else {
            return CarrierRateOfIncrease::new();
        };

        PROJECTION_YEARS
            .iter()
            .map(|year| {
                let charges = years
                    .get(*year)
                    .map(|by_charge| {
                        SNAPSHOT_CHARGES
                            .iter()
                            .filter_map(|c| by_charge.get(*c).map(|pct| (c.to_string(), *pct)))
                            .collect()
                    })
                    .unwrap_or_default();
                (year.to_string(), charges)
            })
            .collect()
    }
}
