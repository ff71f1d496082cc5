// src/pipeline.rs

use crate::charges::{self, ChargeTotals, FutureTotals, NormalizedTotals, RateOfIncrease};
use crate::config::{NormalizationMode, PipelineSection};
use crate::error::{PipelineError, Result};
use crate::oracle::ChargeOracle;
use crate::rate_table::{CarrierRateOfIncrease, RateTable};
use crate::spreadsheet;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub sheet_name: String,
    pub normalization: NormalizationMode,
    pub allowed_columns: Vec<String>,
}

impl From<&PipelineSection> for PipelineOptions {
    fn from(section: &PipelineSection) -> Self {
        Self {
            sheet_name: section.sheet_name.clone(),
            normalization: section.normalization,
            allowed_columns: section.allowed_columns.clone(),
        }
    }
}

/// Response body of `/calculate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationReport {
    pub totals: ChargeTotals,
    #[serde(rename = "futureTotals")]
    pub future_totals: FutureTotals,
    #[serde(rename = "carrierRateOfIncrease")]
    pub carrier_rate_of_increase: CarrierRateOfIncrease,
}

/// Parse -> classify -> aggregate -> estimate -> project -> normalize.
/// Holds only read-only state, so one instance serves all requests.
pub struct Pipeline {
    oracle: Arc<dyn ChargeOracle>,
    rate_table: Arc<RateTable>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        oracle: Arc<dyn ChargeOracle>,
        rate_table: Arc<RateTable>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            oracle,
            rate_table,
            options,
        }
    }

    /// Canonical carrier name, or a validation error for carriers the
    /// rate table does not know.
    pub fn resolve_carrier(&self, requested: &str) -> Result<String> {
        self.rate_table
            .resolve_carrier(requested)
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::Validation(format!("Unknown carrier: {}", requested.trim()))
            })
    }

    pub async fn run(&self, carrier: &str, workbook: &Path) -> Result<CalculationReport> {
        let path = workbook.to_path_buf();
        let sheet_name = self.options.sheet_name.clone();
        let sheet =
            tokio::task::spawn_blocking(move || spreadsheet::read_sheet(&path, &sheet_name))
                .await??;

        let columns = self.oracle.classify_columns(sheet.headers()).await?;
        for column in columns.iter().filter(|c| !sheet.headers().contains(*c)) {
            warn!(column = %column, "Classified column not in header row, totals 0");
        }

        let totals = charges::aggregate(&sheet, &columns);

        let rates = if columns.is_empty() {
            info!("No charge columns found, skipping rate estimation");
            RateOfIncrease::new()
        } else {
            self.oracle
                .estimate_rates(carrier, &self.rate_table, &columns)
                .await?
        };

        let future_totals = charges::project(&totals, &rates);
        info!(
            carrier = %carrier,
            columns = columns.len(),
            projected = future_totals.len(),
            "Totals projected"
        );

        let raw = NormalizedTotals {
            totals,
            future_totals,
        };
        let shaped = self.shape(raw).await?;

        Ok(CalculationReport {
            totals: shaped.totals,
            future_totals: shaped.future_totals,
            carrier_rate_of_increase: self.rate_table.carrier_snapshot(carrier),
        })
    }

    async fn shape(&self, raw: NormalizedTotals) -> Result<NormalizedTotals> {
        let allowed = &self.options.allowed_columns;
        match self.options.normalization {
            NormalizationMode::Off => Ok(raw),
            NormalizationMode::Local => Ok(charges::normalize(
                &raw.totals,
                &raw.future_totals,
                allowed,
            )),
            NormalizationMode::Oracle => {
                let reshaped = self.oracle.normalize_totals(&raw, allowed).await?;
                Ok(charges::normalize(
                    &reshaped.totals,
                    &reshaped.future_totals,
                    allowed,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charges::{DEFAULT_ALLOWED_COLUMNS, project_column};
    use crate::testing::{StubOracle, flat_rates, sample_invoice};
    use std::path::PathBuf;

    fn options(normalization: NormalizationMode) -> PipelineOptions {
        PipelineOptions {
            sheet_name: "datasheet".to_string(),
            normalization,
            allowed_columns: DEFAULT_ALLOWED_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn stub() -> Arc<StubOracle> {
        Arc::new(StubOracle::new(
            &["Base Rate", "Fuel Surcharge", "Misc Fee"],
            RateOfIncrease::from([
                ("Base Rate".to_string(), flat_rates(10.0)),
                ("Fuel Surcharge".to_string(), flat_rates(5.0)),
            ]),
        ))
    }

    fn pipeline(oracle: Arc<StubOracle>, normalization: NormalizationMode) -> Pipeline {
        Pipeline::new(
            oracle,
            Arc::new(RateTable::bundled().unwrap()),
            options(normalization),
        )
    }

    fn write_invoice(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("invoice");
        std::fs::write(&path, sample_invoice()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_raw_totals_without_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_invoice(&dir);
        let oracle = stub();

        let report = pipeline(oracle.clone(), NormalizationMode::Off)
            .run("FedEx", &path)
            .await
            .unwrap();

        assert_eq!(report.totals["Base Rate"], 150.25);
        assert_eq!(report.totals["Fuel Surcharge"], 20.0);
        assert_eq!(report.totals["Misc Fee"], 6.0);
        assert_eq!(
            report.future_totals["Base Rate"],
            project_column(150.25, &flat_rates(10.0)).unwrap()
        );
        assert!(!report.future_totals.contains_key("Misc Fee"));
        assert!(report.future_totals.keys().all(|k| report.totals.contains_key(k)));
        assert_eq!(oracle.calls(), 2);
    }

    #[tokio::test]
    async fn test_local_normalization_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_invoice(&dir);

        let report = pipeline(stub(), NormalizationMode::Local)
            .run("UPS", &path)
            .await
            .unwrap();

        let keys: Vec<&str> = report.totals.keys().map(String::as_str).collect();
        let mut expected = DEFAULT_ALLOWED_COLUMNS.to_vec();
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(report.totals["EDAS"], 0.0);
        assert_eq!(report.future_totals["EDAS"]["2028"], 0.0);
        assert!(!report.totals.contains_key("Misc Fee"));
        assert_eq!(report.carrier_rate_of_increase["2025"]["Base Rate"], 5.9);
    }

    #[tokio::test]
    async fn test_oracle_normalization_is_rechecked() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_invoice(&dir);
        let oracle = stub();

        // The stub hands back the raw totals untouched; the shape must
        // still end up on the allowed set.
        let report = pipeline(oracle.clone(), NormalizationMode::Oracle)
            .run("FedEx", &path)
            .await
            .unwrap();

        assert_eq!(report.totals.len(), DEFAULT_ALLOWED_COLUMNS.len());
        assert!(!report.totals.contains_key("Misc Fee"));
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_no_columns_skips_estimation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_invoice(&dir);
        let oracle = Arc::new(StubOracle::new(&[], RateOfIncrease::new()));

        let report = pipeline(oracle.clone(), NormalizationMode::Local)
            .run("FedEx", &path)
            .await
            .unwrap();

        assert!(report.totals.values().all(|v| *v == 0.0));
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_estimator_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_invoice(&dir);
        let mut failing = StubOracle::new(&["Base Rate"], RateOfIncrease::new());
        failing.fail_estimate = true;

        let err = pipeline(Arc::new(failing), NormalizationMode::Local)
            .run("FedEx", &path)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Collaborator(_)));
    }

    #[tokio::test]
    async fn test_identical_runs_serialize_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_invoice(&dir);
        let pipeline = pipeline(stub(), NormalizationMode::Local);

        let first = serde_json::to_string(&pipeline.run("FedEx", &path).await.unwrap()).unwrap();
        let second = serde_json::to_string(&pipeline.run("FedEx", &path).await.unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unparseable_workbook_never_reaches_oracle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice");
        std::fs::write(&path, b"not a spreadsheet").unwrap();
        let oracle = stub();

        let err = pipeline(oracle.clone(), NormalizationMode::Local)
            .run("FedEx", &path)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn test_resolve_carrier() {
        let pipeline = pipeline(stub(), NormalizationMode::Local);
        assert_eq!(pipeline.resolve_carrier("fedex").unwrap(), "FedEx");
        assert!(matches!(
            pipeline.resolve_carrier("DHL"),
            Err(PipelineError::Validation(_))
        ));
    }
}
