// src/oracle.rs

use crate::charges::{
    ChargeTotals, FutureTotals, NormalizedTotals, PROJECTION_YEARS, RateOfIncrease, YearlyValues,
};
use crate::error::{PipelineError, Result};
use crate::llm_client::{
    ChatCompletion, ChatMessage, CompletionRequest, extract_json_array, extract_json_object,
};
use crate::rate_table::RateTable;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// The judgement steps of the pipeline. Production answers come from an
/// LLM; tests plug in deterministic stubs.
#[async_trait]
pub trait ChargeOracle: Send + Sync {
    /// Pick the charge-bearing columns out of a header row.
    async fn classify_columns(&self, headers: &[String]) -> Result<Vec<String>>;

    /// Yearly percentage increase for each column, 2025 through 2028.
    async fn estimate_rates(
        &self,
        carrier: &str,
        table: &RateTable,
        columns: &[String],
    ) -> Result<RateOfIncrease>;

    /// Re-key raw totals onto the allowed column names.
    async fn normalize_totals(
        &self,
        raw: &NormalizedTotals,
        allowed: &[String],
    ) -> Result<NormalizedTotals>;
}

const CLASSIFY_PROMPT: &str = r#"You receive the header row of a shipping invoice (package-level detail) as a JSON array of strings.
Return a JSON array of strings with the names of the columns that carry charges or amounts:
base rate, amount paid / total amount, fuel surcharge, DAS (delivery area surcharge),
EDAS (extended delivery area surcharge), delivery and returns, and any other charge column present in the header row.
Use the header names exactly as they appear. If no column matches, return [].
Return only the array, e.g. ["Base Rate", "Fuel Surcharge"], nothing else."#;

const NORMALIZE_PROMPT: &str = r#"You receive "totals" and "futureTotals" as JSON.
Re-key both onto the allowed column names listed below.
Every allowed name must appear in the output. Drop entries that do not correspond to an allowed name.
Fill allowed names that have no matching input with 0 in "totals" and with {"2025": 0, "2026": 0, "2027": 0, "2028": 0} in "futureTotals".
Respond with JSON only: {"totals": {...}, "futureTotals": {...}}"#;

fn estimate_prompt(carrier: &str, table: &RateTable, columns_json: &str) -> String {
    format!(
        r#"Historical rate of increase data for shipping carriers, as JSON: ::: {table} :::
Give the yearly rate of increase in percent for carrier {carrier} for each of these charge types: ::: {columns_json} :::
- Take the value from the JSON data whenever it is present.
- When a charge type or year is missing from the data, estimate it. Never leave it out.
- Every listed charge type must have values for 2025, 2026, 2027 and 2028.
- Also include a "discount" property: (total_rate - base_rate) / total_rate.
- Respond with JSON only, in this shape:
  {{"<chargeType>": {{"2025": 5.9, "2026": 6.9, "2027": 5.9, "2028": 4.9}}, "discount": 0.1}}"#,
        table = table.to_json(),
    )
}

/// Oracle backed by a chat-completion service.
pub struct LlmOracle<C> {
    client: C,
}

impl<C: ChatCompletion> LlmOracle<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: ChatCompletion> ChargeOracle for LlmOracle<C> {
    async fn classify_columns(&self, headers: &[String]) -> Result<Vec<String>> {
        let headers_json = serde_json::to_string(headers)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(CLASSIFY_PROMPT),
                ChatMessage::user(format!("header row :: {headers_json}")),
            ],
            json_mode: false,
        };

        let reply = self.client.complete(&request).await?;
        let columns = parse_columns(&reply)?;
        info!(columns = ?columns, "Charge columns classified");
        Ok(columns)
    }

    async fn estimate_rates(
        &self,
        carrier: &str,
        table: &RateTable,
        columns: &[String],
    ) -> Result<RateOfIncrease> {
        let columns_json = serde_json::to_string(columns)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(estimate_prompt(carrier, table, &columns_json)),
                ChatMessage::user("Give response in JSON format"),
            ],
            json_mode: true,
        };

        let reply = self.client.complete(&request).await?;
        parse_rates(&reply, columns)
    }

    async fn normalize_totals(
        &self,
        raw: &NormalizedTotals,
        allowed: &[String],
    ) -> Result<NormalizedTotals> {
        let allowed_json = serde_json::to_string(allowed)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        let raw_json =
            serde_json::to_string(raw).map_err(|e| PipelineError::Internal(e.to_string()))?;
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(format!("{NORMALIZE_PROMPT}\nAllowed names: {allowed_json}")),
                ChatMessage::user(format!("Format this JSON: {raw_json}")),
            ],
            json_mode: true,
        };

        let reply = self.client.complete(&request).await?;
        parse_normalized(&reply)
    }
}

fn malformed(what: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Collaborator(format!("malformed {what} reply: {err}"))
}

/// A number, or a string like `"5.9"` / `"5.9%"`.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

fn parse_object(reply: &str, what: &str) -> Result<Map<String, Value>> {
    let raw = extract_json_object(reply)?;
    serde_json::from_str(raw).map_err(|e| malformed(what, e))
}

/// Column names from the classifier. Single-quoted arrays are accepted;
/// duplicates and blanks are dropped, order is kept.
pub fn parse_columns(reply: &str) -> Result<Vec<String>> {
    let raw = extract_json_array(reply)?;
    let values: Vec<Value> = serde_json::from_str(raw)
        .or_else(|_| serde_json::from_str(&raw.replace('\'', "\"")))
        .map_err(|e| malformed("column", e))?;

    let mut columns: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let name = match value {
            Value::String(name) => name,
            other => return Err(malformed("column", format!("non-string entry {other}"))),
        };
        let name = name.trim();
        if !name.is_empty() && !columns.iter().any(|c| c == name) {
            columns.push(name.to_string());
        }
    }
    Ok(columns)
}

fn complete_years(years: &Map<String, Value>) -> Option<YearlyValues> {
    PROJECTION_YEARS
        .iter()
        .map(|y| years.get(*y).and_then(as_number).map(|v| (y.to_string(), v)))
        .collect()
}

/// Rates for the requested columns. A column that is absent or lacks a
/// usable value for any year is left out, so its projection is skipped.
pub fn parse_rates(reply: &str, columns: &[String]) -> Result<RateOfIncrease> {
    let object = parse_object(reply, "rate")?;

    if let Some(discount) = object.get("discount").and_then(as_number) {
        debug!(discount, "Discount reported with rates");
    }

    let mut rates = RateOfIncrease::new();
    for column in columns {
        let years = match object.get(column) {
            Some(Value::Object(years)) => complete_years(years),
            _ => None,
        };
        match years {
            Some(years) => {
                rates.insert(column.clone(), years);
            }
            None => warn!(column = %column, "No complete rate for column, projection skipped"),
        }
    }
    Ok(rates)
}

/// Reply of the normalization step. Shape is re-checked by the caller.
pub fn parse_normalized(reply: &str) -> Result<NormalizedTotals> {
    let object = parse_object(reply, "normalization")?;

    let section = |key: &str| match object.get(key) {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(malformed("normalization", format!("missing {key:?} object"))),
    };

    let totals: ChargeTotals = section("totals")?
        .iter()
        .map(|(k, v)| (k.clone(), as_number(v).unwrap_or(0.0)))
        .collect();

    let future_totals: FutureTotals = section("futureTotals")?
        .iter()
        .map(|(k, v)| {
            let years = match v {
                Value::Object(years) => PROJECTION_YEARS
                    .iter()
                    .map(|y| {
                        let amount = years.get(*y).and_then(as_number).unwrap_or(0.0);
                        (y.to_string(), amount)
                    })
                    .collect(),
                other => {
                    let flat = as_number(other).unwrap_or(0.0);
                    PROJECTION_YEARS.iter().map(|y| (y.to_string(), flat)).collect()
                }
            };
            (k.clone(), years)
        })
        .collect();

    Ok(NormalizedTotals {
        totals,
        future_totals,
    })
}
