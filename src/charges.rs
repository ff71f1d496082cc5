// src/charges.rs

use crate::spreadsheet::{CellValue, Sheet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Years the projection covers, in compounding order.
pub const PROJECTION_YEARS: [&str; 4] = ["2025", "2026", "2027", "2028"];

/// Canonical charge categories the response is normalized onto.
pub const DEFAULT_ALLOWED_COLUMNS: [&str; 6] = [
    "Base Rate",
    "Total Charge",
    "DAS",
    "EDAS",
    "Delivery and Returns",
    "Fuel Surcharge",
];

/// Year -> value (percentage or amount).
pub type YearlyValues = BTreeMap<String, f64>;
/// Column -> summed amount, rounded to cents.
pub type ChargeTotals = BTreeMap<String, f64>;
/// Column -> year -> percentage increase.
pub type RateOfIncrease = BTreeMap<String, YearlyValues>;
/// Column -> year -> projected amount.
pub type FutureTotals = BTreeMap<String, YearlyValues>;

/// Totals re-keyed onto the allowed column set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTotals {
    pub totals: ChargeTotals,
    #[serde(rename = "futureTotals")]
    pub future_totals: FutureTotals,
}

static PLAIN_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").unwrap());

static GROUPED_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?\d{1,3}(,\d{3})+(\.\d*)?$").unwrap());

/// Round to two decimals the way `Number.prototype.toFixed(2)` does:
/// half-up on the exact binary value, not on a scaled approximation.
pub fn round2(value: f64) -> f64 {
    // Past 2^53 every f64 is an integer.
    if !value.is_finite() || value.abs() >= 9_007_199_254_740_992.0 {
        return value;
    }

    // Fixed-precision formatting prints the exact decimal expansion, so a
    // true tie shows up as "5" followed by zeros.
    let exact = format!("{:.40}", value.abs());
    let Some((int_part, frac)) = exact.split_once('.') else {
        return value;
    };
    let frac = frac.as_bytes();
    let (Ok(whole), Some(&d1), Some(&d2), Some(&d3)) = (
        int_part.parse::<u64>(),
        frac.first(),
        frac.get(1),
        frac.get(2),
    ) else {
        return value;
    };

    let mut cents = whole * 100 + u64::from(d1 - b'0') * 10 + u64::from(d2 - b'0');
    if d3 >= b'5' {
        cents += 1;
    }

    let rounded: f64 = format!("{}.{:02}", cents / 100, cents % 100)
        .parse()
        .unwrap_or(value);
    if value.is_sign_negative() && cents != 0 {
        -rounded
    } else {
        rounded
    }
}

/// Parse a currency-formatted cell such as `" $1,234.50 "`.
/// Anything that is not a whole non-negative decimal number after
/// stripping the leading `$` is rejected.
pub fn parse_amount(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let body = trimmed.strip_prefix('$').unwrap_or(trimmed).trim();
    if body.is_empty() {
        return None;
    }

    let digits = if PLAIN_NUMBER.is_match(body) {
        body.to_string()
    } else if GROUPED_NUMBER.is_match(body) {
        body.replace(',', "")
    } else {
        return None;
    };

    digits.parse::<f64>().ok().filter(|v| v.is_finite())
}

impl CellValue {
    /// Numeric view of a cell for summing. `None` means "skip".
    pub fn as_amount(&self) -> Option<f64> {
        match self {
            CellValue::Empty => None,
            CellValue::Number(n) => (n.is_finite() && *n >= 0.0).then_some(*n),
            CellValue::Text(s) => parse_amount(s),
        }
    }
}

/// Sum every requested column across all rows. Rows missing the column
/// and cells that do not parse contribute nothing.
pub fn aggregate(sheet: &Sheet, columns: &[String]) -> ChargeTotals {
    let mut totals = ChargeTotals::new();
    for column in columns {
        let total: f64 = sheet
            .rows()
            .iter()
            .filter_map(|row| row.get(column).and_then(CellValue::as_amount))
            .sum();
        totals.insert(column.clone(), round2(total));
    }
    totals
}

/// Compound one total through the four projection years. Each year is
/// rounded before it becomes the base for the next one.
pub fn project_column(total: f64, yearly: &YearlyValues) -> Option<YearlyValues> {
    let mut base = total;
    let mut out = YearlyValues::new();
    for year in PROJECTION_YEARS {
        let pct = *yearly.get(year)?;
        base = round2(base * (1.0 + pct / 100.0));
        out.insert(year.to_string(), base);
    }
    Some(out)
}

/// Project every aggregated column that has a complete rate entry.
/// Columns without one are left out.
pub fn project(totals: &ChargeTotals, rates: &RateOfIncrease) -> FutureTotals {
    totals
        .iter()
        .filter_map(|(column, total)| {
            let yearly = rates.get(column)?;
            project_column(*total, yearly).map(|years| (column.clone(), years))
        })
        .collect()
}

fn loose_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Pick the input entry for an allowed column: exact name first, then a
/// case and punctuation insensitive match.
fn lookup<'a, V>(input: &'a BTreeMap<String, V>, allowed: &str) -> Option<&'a V> {
    input.get(allowed).or_else(|| {
        let wanted = loose_key(allowed);
        input
            .iter()
            .find(|(name, _)| loose_key(name) == wanted)
            .map(|(_, v)| v)
    })
}

fn zero_years() -> YearlyValues {
    PROJECTION_YEARS
        .iter()
        .map(|y| (y.to_string(), 0.0))
        .collect()
}

/// Re-key totals onto exactly `allowed`: unknown columns are dropped and
/// missing ones become zero.
pub fn normalize(
    totals: &ChargeTotals,
    future_totals: &FutureTotals,
    allowed: &[String],
) -> NormalizedTotals {
    let totals = allowed
        .iter()
        .map(|column| {
            let value = lookup(totals, column).copied().unwrap_or(0.0);
            (column.clone(), value)
        })
        .collect();

    let future_totals = allowed
        .iter()
        .map(|column| {
            let years = match lookup(future_totals, column) {
                Some(found) => PROJECTION_YEARS
                    .iter()
                    .map(|y| (y.to_string(), found.get(*y).copied().unwrap_or(0.0)))
                    .collect(),
                None => zero_years(),
            };
            (column.clone(), years)
        })
        .collect();

    NormalizedTotals {
        totals,
        future_totals,
    }
}
