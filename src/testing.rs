// src/testing.rs
//
// Fixtures shared by the unit tests.

use crate::charges::{NormalizedTotals, RateOfIncrease, YearlyValues, PROJECTION_YEARS};
use crate::error::{PipelineError, Result};
use crate::oracle::ChargeOracle;
use crate::rate_table::RateTable;
use async_trait::async_trait;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use zip::write::SimpleFileOptions;

fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Build a minimal single-sheet xlsx workbook in memory. Cells that
/// parse as plain numbers are written as numeric cells, empty strings
/// are left out, everything else is an inline string.
pub fn xlsx_bytes(sheet_name: &str, rows: &[&[&str]]) -> Vec<u8> {
    let mut sheet_data = String::new();
    for (r, row) in rows.iter().enumerate() {
        sheet_data.push_str(&format!("<row r=\"{}\">", r + 1));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let cell_ref = format!("{}{}", column_letter(c), r + 1);
            if value.parse::<f64>().is_ok() {
                sheet_data.push_str(&format!("<c r=\"{cell_ref}\"><v>{value}</v></c>"));
            } else {
                sheet_data.push_str(&format!(
                    "<c r=\"{cell_ref}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
                    escape(value)
                ));
            }
        }
        sheet_data.push_str("</row>");
    }

    let files = [
        (
            "[Content_Types].xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#
                .to_string(),
        ),
        (
            "_rels/.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#
                .to_string(),
        ),
        (
            "xl/workbook.xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
                escape(sheet_name)
            ),
        ),
        (
            "xl/_rels/workbook.xml.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#
                .to_string(),
        ),
        (
            "xl/worksheets/sheet1.xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{sheet_data}</sheetData></worksheet>"#
            ),
        ),
    ];

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        zip.start_file(name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Invoice fixture used across pipeline and HTTP tests.
pub fn sample_invoice() -> Vec<u8> {
    xlsx_bytes(
        "datasheet",
        &[
            &["Tracking ID", "Base Rate", "Fuel Surcharge", "Misc Fee", "Zone"],
            &["1Z001", "$100.00", "$12.10", "1", "5"],
            &["1Z002", "$50.25", "bad", "2", "6"],
            &["1Z003", "", "$7.90", "3", "7"],
        ],
    )
}

pub fn flat_rates(pct: f64) -> YearlyValues {
    PROJECTION_YEARS
        .iter()
        .map(|y| (y.to_string(), pct))
        .collect()
}

/// Deterministic oracle that counts how often it is consulted.
pub struct StubOracle {
    pub columns: Vec<String>,
    pub rates: RateOfIncrease,
    pub calls: AtomicUsize,
    pub fail_estimate: bool,
}

impl StubOracle {
    pub fn new(columns: &[&str], rates: RateOfIncrease) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rates,
            calls: AtomicUsize::new(0),
            fail_estimate: false,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChargeOracle for StubOracle {
    async fn classify_columns(&self, _headers: &[String]) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.columns.clone())
    }

    async fn estimate_rates(
        &self,
        _carrier: &str,
        _table: &RateTable,
        _columns: &[String],
    ) -> Result<RateOfIncrease> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_estimate {
            return Err(PipelineError::Collaborator("stubbed failure".into()));
        }
        Ok(self.rates.clone())
    }

    async fn normalize_totals(
        &self,
        raw: &NormalizedTotals,
        _allowed: &[String],
    ) -> Result<NormalizedTotals> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(raw.clone())
    }
}
