// src/spreadsheet.rs

use crate::error::{PipelineError, Result};
use calamine::{Data, DataType, Reader, open_workbook_auto_from_rs};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use tracing::info;

/// A single decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
}

impl CellValue {
    fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.is_empty(),
            CellValue::Number(_) => false,
        }
    }

    fn header_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
        }
    }
}

impl From<&Data> for CellValue {
    fn from(cell: &Data) -> Self {
        match cell {
            Data::Empty => CellValue::Empty,
            Data::String(s) => CellValue::Text(s.clone()),
            Data::Int(i) => CellValue::Number(*i as f64),
            Data::Float(f) => CellValue::Number(*f),
            Data::Bool(b) => CellValue::Text(b.to_string()),
            other => other
                .as_f64()
                .map(CellValue::Number)
                .unwrap_or_else(|| CellValue::Text(other.to_string())),
        }
    }
}

/// Header name -> cell. Every header is present; blanks are `Empty`.
pub type Row = HashMap<String, CellValue>;

/// A sheet decoded into header-keyed rows, header order preserved.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl Sheet {
    /// Build from a rectangular grid whose first row holds the headers.
    /// Blank headers become `__EMPTY`, repeated ones get `_1`, `_2`, ...
    /// suffixes, and fully blank data rows are dropped.
    pub fn from_grid(grid: Vec<Vec<CellValue>>) -> Self {
        let mut grid = grid.into_iter();
        let Some(header_row) = grid.next() else {
            return Self::default();
        };

        let headers = unique_headers(&header_row);
        let rows = grid
            .filter(|cells| !cells.iter().all(CellValue::is_blank))
            .map(|cells| {
                let mut cells = cells.into_iter();
                headers
                    .iter()
                    .map(|h| (h.clone(), cells.next().unwrap_or(CellValue::Empty)))
                    .collect()
            })
            .collect();

        Self { headers, rows }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

fn unique_headers(cells: &[CellValue]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut headers = Vec::with_capacity(cells.len());

    for cell in cells {
        let mut base = cell.header_text();
        if base.is_empty() {
            base = "__EMPTY".to_string();
        }

        let mut name = base.clone();
        while let Some(count) = seen.get_mut(&base) {
            *count += 1;
            name = format!("{base}_{count}");
            if !seen.contains_key(&name) {
                break;
            }
        }
        seen.entry(base).or_insert(0);
        seen.entry(name.clone()).or_insert(0);
        headers.push(name);
    }
    headers
}

/// Decode `sheet_name` from the workbook at `path`. The format is
/// detected from the content, so the upload's file name does not matter.
pub fn read_sheet(path: &Path, sheet_name: &str) -> Result<Sheet> {
    let bytes = std::fs::read(path)?;
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;

    if !workbook.sheet_names().iter().any(|n| n == sheet_name) {
        return Err(PipelineError::Parse(format!(
            "workbook has no sheet named {sheet_name:?}"
        )));
    }

    let range = workbook.worksheet_range(sheet_name)?;
    let grid: Vec<Vec<CellValue>> = range
        .rows()
        .map(|row| row.iter().map(CellValue::from).collect())
        .collect();

    let sheet = Sheet::from_grid(grid);
    if sheet.headers().is_empty() || sheet.rows().is_empty() {
        return Err(PipelineError::Parse(format!(
            "sheet {sheet_name:?} has no data rows"
        )));
    }

    info!(
        sheet = sheet_name,
        headers = sheet.headers().len(),
        rows = sheet.rows().len(),
        "Sheet decoded"
    );
    Ok(sheet)
}
