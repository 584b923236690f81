//! QuickBooks-style report mapping
//!
//! Reports are nested `Section` rows holding `Data` rows. Each data row
//! carries one cell per report column; money columns with a start/end date
//! become one canonical record each.

use chrono::NaiveDate;
use serde_json::Value;

use super::{non_empty_str, parse_amount, parse_date, to_snake_case, NormalizationOutcome, DEFAULT_CURRENCY};
use crate::error::PipelineError;
use crate::models::{CanonicalFinancialRecord, SourceSystem};
use crate::Result;

/// Sections whose rows are totals derived from other sections
const COMPUTED_GROUPS: &[&str] = &[
    "GrossProfit",
    "NetIncome",
    "NetOperatingIncome",
    "NetOtherIncome",
];

const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, Copy)]
struct PeriodColumn {
    index: usize,
    start: NaiveDate,
    end: NaiveDate,
}

struct ReportMapper {
    columns: Vec<PeriodColumn>,
    currency: String,
    records: Vec<CanonicalFinancialRecord>,
    skipped: usize,
    /// Data rows holding values while no column has a period
    unplaced_rows: usize,
}

/// Map a QuickBooks-style report into canonical records
pub fn normalize_report(document: &Value) -> Result<NormalizationOutcome> {
    let report = locate_report(document)?;
    let header = report.get("Header");

    let currency = non_empty_str(header.and_then(|h| h.get("Currency")))
        .unwrap_or(DEFAULT_CURRENCY)
        .to_string();

    let columns = period_columns(report, header)?;

    let mut mapper = ReportMapper {
        columns,
        currency,
        records: Vec::new(),
        skipped: 0,
        unplaced_rows: 0,
    };

    match report.get("Rows").and_then(|rows| rows.get("Row")) {
        None | Some(Value::Null) => {}
        Some(Value::Array(rows)) => mapper.walk_rows(rows, "Rows.Row", None),
        Some(_) => {
            return Err(PipelineError::NormalizationError(
                "QuickBooks report `Rows.Row` must be an array".to_string(),
            ))
        }
    }

    if mapper.unplaced_rows > 0 {
        return Err(PipelineError::NormalizationError(format!(
            "QuickBooks report has {} data row(s) but no money column with a resolvable period",
            mapper.unplaced_rows
        )));
    }

    Ok(NormalizationOutcome {
        source_system: SourceSystem::QuickBooks,
        records: mapper.records,
        skipped: mapper.skipped,
    })
}

/// The report is either the root object or wrapped under `data`
fn locate_report(document: &Value) -> Result<&Value> {
    let is_report = |v: &Value| {
        v.get("Columns").map_or(false, Value::is_object) && v.get("Rows").map_or(false, Value::is_object)
    };

    if let Some(inner) = document.get("data").filter(|d| is_report(*d)) {
        return Ok(inner);
    }
    if is_report(document) {
        return Ok(document);
    }

    Err(PipelineError::NormalizationError(
        "Document is not a QuickBooks report: expected `Columns` and `Rows` objects at the root or under `data`"
            .to_string(),
    ))
}

fn column_metadata<'a>(column: &'a Value, name: &str) -> Option<&'a str> {
    column
        .get("MetaData")?
        .as_array()?
        .iter()
        .find(|m| m.get("Name").and_then(Value::as_str) == Some(name))
        .and_then(|m| non_empty_str(m.get("Value")))
}

fn is_total_column(column: &Value) -> bool {
    column
        .get("ColTitle")
        .and_then(Value::as_str)
        .map_or(false, |t| t.trim().eq_ignore_ascii_case("total"))
}

fn is_money_column(column: &Value) -> bool {
    column.get("ColType").and_then(Value::as_str) == Some("Money")
}

fn period_columns(report: &Value, header: Option<&Value>) -> Result<Vec<PeriodColumn>> {
    let columns = report
        .get("Columns")
        .and_then(|c| c.get("Column"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            PipelineError::NormalizationError(
                "QuickBooks report `Columns.Column` must be an array".to_string(),
            )
        })?;

    let mut periods: Vec<PeriodColumn> = columns
        .iter()
        .enumerate()
        .filter(|(_, col)| !is_total_column(col))
        .filter_map(|(index, col)| {
            let start = parse_date(column_metadata(col, "StartDate")?)?;
            let end = parse_date(column_metadata(col, "EndDate")?)?;
            (start <= end).then_some(PeriodColumn { index, start, end })
        })
        .collect();

    // Single-period reports often carry the range only in the header
    if periods.is_empty() {
        let header_start = header
            .and_then(|h| non_empty_str(h.get("StartPeriod")))
            .and_then(parse_date);
        let header_end = header
            .and_then(|h| non_empty_str(h.get("EndPeriod")))
            .and_then(parse_date);
        let first_money = columns
            .iter()
            .position(|col| is_money_column(col) && !is_total_column(col));

        if let (Some(start), Some(end), Some(index)) = (header_start, header_end, first_money) {
            if start <= end {
                periods.push(PeriodColumn { index, start, end });
            }
        }
    }

    Ok(periods)
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

fn group_category(group: &str) -> String {
    match group {
        "Income" => "revenue".to_string(),
        "COGS" => "cost_of_goods_sold".to_string(),
        "Expenses" => "operating_expense".to_string(),
        "OtherIncome" => "other_income".to_string(),
        "OtherExpenses" => "other_expense".to_string(),
        other => to_snake_case(other),
    }
}

fn section_label(row: &Value) -> Option<&str> {
    row.get("Header")
        .and_then(|h| h.get("ColData"))
        .and_then(Value::as_array)
        .and_then(|cells| cells.first())
        .and_then(|cell| non_empty_str(cell.get("value")))
}

impl ReportMapper {
    fn walk_rows(&mut self, rows: &[Value], path: &str, category: Option<&str>) {
        for (i, row) in rows.iter().enumerate() {
            let row_path = format!("{}[{}]", path, i);

            let Some(obj) = row.as_object() else {
                self.skipped += 1;
                continue;
            };

            let is_section = obj.get("type").and_then(Value::as_str) == Some("Section")
                || obj.contains_key("Rows");

            if is_section {
                let group = non_empty_str(obj.get("group"));
                if group.map_or(false, |g| COMPUTED_GROUPS.contains(&g)) {
                    continue;
                }

                let section_category = group
                    .map(group_category)
                    .or_else(|| category.map(str::to_string))
                    .or_else(|| section_label(row).map(to_snake_case))
                    .unwrap_or_else(|| UNCATEGORIZED.to_string());

                if let Some(children) = obj
                    .get("Rows")
                    .and_then(|r| r.get("Row"))
                    .and_then(Value::as_array)
                {
                    let child_path = format!("{}.Rows.Row", row_path);
                    self.walk_rows(children, &child_path, Some(&section_category));
                }
                continue;
            }

            self.map_data_row(row, &row_path, category.unwrap_or(UNCATEGORIZED));
        }
    }

    fn map_data_row(&mut self, row: &Value, row_path: &str, category: &str) {
        let Some(cells) = row.get("ColData").and_then(Value::as_array) else {
            self.skipped += 1;
            return;
        };
        let Some(account_name) = non_empty_str(cells.first().and_then(|c| c.get("value"))) else {
            self.skipped += 1;
            return;
        };

        if self.columns.is_empty() {
            if cells.iter().skip(1).any(|cell| !is_blank(cell.get("value"))) {
                self.unplaced_rows += 1;
            }
            return;
        }

        for column in &self.columns {
            let raw = cells.get(column.index).and_then(|cell| cell.get("value"));

            // Blank cells mean "no activity", not malformed data
            if is_blank(raw) {
                continue;
            }

            match raw.and_then(parse_amount) {
                Some(amount) => self.records.push(CanonicalFinancialRecord {
                    source_system: SourceSystem::QuickBooks,
                    account_name: account_name.to_string(),
                    account_category: category.to_string(),
                    amount,
                    period_start: column.start,
                    period_end: column.end,
                    currency: self.currency.clone(),
                    raw_key: format!("{}.ColData[{}]", row_path, column.index),
                }),
                None => self.skipped += 1,
            }
        }
    }
}
