//! Rootfi-style statement mapping
//!
//! Rootfi exports are a flat list of period objects. An entry is either a
//! statement (category arrays of line items for one period) or a single
//! transaction-like object with a scalar `value`.

use chrono::NaiveDate;
use serde_json::{Map, Value};

use super::{non_empty_str, parse_amount, parse_date, to_snake_case, NormalizationOutcome, DEFAULT_CURRENCY};
use crate::error::PipelineError;
use crate::models::{CanonicalFinancialRecord, SourceSystem};
use crate::Result;

/// Statement keys and the category their line items map to
const STATEMENT_SECTIONS: &[(&str, &str)] = &[
    ("revenue", "revenue"),
    ("cost_of_goods_sold", "cost_of_goods_sold"),
    ("operating_expenses", "operating_expense"),
    ("non_operating_revenue", "non_operating_revenue"),
    ("non_operating_expenses", "non_operating_expense"),
];

struct EntryContext<'a> {
    start: NaiveDate,
    end: NaiveDate,
    currency: &'a str,
}

#[derive(Default)]
struct StatementMapper {
    records: Vec<CanonicalFinancialRecord>,
    skipped: usize,
}

/// Map a Rootfi-style export into canonical records
pub fn normalize_statements(document: &Value) -> Result<NormalizationOutcome> {
    let (entries, base_path) = match document {
        Value::Array(items) => (items, ""),
        Value::Object(obj) => match obj.get("data") {
            Some(Value::Array(items)) => (items, "data"),
            _ => {
                return Err(PipelineError::NormalizationError(
                    "Rootfi document must be an array or an object with a `data` array".to_string(),
                ))
            }
        },
        _ => {
            return Err(PipelineError::NormalizationError(
                "Rootfi document must be an array or an object with a `data` array".to_string(),
            ))
        }
    };

    let mut mapper = StatementMapper::default();

    for (i, entry) in entries.iter().enumerate() {
        let path = format!("{}[{}]", base_path, i);

        let Some(obj) = entry.as_object() else {
            mapper.skipped += 1;
            continue;
        };

        let Some((start, end)) = entry_period(obj) else {
            mapper.skipped += 1;
            continue;
        };

        let currency = non_empty_str(obj.get("currency_id"))
            .or_else(|| non_empty_str(obj.get("currency")))
            .unwrap_or(DEFAULT_CURRENCY);
        let ctx = EntryContext { start, end, currency };

        let is_transaction = matches!(obj.get("value"), Some(Value::Number(_)) | Some(Value::String(_)));
        if is_transaction {
            mapper.map_transaction(obj, &path, &ctx);
        } else {
            mapper.map_statement(obj, &path, &ctx);
        }
    }

    Ok(NormalizationOutcome {
        source_system: SourceSystem::Rootfi,
        records: mapper.records,
        skipped: mapper.skipped,
    })
}

fn entry_period(obj: &Map<String, Value>) -> Option<(NaiveDate, NaiveDate)> {
    let explicit_start = non_empty_str(obj.get("period_start"));
    let explicit_end = non_empty_str(obj.get("period_end"));

    let (start, end) = match (explicit_start, explicit_end) {
        (Some(start), Some(end)) => (parse_date(start)?, parse_date(end)?),
        (None, None) => parse_period(non_empty_str(obj.get("period"))?)?,
        _ => return None,
    };

    (start <= end).then_some((start, end))
}

/// Period labels: `Q1-2024`, `2024-Q1`, `2024-01`, `2024`, `2024-01-15`
pub(crate) fn parse_period(raw: &str) -> Option<(NaiveDate, NaiveDate)> {
    let label = raw.trim().to_uppercase();

    if let Some(day) = parse_date(&label) {
        return Some((day, day));
    }

    if let Some((left, right)) = label.split_once('-') {
        if let Some(q) = left.strip_prefix('Q') {
            return quarter_range(q, right);
        }
        if let Some(q) = right.strip_prefix('Q') {
            return quarter_range(q, left);
        }
        if left.len() != 4 {
            return None;
        }
        let year: i32 = left.parse().ok()?;
        let month: u32 = right.parse().ok()?;
        return Some((NaiveDate::from_ymd_opt(year, month, 1)?, last_day_of_month(year, month)?));
    }

    if label.len() == 4 {
        let year: i32 = label.parse().ok()?;
        return Some((NaiveDate::from_ymd_opt(year, 1, 1)?, NaiveDate::from_ymd_opt(year, 12, 31)?));
    }

    None
}

fn quarter_range(quarter: &str, year: &str) -> Option<(NaiveDate, NaiveDate)> {
    let quarter: u32 = quarter.parse().ok().filter(|q| (1..=4).contains(q))?;
    let year: i32 = year.parse().ok()?;
    let start = NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1)?;
    let end = last_day_of_month(year, quarter * 3)?;
    Some((start, end))
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

impl StatementMapper {
    fn push(&mut self, ctx: &EntryContext<'_>, account_name: &str, category: &str, amount: f64, raw_key: String) {
        self.records.push(CanonicalFinancialRecord {
            source_system: SourceSystem::Rootfi,
            account_name: account_name.to_string(),
            account_category: category.to_string(),
            amount,
            period_start: ctx.start,
            period_end: ctx.end,
            currency: ctx.currency.to_string(),
            raw_key,
        });
    }

    fn map_transaction(&mut self, obj: &Map<String, Value>, path: &str, ctx: &EntryContext<'_>) {
        let category = non_empty_str(obj.get("type"))
            .or_else(|| non_empty_str(obj.get("category")))
            .map(to_snake_case);
        let Some(category) = category.filter(|c| !c.is_empty()) else {
            self.skipped += 1;
            return;
        };

        let Some(amount) = obj.get("value").and_then(parse_amount) else {
            self.skipped += 1;
            return;
        };

        let account_name = non_empty_str(obj.get("name"))
            .or_else(|| non_empty_str(obj.get("sub_category")))
            .unwrap_or(&category)
            .to_string();

        self.push(ctx, &account_name, &category, amount, format!("{}.value", path));
    }

    fn map_statement(&mut self, obj: &Map<String, Value>, path: &str, ctx: &EntryContext<'_>) {
        let mut recognized = false;

        for (key, category) in STATEMENT_SECTIONS {
            let Some(section) = obj.get(*key) else {
                continue;
            };
            recognized = true;

            match section {
                Value::Array(items) => {
                    self.map_line_items(items, &format!("{}.{}", path, key), category, ctx)
                }
                Value::Null => {}
                _ => self.skipped += 1,
            }
        }

        if !recognized {
            self.skipped += 1;
        }
    }

    /// Leaf line items become records; parents only group their children
    fn map_line_items(&mut self, items: &[Value], path: &str, category: &str, ctx: &EntryContext<'_>) {
        for (j, item) in items.iter().enumerate() {
            let item_path = format!("{}[{}]", path, j);

            let Some(obj) = item.as_object() else {
                self.skipped += 1;
                continue;
            };

            if let Some(children) = obj
                .get("line_items")
                .and_then(Value::as_array)
                .filter(|c| !c.is_empty())
            {
                self.map_line_items(children, &format!("{}.line_items", item_path), category, ctx);
                continue;
            }

            let Some(name) = non_empty_str(obj.get("name")) else {
                self.skipped += 1;
                continue;
            };
            let Some(amount) = obj.get("value").and_then(parse_amount) else {
                self.skipped += 1;
                continue;
            };

            self.push(ctx, name, category, amount, item_path);
        }
    }
}
