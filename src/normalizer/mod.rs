//! Schema normalizer
//!
//! Maps source-specific JSON exports into canonical financial records.
//! Each source system has its own pure mapping function; unrecognized
//! entries are skipped and counted, only an unrecognized root is fatal.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

use crate::models::{CanonicalFinancialRecord, SourceSystem};
use crate::Result;

pub mod quickbooks;
pub mod rootfi;

pub const DEFAULT_CURRENCY: &str = "USD";

/// Category values produced by the mappers, listed in LLM prompts
pub const KNOWN_CATEGORIES: &[&str] = &[
    "revenue",
    "cost_of_goods_sold",
    "operating_expense",
    "other_income",
    "other_expense",
    "non_operating_revenue",
    "non_operating_expense",
];

/// Records produced from one document, plus the number of entries skipped
#[derive(Debug, Clone, Serialize)]
pub struct NormalizationOutcome {
    pub source_system: SourceSystem,
    pub records: Vec<CanonicalFinancialRecord>,
    pub skipped: usize,
}

/// Normalize a parsed document declared to come from `source`
pub fn normalize(source: SourceSystem, document: &Value) -> Result<NormalizationOutcome> {
    let outcome = match source {
        SourceSystem::QuickBooks => quickbooks::normalize_report(document)?,
        SourceSystem::Rootfi => rootfi::normalize_statements(document)?,
    };

    tracing::debug!(
        source = %source,
        records = outcome.records.len(),
        skipped = outcome.skipped,
        "Normalized document"
    );

    Ok(outcome)
}

/// Parse `YYYY-MM-DD`, ignoring any `T...` time suffix
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.trim().split('T').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Accept JSON numbers and numeric strings such as "1,250.50"
pub(crate) fn parse_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        _ => None,
    }
}

/// "OtherExpenses" -> "other_expenses", "Cost of Sales" -> "cost_of_sales"
pub(crate) fn to_snake_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;

    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }

    out.trim_end_matches('_').to_string()
}

pub(crate) fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
