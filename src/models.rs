//! Core data models for the financial query pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PipelineError;

//
// ================= Enums =================
//

/// Originating export format of a record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceSystem {
    QuickBooks,
    Rootfi,
}

impl SourceSystem {
    /// Value stored in the `source_system` column
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::QuickBooks => "quickbooks",
            SourceSystem::Rootfi => "rootfi",
        }
    }

    pub fn all() -> [SourceSystem; 2] {
        [SourceSystem::QuickBooks, SourceSystem::Rootfi]
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceSystem::QuickBooks => "QuickBooks",
            SourceSystem::Rootfi => "Rootfi",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SourceSystem {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "quickbooks" | "qb" => Ok(SourceSystem::QuickBooks),
            "rootfi" => Ok(SourceSystem::Rootfi),
            other => Err(PipelineError::InvalidRequest(format!(
                "Unknown source system: {}",
                other
            ))),
        }
    }
}

/// What to do when an ingested record is already stored
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Re-ingestion is additive
    #[default]
    Append,
    /// Skip records whose fingerprint is already stored
    SkipExisting,
}

//
// ================= Records =================
//

/// The unified row shape every source format maps into
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalFinancialRecord {
    pub source_system: SourceSystem,
    pub account_name: String,
    pub account_category: String,
    pub amount: f64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub currency: String,
    pub raw_key: String,
}

impl CanonicalFinancialRecord {
    /// Stable identity used by `DuplicatePolicy::SkipExisting`
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for part in [
            self.source_system.as_str(),
            self.raw_key.as_str(),
            self.account_name.as_str(),
            self.account_category.as_str(),
            self.currency.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.period_start.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.period_end.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.amount.to_bits().to_be_bytes());

        hex::encode(hasher.finalize())
    }
}

/// A canonical record as read back from the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFinancialRecord {
    pub id: i64,
    pub batch_id: Uuid,
    pub fingerprint: String,
    pub ingested_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: CanonicalFinancialRecord,
}

/// Optional filters for listing stored records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub category: Option<String>,
    pub source: Option<SourceSystem>,
    pub account: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub limit: Option<u32>,
}

//
// ================= Queries =================
//

/// One entry of the table's column manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
}

/// A single cell of a query result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Integer(i) => Value::from(*i),
            CellValue::Real(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Column names plus rows returned by a read-only query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Set when rows beyond the store's cap were dropped
    #[serde(default)]
    pub truncated: bool,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// True when there is nothing to talk about: no rows, or only NULLs
    /// (an aggregate over zero matching rows).
    pub fn has_no_data(&self) -> bool {
        self.rows.iter().all(|row| row.iter().all(CellValue::is_null))
    }

    /// First `limit` rows as JSON objects keyed by column name
    pub fn rows_as_json(&self, limit: usize) -> Vec<Value> {
        self.rows
            .iter()
            .take(limit)
            .map(|row| {
                let mut obj = Map::with_capacity(self.columns.len());
                for (column, cell) in self.columns.iter().zip(row.iter()) {
                    obj.insert(column.clone(), cell.to_json());
                }
                Value::Object(obj)
            })
            .collect()
    }
}

//
// ================= Answers =================
//

/// Result of the question-answering flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub session_id: String,
    pub question: String,
    pub sql: String,
    pub answer: String,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub truncated: bool,
}
