//! Record store
//!
//! Persists canonical records into the single `financial_records` table and
//! runs read-only SQL over it. Every statement passed to
//! [`RecordStore::execute_readonly`] goes through the single-SELECT guard,
//! whatever the caller already checked.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::query::Query;
use futures::TryStreamExt;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Executor, QueryBuilder, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{
    CanonicalFinancialRecord, CellValue, ColumnSpec, DuplicatePolicy, QueryResult, RecordFilter,
    SourceSystem, StoredFinancialRecord,
};
use crate::sql_guard::validate_single_select;
use crate::Result;

pub const TABLE_NAME: &str = "financial_records";

const DEFAULT_LIST_LIMIT: u32 = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS financial_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      source_system TEXT NOT NULL CHECK (source_system IN ('quickbooks', 'rootfi')),
      account_name TEXT NOT NULL CHECK (length(account_name) > 0),
      account_category TEXT NOT NULL,
      amount REAL NOT NULL,
      period_start DATE NOT NULL,
      period_end DATE NOT NULL,
      currency TEXT NOT NULL DEFAULT 'USD',
      raw_key TEXT NOT NULL,
      fingerprint TEXT NOT NULL,
      batch_id TEXT NOT NULL,
      ingested_at TEXT NOT NULL,
      CHECK (period_start <= period_end)
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_financial_records_fingerprint
    ON financial_records (fingerprint);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_financial_records_category_period
    ON financial_records (account_category, period_start, period_end);
    "#,
];

const INSERT_SQL: &str = r#"
    INSERT INTO financial_records
      (source_system, account_name, account_category, amount, period_start, period_end,
       currency, raw_key, fingerprint, batch_id, ingested_at)
    VALUES
      (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const INSERT_IF_ABSENT_SQL: &str = r#"
    INSERT INTO financial_records
      (source_system, account_name, account_category, amount, period_start, period_end,
       currency, raw_key, fingerprint, batch_id, ingested_at)
    SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
    WHERE NOT EXISTS (SELECT 1 FROM financial_records WHERE fingerprint = ?)
"#;

/// Outcome of one insert batch
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: usize,
    pub duplicates: usize,
}

pub struct RecordStore {
    pool: SqlitePool,
    /// Serializes insert batches against each other
    write_lock: Mutex<()>,
    max_result_rows: usize,
}

impl RecordStore {
    /// Open (creating if needed) the database at `database_url`
    pub async fn connect(database_url: &str, max_result_rows: usize) -> Result<Self> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // An in-memory database lives and dies with its only connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(5)
        };

        // A read cancelled mid-query can hand its connection back with
        // query_only still set; clear it before anyone else gets it.
        let pool_options = pool_options.before_acquire(|conn, _meta| {
            Box::pin(async move {
                conn.execute("PRAGMA query_only = OFF").await?;
                Ok(true)
            })
        });

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            PipelineError::StorageError(format!("Failed to open {}: {}", database_url, e))
        })?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            max_result_rows,
        };
        store.ensure_schema().await?;

        info!(in_memory, "Record store ready");
        Ok(store)
    }

    /// Private in-memory store, mostly for tests and one-off CLI runs
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1_000).await
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                PipelineError::StorageError(format!(
                    "Failed to initialize financial_records schema: {}",
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Insert a batch additively; all-or-nothing
    pub async fn insert(&self, records: &[CanonicalFinancialRecord]) -> Result<usize> {
        let report = self
            .insert_with_policy(records, Uuid::new_v4(), DuplicatePolicy::Append)
            .await?;
        Ok(report.inserted)
    }

    /// Insert a batch in one transaction under the given duplicate policy.
    /// Any constraint violation rolls the whole batch back.
    pub async fn insert_with_policy(
        &self,
        records: &[CanonicalFinancialRecord],
        batch_id: Uuid,
        policy: DuplicatePolicy,
    ) -> Result<InsertReport> {
        let _guard = self.write_lock.lock().await;

        let batch = batch_id.to_string();
        let ingested_at = Utc::now();
        let mut report = InsertReport { inserted: 0, duplicates: 0 };

        let mut tx = self.pool.begin().await?;

        for record in records {
            let fingerprint = record.fingerprint();

            let query = match policy {
                DuplicatePolicy::Append => {
                    bind_record(sqlx::query(INSERT_SQL), record, &fingerprint, &batch, ingested_at)
                }
                DuplicatePolicy::SkipExisting => {
                    bind_record(sqlx::query(INSERT_IF_ABSENT_SQL), record, &fingerprint, &batch, ingested_at)
                        .bind(fingerprint.as_str())
                }
            };

            let affected = query
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    PipelineError::StorageError(format!(
                        "Failed to insert record {} ({}); batch rolled back: {}",
                        record.raw_key, record.account_name, e
                    ))
                })?
                .rows_affected();

            if affected == 0 {
                report.duplicates += 1;
            } else {
                report.inserted += 1;
            }
        }

        tx.commit().await?;

        info!(
            batch_id = %batch_id,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "Stored financial records"
        );

        Ok(report)
    }

    /// Run a single read-only SELECT
    pub async fn execute_readonly(&self, sql: &str) -> Result<QueryResult> {
        let statement = validate_single_select(sql).map_err(|violation| {
            warn!(%violation, "Rejected unsafe SQL");
            PipelineError::UnsafeQueryError(violation.to_string())
        })?;

        let mut conn = self.pool.acquire().await?;

        // Second line of defence: the connection itself refuses writes
        sqlx::query("PRAGMA query_only = ON").execute(&mut *conn).await?;

        let fetched = fetch_bounded(&mut conn, &statement, self.max_result_rows).await;

        if let Err(e) = sqlx::query("PRAGMA query_only = OFF").execute(&mut *conn).await {
            warn!(error = %e, "Failed to clear query_only after read");
        }
        drop(conn);

        let (columns, decoded, truncated) = fetched?;

        debug!(rows = decoded.len(), truncated, "Executed read-only query");

        Ok(QueryResult {
            columns,
            rows: decoded,
            truncated,
        })
    }

    /// Column names and declared types of `financial_records`
    pub async fn column_manifest(&self) -> Result<Vec<ColumnSpec>> {
        let rows = sqlx::query("PRAGMA table_info(financial_records)")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ColumnSpec {
                    name: row.try_get("name")?,
                    data_type: row.try_get("type")?,
                })
            })
            .collect()
    }

    /// Filtered listing, ordered by period then insertion
    pub async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<StoredFinancialRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, source_system, account_name, account_category, amount, period_start, \
             period_end, currency, raw_key, fingerprint, batch_id, ingested_at \
             FROM financial_records WHERE 1 = 1",
        );

        if let Some(category) = &filter.category {
            qb.push(" AND account_category = ").push_bind(category.to_lowercase());
        }
        if let Some(source) = filter.source {
            qb.push(" AND source_system = ").push_bind(source.as_str());
        }
        if let Some(account) = &filter.account {
            qb.push(" AND account_name LIKE '%' || ")
                .push_bind(account.clone())
                .push(" || '%'");
        }
        if let Some(start) = filter.start {
            qb.push(" AND period_start >= ").push_bind(start);
        }
        if let Some(end) = filter.end {
            qb.push(" AND period_end <= ").push_bind(end);
        }

        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        qb.push(" ORDER BY period_start, id LIMIT ").push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(stored_record_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM financial_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }
}

/// Stream rows until `cap` are kept; one more row marks the result truncated
async fn fetch_bounded(
    conn: &mut SqliteConnection,
    statement: &str,
    cap: usize,
) -> Result<(Vec<String>, Vec<Vec<CellValue>>, bool)> {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    let mut truncated = false;

    {
        let mut stream = sqlx::query(statement).persistent(false).fetch(&mut *conn);
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| PipelineError::StorageError(format!("Query failed: {}", e)))?
        {
            if rows.len() == cap {
                truncated = true;
                break;
            }
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            let mut cells = Vec::with_capacity(columns.len());
            for index in 0..row.columns().len() {
                cells.push(decode_cell(&row, index)?);
            }
            rows.push(cells);
        }
    }

    if columns.is_empty() {
        columns = conn
            .describe(statement)
            .await
            .map(|d| d.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
    }

    Ok((columns, rows, truncated))
}

fn bind_record<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    record: &'q CanonicalFinancialRecord,
    fingerprint: &'q str,
    batch_id: &'q str,
    ingested_at: DateTime<Utc>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(record.source_system.as_str())
        .bind(record.account_name.as_str())
        .bind(record.account_category.as_str())
        .bind(record.amount)
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(record.currency.as_str())
        .bind(record.raw_key.as_str())
        .bind(fingerprint)
        .bind(batch_id)
        .bind(ingested_at)
}

fn decode_cell(row: &SqliteRow, index: usize) -> Result<CellValue> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(CellValue::Null);
    }

    // SQLite reports the storage class of the value, not the declared type
    let storage = raw.type_info().name().to_string();

    let cell = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => CellValue::Integer(row.try_get::<i64, _>(index)?),
        "REAL" => CellValue::Real(row.try_get::<f64, _>(index)?),
        "BLOB" => CellValue::Text(format!("<{} bytes>", row.try_get::<Vec<u8>, _>(index)?.len())),
        _ => CellValue::Text(row.try_get::<String, _>(index)?),
    };

    Ok(cell)
}

fn stored_record_from_row(row: &SqliteRow) -> Result<StoredFinancialRecord> {
    let source: String = row.try_get("source_system")?;
    let batch: String = row.try_get("batch_id")?;
    let period_start: NaiveDate = row.try_get("period_start")?;
    let period_end: NaiveDate = row.try_get("period_end")?;

    Ok(StoredFinancialRecord {
        id: row.try_get("id")?,
        batch_id: Uuid::parse_str(&batch).map_err(|e| {
            PipelineError::StorageError(format!("Corrupt batch_id {}: {}", batch, e))
        })?,
        fingerprint: row.try_get("fingerprint")?,
        ingested_at: row.try_get("ingested_at")?,
        record: CanonicalFinancialRecord {
            source_system: SourceSystem::from_str(&source)
                .map_err(|e| PipelineError::StorageError(e.to_string()))?,
            account_name: row.try_get("account_name")?,
            account_category: row.try_get("account_category")?,
            amount: row.try_get("amount")?,
            period_start,
            period_end,
            currency: row.try_get("currency")?,
            raw_key: row.try_get("raw_key")?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn record(account: &str, category: &str, amount: f64, start: (i32, u32, u32), end: (i32, u32, u32)) -> CanonicalFinancialRecord {
        CanonicalFinancialRecord {
            source_system: SourceSystem::QuickBooks,
            account_name: account.to_string(),
            account_category: category.to_string(),
            amount,
            period_start: NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            period_end: NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
            currency: "USD".to_string(),
            raw_key: format!("Rows.Row[0].{}", account),
        }
    }

    fn january(account: &str, category: &str, amount: f64) -> CanonicalFinancialRecord {
        record(account, category, amount, (2024, 1, 1), (2024, 1, 31))
    }

    #[tokio::test]
    async fn test_insert_and_aggregate() {
        let store = RecordStore::in_memory().await.unwrap();
        let inserted = store
            .insert(&[january("Sales", "revenue", 1000.0), january("Rent", "operating_expense", -250.0)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let result = store
            .execute_readonly(
                "SELECT SUM(amount) AS total FROM financial_records WHERE account_category = 'revenue'",
            )
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["total".to_string()]);
        assert_eq!(result.rows, vec![vec![CellValue::Real(1000.0)]]);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = RecordStore::in_memory().await.unwrap();
        let inverted = record("Bad", "revenue", 1.0, (2024, 2, 1), (2024, 1, 1));

        let err = store
            .insert(&[january("Sales", "revenue", 1000.0), inverted, january("Rent", "operating_expense", -5.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StorageError(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_account_name_violates_constraints() {
        let store = RecordStore::in_memory().await.unwrap();
        let err = store.insert(&[january("", "revenue", 1.0)]).await.unwrap_err();
        assert!(matches!(err, PipelineError::StorageError(_)));
    }

    #[tokio::test]
    async fn test_duplicate_policies() {
        let store = RecordStore::in_memory().await.unwrap();
        let batch = vec![january("Sales", "revenue", 1000.0), january("Rent", "operating_expense", -250.0)];

        assert_ok!(store.insert(&batch).await);
        assert_eq!(store.insert(&batch).await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 4);

        let report = store
            .insert_with_policy(&batch, Uuid::new_v4(), DuplicatePolicy::SkipExisting)
            .await
            .unwrap();
        assert_eq!(report, InsertReport { inserted: 0, duplicates: 2 });
        assert_eq!(store.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_skip_existing_dedups_within_batch() {
        let store = RecordStore::in_memory().await.unwrap();
        let sales = january("Sales", "revenue", 1000.0);

        let report = store
            .insert_with_policy(&[sales.clone(), sales], Uuid::new_v4(), DuplicatePolicy::SkipExisting)
            .await
            .unwrap();
        assert_eq!(report, InsertReport { inserted: 1, duplicates: 1 });
    }

    #[tokio::test]
    async fn test_rejects_chained_statements_without_executing() {
        let store = RecordStore::in_memory().await.unwrap();
        store.insert(&[january("Sales", "revenue", 1000.0)]).await.unwrap();

        for sql in [
            "SELECT * FROM financial_records; DROP TABLE financial_records",
            "DELETE FROM financial_records",
            "SELECT 1 -- ; DELETE FROM financial_records",
        ] {
            let err = store.execute_readonly(sql).await.unwrap_err();
            assert!(matches!(err, PipelineError::UnsafeQueryError(_)), "{}", sql);
        }

        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_query_leaves_store_writable() {
        let store = RecordStore::in_memory().await.unwrap();

        let err = store.execute_readonly("SELECT * FROM missing_table").await.unwrap_err();
        assert!(matches!(err, PipelineError::StorageError(_)));

        assert_eq!(store.insert(&[january("Sales", "revenue", 1.0)]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_result_rows_are_capped() {
        let store = RecordStore::connect("sqlite::memory:", 2).await.unwrap();
        store
            .insert(&[
                january("A", "revenue", 1.0),
                january("B", "revenue", 2.0),
                january("C", "revenue", 3.0),
            ])
            .await
            .unwrap();

        let result = store
            .execute_readonly("SELECT account_name, amount FROM financial_records ORDER BY id")
            .await
            .unwrap();
        assert_eq!(result.row_count(), 2);
        assert!(result.truncated);
        assert_eq!(result.rows[0][0], CellValue::Text("A".to_string()));
    }

    #[tokio::test]
    async fn test_row_cap_stops_unbounded_query() {
        let store = RecordStore::connect("sqlite::memory:", 3).await.unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            store.execute_readonly(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c",
            ),
        )
        .await
        .expect("capped read should stop streaming")
        .unwrap();

        assert_eq!(result.columns, vec!["x".to_string()]);
        assert_eq!(result.row_count(), 3);
        assert!(result.truncated);
        assert_eq!(store.insert(&[january("Sales", "revenue", 1.0)]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_result_at_cap_is_not_truncated() {
        let store = RecordStore::connect("sqlite::memory:", 2).await.unwrap();
        store
            .insert(&[january("A", "revenue", 1.0), january("B", "revenue", 2.0)])
            .await
            .unwrap();

        let result = store
            .execute_readonly("SELECT account_name FROM financial_records")
            .await
            .unwrap();
        assert_eq!(result.row_count(), 2);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_cancelled_read_leaves_store_writable() {
        let store = RecordStore::in_memory().await.unwrap();

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            store.execute_readonly(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 5000000) \
                 SELECT COUNT(*) FROM c",
            ),
        )
        .await;
        assert!(cancelled.is_err());

        let inserted = assert_ok!(store.insert(&[january("Sales", "revenue", 1000.0)]).await);
        assert_eq!(inserted, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_keeps_column_names() {
        let store = RecordStore::in_memory().await.unwrap();
        let result = store
            .execute_readonly("SELECT account_name, amount FROM financial_records")
            .await
            .unwrap();
        assert_eq!(result.row_count(), 0);
        assert_eq!(result.columns, vec!["account_name".to_string(), "amount".to_string()]);
    }

    #[tokio::test]
    async fn test_column_manifest() {
        let store = RecordStore::in_memory().await.unwrap();
        let manifest = store.column_manifest().await.unwrap();

        let amount = manifest.iter().find(|c| c.name == "amount").unwrap();
        assert_eq!(amount.data_type, "REAL");
        for name in ["source_system", "account_name", "account_category", "period_start", "period_end", "currency", "raw_key"] {
            assert!(manifest.iter().any(|c| c.name == name), "missing {}", name);
        }
    }

    #[tokio::test]
    async fn test_list_records_filters() {
        let store = RecordStore::in_memory().await.unwrap();
        store
            .insert(&[
                january("Sales", "revenue", 1000.0),
                record("Sales", "revenue", 1200.0, (2024, 2, 1), (2024, 2, 29)),
                january("Rent", "operating_expense", -250.0),
            ])
            .await
            .unwrap();

        let revenue = store
            .list_records(&RecordFilter {
                category: Some("Revenue".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(revenue.len(), 2);
        assert_eq!(revenue[0].record.amount, 1000.0);

        let february = store
            .list_records(&RecordFilter {
                start: NaiveDate::from_ymd_opt(2024, 2, 1),
                source: Some(SourceSystem::QuickBooks),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(february.len(), 1);
        assert_eq!(february[0].record.period_end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());

        let rent = store
            .list_records(&RecordFilter {
                account: Some("ren".to_string()),
                limit: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rent.len(), 1);
        assert_eq!(rent[0].record.account_name, "Rent");
    }
}
