//! Batch ingestion
//!
//! Loads a source document (from disk or inline), normalizes it and stores
//! the resulting records as one all-or-nothing batch.

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{DuplicatePolicy, SourceSystem};
use crate::normalizer::normalize;
use crate::store::RecordStore;
use crate::Result;

/// A parsed document tagged with the system it came from
#[derive(Debug, Clone)]
pub struct IngestionBatch {
    pub source_system: SourceSystem,
    pub label: String,
    pub document: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub batch_id: Uuid,
    pub source_system: SourceSystem,
    pub label: String,
    pub normalized: usize,
    pub skipped: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

impl IngestionBatch {
    /// Read and parse a JSON file declared to come from `source`
    pub async fn from_path(source: SourceSystem, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;

        let document: Value = serde_json::from_str(&contents).map_err(|e| {
            PipelineError::NormalizationError(format!("{} is not valid JSON: {}", path.display(), e))
        })?;

        Ok(Self {
            source_system: source,
            label: path.display().to_string(),
            document,
        })
    }

    /// Like [`IngestionBatch::from_path`], with the source taken from the file name
    pub async fn from_path_detected(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = detect_source(path)?;
        Self::from_path(source, path).await
    }

    pub fn inline(source: SourceSystem, document: Value) -> Self {
        Self {
            source_system: source,
            label: "inline".to_string(),
            document,
        }
    }
}

/// `rootfi_*.json` is Rootfi; `qb_*.json` / `quickbooks_*.json` is QuickBooks
pub fn detect_source(path: &Path) -> Result<SourceSystem> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if name.contains("rootfi") {
        Ok(SourceSystem::Rootfi)
    } else if name.contains("quickbooks") || name.contains("qb") {
        Ok(SourceSystem::QuickBooks)
    } else {
        Err(PipelineError::NormalizationError(format!(
            "Cannot tell the source system from file name: {}",
            path.display()
        )))
    }
}

/// Normalize and store one batch
pub async fn ingest_batch(
    store: &RecordStore,
    batch: &IngestionBatch,
    policy: DuplicatePolicy,
) -> Result<IngestionReport> {
    let outcome = normalize(batch.source_system, &batch.document)?;

    let batch_id = Uuid::new_v4();
    let stored = store
        .insert_with_policy(&outcome.records, batch_id, policy)
        .await?;

    info!(
        batch_id = %batch_id,
        source = %batch.source_system,
        label = %batch.label,
        normalized = outcome.records.len(),
        skipped = outcome.skipped,
        inserted = stored.inserted,
        "Ingested batch"
    );

    Ok(IngestionReport {
        batch_id,
        source_system: batch.source_system,
        label: batch.label.clone(),
        normalized: outcome.records.len(),
        skipped: outcome.skipped,
        inserted: stored.inserted,
        duplicates: stored.duplicates,
    })
}
