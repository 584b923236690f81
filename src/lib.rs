//! Financial Query Engine
//!
//! Normalizes heterogeneous accounting exports into one canonical table and
//! answers natural-language questions about it:
//! - Maps QuickBooks-style reports and Rootfi-style statements into
//!   canonical financial records
//! - Stores records in SQLite with all-or-nothing batch inserts
//! - Turns questions into a single validated read-only SELECT via an LLM
//! - Composes short narrative answers from query results
//! - Remembers recent turns per session for follow-up questions
//!
//! QUESTION → CONTEXT → SYNTHESIZE → GUARD → EXECUTE → COMPOSE → REMEMBER

pub mod api;
pub mod composer;
pub mod config;
pub mod engine;
pub mod error;
pub mod gemini;
pub mod ingestion;
pub mod llm;
pub mod memory;
pub mod models;
pub mod normalizer;
pub mod sql_guard;
pub mod store;
pub mod synthesizer;

pub use error::{PipelineError, Result};

// Re-export common types
pub use engine::QueryEngine;
pub use models::*;
pub use store::RecordStore;
