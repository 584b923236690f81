//! Query synthesizer
//!
//! Turns a natural-language question into one read-only SQL statement over
//! `financial_records`. Model output is untrusted: the extracted statement
//! must pass the single-SELECT guard before it leaves this module.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::memory::{format_turns, ConversationTurn};
use crate::models::{ColumnSpec, SourceSystem};
use crate::normalizer::KNOWN_CATEGORIES;
use crate::sql_guard::validate_single_select;
use crate::store::TABLE_NAME;
use crate::Result;

const SYSTEM_PROMPT: &str = r#"You are a financial analyst assistant. Questions are about a company's
financial data stored in a single SQLite table.

Write exactly ONE SQLite SELECT statement that returns the rows needed to answer
the question. Use only the listed columns. Do not add LIMIT unless the question
asks for it. Never modify data. Return ONLY the SQL statement wrapped in
```sql ... ``` fences.

If the question cannot be answered from this table, return:
```sql
SELECT NULL
```"#;

pub struct QuerySynthesizer {
    model: Arc<dyn LanguageModel>,
}

impl QuerySynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Produce a validated SELECT for `question`
    pub async fn synthesize(
        &self,
        question: &str,
        manifest: &[ColumnSpec],
        prior_turns: &[ConversationTurn],
    ) -> Result<String> {
        let request = CompletionRequest::new(SYSTEM_PROMPT, build_prompt(question, manifest, prior_turns))
            .with_temperature(0.0)
            .with_max_output_tokens(1024);

        let raw = self.model.generate(&request).await?;
        debug!(model = self.model.model_name(), raw = %raw, "Raw SQL response");

        let candidate = extract_sql(&raw).ok_or_else(|| {
            PipelineError::SynthesisError("Model response did not contain a SQL statement".to_string())
        })?;

        if is_null_sentinel(&candidate) {
            return Err(PipelineError::SynthesisError(
                "The question cannot be answered from the stored financial data".to_string(),
            ));
        }

        let sql = validate_single_select(&candidate).map_err(|violation| {
            warn!(%violation, sql = %candidate, "Generated SQL rejected");
            PipelineError::SynthesisError(format!("Generated SQL rejected: {}", violation))
        })?;

        info!(sql = %sql, "Generated SQL");
        Ok(sql)
    }
}

fn build_prompt(question: &str, manifest: &[ColumnSpec], prior_turns: &[ConversationTurn]) -> String {
    let columns = manifest
        .iter()
        .map(|c| format!("- {} {}", c.name, c.data_type))
        .collect::<Vec<_>>()
        .join("\n");

    let sources = SourceSystem::all()
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Table `{table}` columns:\n{columns}\n\n\
         Known account_category values: {categories}\n\
         Known source_system values: {sources}\n\
         period_start and period_end are ISO dates (YYYY-MM-DD). amount is REAL in the record currency.\n\n\
         Recent conversation:\n{history}\n\
         User question: {question}\n",
        table = TABLE_NAME,
        columns = columns,
        categories = KNOWN_CATEGORIES.join(", "),
        sources = sources,
        history = format_turns(prior_turns),
        question = question.trim(),
    )
}

/// Pull the SQL out of a model reply: the first fenced block (language tag
/// dropped), else the paragraph starting at the first SELECT/WITH keyword
pub fn extract_sql(raw: &str) -> Option<String> {
    let candidate = match raw.find("```") {
        Some(open) => {
            let body = &raw[open + 3..];
            let body = match body.find("```") {
                Some(close) => &body[..close],
                None => body,
            };
            strip_language_tag(body)
        }
        None => {
            let start = first_keyword(raw)?;
            let paragraph = &raw[start..];
            match paragraph.find("\n\n") {
                Some(end) => &paragraph[..end],
                None => paragraph,
            }
        }
    };

    let candidate = candidate.trim();
    (!candidate.is_empty()).then(|| candidate.to_string())
}

fn strip_language_tag(body: &str) -> &str {
    match body.split_once('\n') {
        Some((first, rest)) if is_language_tag(first.trim()) => rest,
        _ => body,
    }
}

/// `sql`, `sqlite` and friends; a bare SELECT/WITH opens the query itself
fn is_language_tag(line: &str) -> bool {
    !line.is_empty()
        && line.chars().all(|c| c.is_ascii_alphabetic())
        && !line.eq_ignore_ascii_case("select")
        && !line.eq_ignore_ascii_case("with")
}

/// Byte offset of the first standalone SELECT or WITH
fn first_keyword(raw: &str) -> Option<usize> {
    let upper = raw.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    ["SELECT", "WITH"]
        .iter()
        .filter_map(|keyword| {
            upper.match_indices(keyword).map(|(i, _)| i).find(|&i| {
                let before_ok = i == 0 || !is_word(bytes[i - 1]);
                let after = i + keyword.len();
                let after_ok = after >= bytes.len() || !is_word(bytes[after]);
                before_ok && after_ok
            })
        })
        .min()
}

fn is_null_sentinel(sql: &str) -> bool {
    let normalized = sql
        .trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    normalized == "SELECT NULL"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;

    fn manifest() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec { name: "account_category".to_string(), data_type: "TEXT".to_string() },
            ColumnSpec { name: "amount".to_string(), data_type: "REAL".to_string() },
        ]
    }

    #[test]
    fn test_extracts_fenced_block() {
        let raw = "Here you go:\n```sql\nSELECT SUM(amount) FROM financial_records;\n```\nThis sums revenue.";
        assert_eq!(
            extract_sql(raw).unwrap(),
            "SELECT SUM(amount) FROM financial_records;"
        );

        let bare_fence = "```\nSELECT 1\n```";
        assert_eq!(extract_sql(bare_fence).unwrap(), "SELECT 1");

        let one_line = "```SELECT 2```";
        assert_eq!(extract_sql(one_line).unwrap(), "SELECT 2");
    }

    #[test]
    fn test_keyword_on_its_own_line_is_kept() {
        let raw = "```SELECT\n  amount FROM financial_records```";
        assert_eq!(
            extract_sql(raw).unwrap(),
            "SELECT\n  amount FROM financial_records"
        );

        let cte = "```with\nq AS (SELECT 1) SELECT * FROM q\n```";
        assert_eq!(extract_sql(cte).unwrap(), "with\nq AS (SELECT 1) SELECT * FROM q");

        let tagged = "```sqlite\nSELECT 3\n```";
        assert_eq!(extract_sql(tagged).unwrap(), "SELECT 3");
    }

    #[test]
    fn test_extracts_unfenced_paragraph() {
        let raw = "Sure. select amount from financial_records\nwhere account_category = 'revenue'\n\nThat query lists revenue.";
        assert_eq!(
            extract_sql(raw).unwrap(),
            "select amount from financial_records\nwhere account_category = 'revenue'"
        );
        assert_eq!(extract_sql("I do not know the answer."), None);
        assert_eq!(extract_sql("```sql\n```"), None);
    }

    #[test]
    fn test_keyword_needs_word_boundary() {
        assert_eq!(first_keyword("preselected WITH x AS"), Some(12));
        assert_eq!(first_keyword("withdrawal"), None);
    }

    #[test]
    fn test_null_sentinel() {
        assert!(is_null_sentinel("SELECT NULL;"));
        assert!(is_null_sentinel("  select   null "));
        assert!(!is_null_sentinel("SELECT NULL AS x"));
    }

    #[tokio::test]
    async fn test_synthesize_returns_validated_sql() {
        let model = Arc::new(ScriptedModel::replying(vec![
            "```sql\nSELECT SUM(amount) FROM financial_records WHERE account_category = 'revenue';\n```",
        ]));
        let synthesizer = QuerySynthesizer::new(model.clone());

        let history = vec![ConversationTurn::new("What was rent?", "SELECT 1", "Rent was 250.")];
        let sql = synthesizer
            .synthesize("What was total revenue?", &manifest(), &history)
            .await
            .unwrap();
        assert_eq!(
            sql,
            "SELECT SUM(amount) FROM financial_records WHERE account_category = 'revenue'"
        );

        let prompts = model.prompts().await;
        assert!(prompts[0].contains("- amount REAL"));
        assert!(prompts[0].contains("operating_expense"));
        assert!(prompts[0].contains("quickbooks, rootfi"));
        assert!(prompts[0].contains("Q: What was rent?"));
        assert!(prompts[0].contains("User question: What was total revenue?"));
    }

    #[tokio::test]
    async fn test_chained_statement_is_a_synthesis_error() {
        let model = Arc::new(ScriptedModel::replying(vec![
            "```sql\nSELECT * FROM financial_records; DROP TABLE financial_records;\n```",
        ]));
        let synthesizer = QuerySynthesizer::new(model);

        let err = synthesizer.synthesize("anything", &manifest(), &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::SynthesisError(_)));
    }

    #[tokio::test]
    async fn test_sentinel_and_missing_sql() {
        let model = Arc::new(ScriptedModel::replying(vec![
            "```sql\nSELECT NULL;\n```\nThe data has no headcount.",
            "Sorry, I do not know.",
        ]));
        let synthesizer = QuerySynthesizer::new(model);

        for _ in 0..2 {
            let err = synthesizer.synthesize("How many employees?", &manifest(), &[]).await.unwrap_err();
            assert!(matches!(err, PipelineError::SynthesisError(_)));
        }
    }

    #[tokio::test]
    async fn test_model_failure_is_upstream_error() {
        let model = Arc::new(ScriptedModel::new(vec![Err("timeout".to_string())]));
        let synthesizer = QuerySynthesizer::new(model);

        let err = synthesizer.synthesize("anything", &manifest(), &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamError(_)));
    }
}
