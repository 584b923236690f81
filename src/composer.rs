//! Answer composer
//!
//! Turns a query result into a short narrative. Results with nothing in them
//! are answered locally; everything else goes through the model.

use std::sync::Arc;
use tracing::debug;

use crate::error::PipelineError;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::memory::{format_turns, ConversationTurn};
use crate::models::QueryResult;
use crate::Result;

pub const NO_DATA_ANSWER: &str = "No data found for this question.";

pub const DEFAULT_PROMPT_ROW_LIMIT: usize = 50;

const SYSTEM_PROMPT: &str = "You are a concise financial analyst.";

const ANSWER_INSTRUCTIONS: &str = "Based on the result of the SQL query above, write a concise \
(1-2 sentences) natural-language answer to the question. Include the most important numbers \
exactly as they appear in the result. You may do simple arithmetic such as percentages in your \
answer, but do not propose another query.";

pub struct AnswerComposer {
    model: Arc<dyn LanguageModel>,
    prompt_row_limit: usize,
}

impl AnswerComposer {
    pub fn new(model: Arc<dyn LanguageModel>, prompt_row_limit: usize) -> Self {
        Self {
            model,
            prompt_row_limit: prompt_row_limit.max(1),
        }
    }

    pub async fn compose(
        &self,
        question: &str,
        sql: &str,
        result: &QueryResult,
        prior_turns: &[ConversationTurn],
    ) -> Result<String> {
        if result.has_no_data() {
            debug!("Result has no data; skipping composition call");
            return Ok(NO_DATA_ANSWER.to_string());
        }

        let request = CompletionRequest::new(SYSTEM_PROMPT, self.build_prompt(question, sql, result, prior_turns))
            .with_temperature(0.2)
            .with_max_output_tokens(512);

        let answer = self.model.generate(&request).await?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(PipelineError::UpstreamError(
                "Model returned an empty answer".to_string(),
            ));
        }

        Ok(answer.to_string())
    }

    fn build_prompt(
        &self,
        question: &str,
        sql: &str,
        result: &QueryResult,
        prior_turns: &[ConversationTurn],
    ) -> String {
        let rows = result.rows_as_json(self.prompt_row_limit);
        let shown = rows.len();
        let data = serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string());

        let mut note = format!("Showing {} of {} rows.", shown, result.row_count());
        if result.truncated {
            note.push_str(" The query returned more rows than the result cap.");
        }

        format!(
            "Recent conversation:\n{history}\n\
             Question: {question}\n\n\
             SQL:\n```sql\n{sql}\n```\n\n\
             Result set ({note}):\n```json\n{data}\n```\n\n\
             {instructions}",
            history = format_turns(prior_turns),
            question = question.trim(),
            sql = sql,
            note = note,
            data = data,
            instructions = ANSWER_INSTRUCTIONS,
        )
    }
}
