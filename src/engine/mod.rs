//! Query engine
//!
//! QUESTION → CONTEXT → SYNTHESIZE → EXECUTE → COMPOSE → REMEMBER
//!
//! The store is never locked while a model call is in flight: reads take no
//! lock and the synthesizer/composer only see owned data.

use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::composer::AnswerComposer;
use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::memory::{ConversationContext, ConversationTurn};
use crate::models::Answer;
use crate::store::RecordStore;
use crate::synthesizer::QuerySynthesizer;
use crate::Result;

pub struct QueryEngine {
    store: Arc<RecordStore>,
    context: Arc<ConversationContext>,
    synthesizer: QuerySynthesizer,
    composer: AnswerComposer,
}

impl QueryEngine {
    pub fn new(
        store: Arc<RecordStore>,
        model: Arc<dyn LanguageModel>,
        context: Arc<ConversationContext>,
        prompt_row_limit: usize,
    ) -> Self {
        Self {
            store,
            context,
            synthesizer: QuerySynthesizer::new(model.clone()),
            composer: AnswerComposer::new(model, prompt_row_limit),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn context(&self) -> &Arc<ConversationContext> {
        &self.context
    }

    /// Answer one question, continuing `session_id` or starting a new session
    pub async fn ask(&self, session_id: Option<&str>, question: &str) -> Result<Answer> {
        let start_time = Instant::now();

        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::InvalidRequest("Question must not be empty".to_string()));
        }

        let session_id = match session_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        info!(session_id = %session_id, question = %question, "QueryEngine: question received");

        let prior_turns = self
            .context
            .recent_turns(&session_id, self.context.window())
            .await;
        let manifest = self.store.column_manifest().await?;

        let sql = self
            .synthesizer
            .synthesize(question, &manifest, &prior_turns)
            .await?;

        let result = self.store.execute_readonly(&sql).await?;

        let answer = self
            .composer
            .compose(question, &sql, &result, &prior_turns)
            .await?;

        self.context
            .append(&session_id, ConversationTurn::new(question, sql.clone(), answer.clone()))
            .await;

        info!(
            session_id = %session_id,
            rows = result.row_count(),
            truncated = result.truncated,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "QueryEngine: answer ready"
        );

        Ok(Answer {
            session_id,
            question: question.to_string(),
            sql,
            answer,
            columns: result.columns,
            row_count: result.rows.len(),
            truncated: result.truncated,
        })
    }
}
