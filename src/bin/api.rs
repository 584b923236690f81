use financial_query_engine::{
    api::start_server,
    config::AppConfig,
    engine::QueryEngine,
    gemini::GeminiClient,
    llm::LanguageModel,
    memory::ConversationContext,
    store::RecordStore,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    if config.gemini.api_key.is_none() {
        warn!("GEMINI_API_KEY not set; questions will fail until it is configured");
    }

    info!("Financial Query Engine - API Server");
    info!("Port: {}", config.port);
    info!("Database: {}", config.database_url);

    // Create components
    let store = Arc::new(RecordStore::connect(&config.database_url, config.max_result_rows).await?);
    let model: Arc<dyn LanguageModel> = Arc::new(GeminiClient::new(config.gemini.clone())?);
    let context = Arc::new(ConversationContext::new(config.conversation_window));

    info!(model = model.model_name(), "Language model configured");

    let engine = Arc::new(QueryEngine::new(
        store,
        model,
        context,
        config.prompt_row_limit,
    ));

    info!("Starting API server...");

    start_server(engine, config.port).await?;

    Ok(())
}
