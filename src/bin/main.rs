use clap::{Parser, Subcommand};
use financial_query_engine::{
    config::AppConfig,
    engine::QueryEngine,
    error::PipelineError,
    gemini::GeminiClient,
    ingestion::{ingest_batch, IngestionBatch},
    memory::ConversationContext,
    models::{DuplicatePolicy, RecordFilter, SourceSystem},
    store::RecordStore,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(name = "finq", about = "Normalize financial exports and query them in plain English")]
struct Cli {
    /// Overrides DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Normalize and store one or more JSON exports
    Ingest {
        files: Vec<PathBuf>,
        /// quickbooks | qb | rootfi; detected from the file name when omitted
        #[arg(long, value_parser = parse_source)]
        source: Option<SourceSystem>,
        /// Skip records that are already stored
        #[arg(long)]
        skip_existing: bool,
    },
    /// Ask a single question
    Ask {
        question: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Interactive session; one question per line
    Chat,
    /// Print the column manifest of the records table
    Schema,
    /// List stored records
    Records {
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_parser = parse_source)]
        source: Option<SourceSystem>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

fn parse_source(raw: &str) -> Result<SourceSystem, PipelineError> {
    SourceSystem::from_str(raw)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,financial_query_engine=info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let store = Arc::new(RecordStore::connect(&config.database_url, config.max_result_rows).await?);

    match cli.command {
        Command::Ingest {
            files,
            source,
            skip_existing,
        } => {
            let policy = if skip_existing {
                DuplicatePolicy::SkipExisting
            } else {
                DuplicatePolicy::Append
            };

            for path in files {
                let batch = match source {
                    Some(source) => IngestionBatch::from_path(source, &path).await?,
                    None => IngestionBatch::from_path_detected(&path).await?,
                };
                let report = ingest_batch(&store, &batch, policy).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }

        Command::Ask { question, session } => {
            let engine = build_engine(&config, store)?;
            let answer = engine.ask(session.as_deref(), &question).await?;
            println!("{}", answer.answer);
            println!();
            println!("SQL: {}", answer.sql);
            println!("session: {}", answer.session_id);
        }

        Command::Chat => {
            let engine = build_engine(&config, store)?;
            let session_id = uuid::Uuid::new_v4().to_string();
            info!(session_id = %session_id, "Starting chat session");

            let stdin = BufReader::new(tokio::io::stdin());
            chat_loop(&engine, &session_id, stdin, &mut io::stdout()).await?;
        }

        Command::Schema => {
            for column in store.column_manifest().await? {
                println!("{:<20} {}", column.name, column.data_type);
            }
        }

        Command::Records {
            category,
            source,
            limit,
        } => {
            let filter = RecordFilter {
                category,
                source,
                limit: Some(limit),
                ..Default::default()
            };
            for stored in store.list_records(&filter).await? {
                let r = &stored.record;
                println!(
                    "{:>6}  {:<10} {:<24} {:<20} {:>14.2} {} {}..{}",
                    stored.id,
                    r.source_system.as_str(),
                    r.account_name,
                    r.account_category,
                    r.amount,
                    r.currency,
                    r.period_start,
                    r.period_end
                );
            }
        }
    }

    Ok(())
}

/// One question per line until EOF or `exit`/`quit`
async fn chat_loop<R, W>(
    engine: &QueryEngine,
    session_id: &str,
    input: R,
    out: &mut W,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    write!(out, "> ")?;
    out.flush()?;
    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        if question.eq_ignore_ascii_case("exit") || question.eq_ignore_ascii_case("quit") {
            break;
        }
        if !question.is_empty() {
            match engine.ask(Some(session_id), question).await {
                Ok(answer) => writeln!(out, "{}\n  [{}]", answer.answer, answer.sql)?,
                Err(e) => writeln!(out, "error: {}", e)?,
            }
        }
        write!(out, "> ")?;
        out.flush()?;
    }
    Ok(())
}

fn build_engine(
    config: &AppConfig,
    store: Arc<RecordStore>,
) -> Result<QueryEngine, PipelineError> {
    let model = Arc::new(GeminiClient::new(config.gemini.clone())?);
    let context = Arc::new(ConversationContext::new(config.conversation_window));
    Ok(QueryEngine::new(store, model, context, config.prompt_row_limit))
}
