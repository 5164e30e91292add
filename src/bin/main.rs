use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use stock_trading_agent::dispatcher::{begin_event, ToolDispatcher, TurnRequest, AGENT_SYSTEM_PROMPT};
use stock_trading_agent::heartbeat::HEARTBEAT_PAYLOAD;
use stock_trading_agent::ledger::{JsonFileBackend, LedgerStore};
use stock_trading_agent::llm::GeminiClient;
use stock_trading_agent::models::{ConversationTurn, UserAccount, Utterance};
use stock_trading_agent::settings::Settings;
use stock_trading_agent::tools::{LlmResearch, ToolExecutor};
use rust_decimal_macros::dec;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stock_trading_agent=info".into()),
        )
        .init();

    dotenv::dotenv().ok();
    let settings = Settings::from_env()?;

    info!("🚀 Stock Trading Agent");
    info!("📍 Data directory: {}", settings.data_dir.display());

    let ledger = Arc::new(LedgerStore::new(Arc::new(JsonFileBackend::new(
        &settings.data_dir,
    ))));
    ledger
        .seed_if_empty(vec![
            UserAccount::new("1001", dec!(10000)),
            UserAccount::new("1002", dec!(5000)),
        ])
        .await?;

    let client = Arc::new(
        GeminiClient::new(
            settings.api_key.clone(),
            settings.model.clone(),
            AGENT_SYSTEM_PROMPT.to_string(),
        )
        .with_base_url(settings.base_url.clone()),
    );
    let research = Arc::new(LlmResearch::new(client.clone()));
    let executor = ToolExecutor::new(ledger, research);
    let dispatcher = ToolDispatcher::new(client, executor);

    println!("{}", begin_event().content);

    let mut transcript = ConversationTurn::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print!("> ");
    std::io::stdout().flush()?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            print!("> ");
            std::io::stdout().flush()?;
            continue;
        }

        transcript.push(Utterance::user(line));
        let request = TurnRequest::new(transcript.clone());

        let (tx, mut rx) = mpsc::channel(64);
        let mut reply = String::new();
        let mut call_ended = false;

        let (turn_result, _) = tokio::join!(dispatcher.run_turn(&request, tx), async {
            while let Some(event) = rx.recv().await {
                if event.content != HEARTBEAT_PAYLOAD {
                    print!("{}", event.content);
                    let _ = std::io::stdout().flush();
                    reply.push_str(&event.content);
                }
                if event.end_call {
                    call_ended = true;
                }
            }
            println!();
        });

        if let Err(e) = turn_result {
            error!("Turn failed: {}", e);
            println!("Sorry, something went wrong on my end. Let's try that again.");
        } else if !reply.is_empty() {
            transcript.push(Utterance::agent(reply));
        }

        if call_ended {
            info!("Call ended by the agent");
            break;
        }

        print!("> ");
        std::io::stdout().flush()?;
    }

    Ok(())
}
