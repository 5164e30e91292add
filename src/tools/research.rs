//! Market research and price lookup
//!
//! Research answers come from non-streamed model completions. Price
//! quotes are requested as a single-word answer and parsed out of the
//! reply, tolerating extra prose around the number.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::llm::CompletionClient;
use crate::Result;

const RESEARCH_SYSTEM_PROMPT: &str = "You are a stock market research analyst. \
    Summarize the company's recent performance, notable news, and overall outlook \
    in a few short paragraphs. Be factual and concise.";

const SEARCH_SYSTEM_PROMPT: &str = "You are a web research assistant. \
    Answer the query concisely and factually.";

const PRICE_SYSTEM_PROMPT: &str = "You answer stock price questions. \
    Reply with the price in strictly one word. Such as '$100'.";

/// Research capability behind the lookup tools. Tests substitute canned
/// providers.
#[async_trait::async_trait]
pub trait ResearchProvider: Send + Sync {
    /// Full market research blurb for a company.
    async fn market_research(&self, company_name: &str) -> Result<String>;

    /// Free-form web search answer.
    async fn web_search(&self, query: &str) -> Result<String>;

    /// Short price quote for a company, e.g. `$187.34`.
    async fn price_quote(&self, company_name: &str) -> Result<String>;
}

/// Model-backed research provider.
pub struct LlmResearch {
    client: Arc<dyn CompletionClient>,
}

impl LlmResearch {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ResearchProvider for LlmResearch {
    async fn market_research(&self, company_name: &str) -> Result<String> {
        debug!(%company_name, "Running market research");
        self.client
            .complete(
                RESEARCH_SYSTEM_PROMPT,
                &format!("Research the stock of {}.", company_name),
            )
            .await
    }

    async fn web_search(&self, query: &str) -> Result<String> {
        debug!(%query, "Running web search");
        self.client.complete(SEARCH_SYSTEM_PROMPT, query).await
    }

    async fn price_quote(&self, company_name: &str) -> Result<String> {
        let quote = self
            .client
            .complete(
                PRICE_SYSTEM_PROMPT,
                &format!("What is the current stock price of {}?", company_name),
            )
            .await?;
        debug!(%company_name, %quote, "Price quote received");
        Ok(quote)
    }
}

static PRICE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\$|usd\s*)?(\d+(?:\.\d+)?)").expect("price pattern is valid")
});

/// Pull the first price out of a quote reply, tolerating a `$` or `USD`
/// marker in either case. Returns `None` when no number is present, which
/// callers surface as a price failure.
pub fn extract_price(quote: &str) -> Option<Decimal> {
    let captures = PRICE_PATTERN.captures(quote)?;
    match captures[1].parse::<Decimal>() {
        Ok(price) => Some(price),
        Err(e) => {
            warn!(%quote, "Unparseable price capture: {}", e);
            None
        }
    }
}
