//! Tool surface of the agent
//!
//! The model can only request tools from the closed [`ToolCall`] set; a
//! name outside it is rejected at parse time rather than dispatched
//! dynamically. Execution produces JSON result blobs: domain rejections
//! (insufficient balance, unknown user, unusable price) come back as
//! `{"error": ...}` payloads for the summarization pass, while transport
//! and storage failures propagate as errors and fail the turn.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::ledger::{LedgerError, LedgerStore};
use crate::Result;

pub mod research;
pub use research::{extract_price, LlmResearch, ResearchProvider};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ToolParseError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// Every tool the agent can execute. Closed by construction: adding a
/// tool means adding a variant, a schema, and an `execute` arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    /// Terminal farewell: short-circuits the turn, no execution pass.
    EndCall { message: String },
    MarketResearch { company_name: String },
    QuickStockCheck { company_name: String },
    WebSearch { query: String },
    GetUserProfile { userid: String },
    BuyStock {
        userid: String,
        stock_symbol: String,
        quantity: u64,
    },
    SellStock {
        userid: String,
        stock_symbol: String,
        quantity: u64,
    },
}

impl ToolCall {
    /// Map a named invocation onto the closed set, validating arguments.
    pub fn parse(name: &str, arguments: &Value) -> std::result::Result<Self, ToolParseError> {
        match name {
            "end_call" => Ok(ToolCall::EndCall {
                message: require_str(name, arguments, "message")?,
            }),
            "market_research" => Ok(ToolCall::MarketResearch {
                company_name: require_str(name, arguments, "company_name")?,
            }),
            "quick_stock_check" => Ok(ToolCall::QuickStockCheck {
                company_name: require_str(name, arguments, "company_name")?,
            }),
            "web_search" => Ok(ToolCall::WebSearch {
                query: require_str(name, arguments, "query")?,
            }),
            "get_user_profile" => Ok(ToolCall::GetUserProfile {
                userid: require_str(name, arguments, "userid")?,
            }),
            "buy_stock" => Ok(ToolCall::BuyStock {
                userid: require_str(name, arguments, "userid")?,
                stock_symbol: require_str(name, arguments, "stock_symbol")?,
                quantity: require_u64(name, arguments, "quantity")?,
            }),
            "sell_stock" => Ok(ToolCall::SellStock {
                userid: require_str(name, arguments, "userid")?,
                stock_symbol: require_str(name, arguments, "stock_symbol")?,
                quantity: require_u64(name, arguments, "quantity")?,
            }),
            other => Err(ToolParseError::UnknownTool(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::EndCall { .. } => "end_call",
            ToolCall::MarketResearch { .. } => "market_research",
            ToolCall::QuickStockCheck { .. } => "quick_stock_check",
            ToolCall::WebSearch { .. } => "web_search",
            ToolCall::GetUserProfile { .. } => "get_user_profile",
            ToolCall::BuyStock { .. } => "buy_stock",
            ToolCall::SellStock { .. } => "sell_stock",
        }
    }

    /// Spoken-style phrase emitted before the tool runs.
    pub fn started_phrase(&self) -> &'static str {
        match self {
            ToolCall::EndCall { .. } => "Wrapping up.",
            ToolCall::MarketResearch { .. } => "Let me research that for you.",
            ToolCall::QuickStockCheck { .. } => "Checking the price now.",
            ToolCall::WebSearch { .. } => "Looking that up.",
            ToolCall::GetUserProfile { .. } => "Pulling up the account.",
            ToolCall::BuyStock { .. } => "Placing that buy order.",
            ToolCall::SellStock { .. } => "Placing that sell order.",
        }
    }

    /// Function schemas advertised to the model, OpenAI tool shape.
    pub fn schemas() -> Vec<Value> {
        vec![
            function_schema(
                "end_call",
                "End the conversation with a short farewell message.",
                json!({
                    "message": { "type": "string", "description": "Farewell message spoken to the user." }
                }),
                &["message"],
            ),
            function_schema(
                "market_research",
                "In-depth research on a company's stock: performance, news, outlook.",
                json!({
                    "company_name": { "type": "string", "description": "Company to research." }
                }),
                &["company_name"],
            ),
            function_schema(
                "quick_stock_check",
                "Current stock price of a company.",
                json!({
                    "company_name": { "type": "string", "description": "Company to price." }
                }),
                &["company_name"],
            ),
            function_schema(
                "web_search",
                "General web search for anything outside the other tools.",
                json!({
                    "query": { "type": "string", "description": "Search query." }
                }),
                &["query"],
            ),
            function_schema(
                "get_user_profile",
                "The user's bank balance and share holdings.",
                json!({
                    "userid": { "type": "string", "description": "Account identifier." }
                }),
                &["userid"],
            ),
            function_schema(
                "buy_stock",
                "Buy shares at the current market price.",
                json!({
                    "userid": { "type": "string", "description": "Account identifier." },
                    "stock_symbol": { "type": "string", "description": "Ticker symbol, e.g. AAPL." },
                    "quantity": { "type": "integer", "description": "Number of shares to buy." }
                }),
                &["userid", "stock_symbol", "quantity"],
            ),
            function_schema(
                "sell_stock",
                "Sell shares at the current market price.",
                json!({
                    "userid": { "type": "string", "description": "Account identifier." },
                    "stock_symbol": { "type": "string", "description": "Ticker symbol, e.g. AAPL." },
                    "quantity": { "type": "integer", "description": "Number of shares to sell." }
                }),
                &["userid", "stock_symbol", "quantity"],
            ),
        ]
    }
}

fn function_schema(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false
            }
        }
    })
}

fn require_str(
    tool: &str,
    arguments: &Value,
    key: &str,
) -> std::result::Result<String, ToolParseError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ToolParseError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("missing or empty string field '{}'", key),
        })
}

fn require_u64(
    tool: &str,
    arguments: &Value,
    key: &str,
) -> std::result::Result<u64, ToolParseError> {
    arguments
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ToolParseError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("missing or non-integer field '{}'", key),
        })
}

//
// ================= Execution =================
//

/// Runs parsed tool calls against the ledger and the research provider.
#[derive(Clone)]
pub struct ToolExecutor {
    ledger: Arc<LedgerStore>,
    research: Arc<dyn ResearchProvider>,
}

impl ToolExecutor {
    pub fn new(ledger: Arc<LedgerStore>, research: Arc<dyn ResearchProvider>) -> Self {
        Self { ledger, research }
    }

    /// Execute one call, producing the raw JSON result blob handed to the
    /// summarization pass.
    pub async fn execute(&self, call: ToolCall) -> Result<String> {
        info!(tool = call.name(), "Executing tool");

        match call {
            ToolCall::EndCall { message } => Ok(message_blob(&message)),
            ToolCall::MarketResearch { company_name } => {
                let findings = self.research.market_research(&company_name).await?;
                Ok(message_blob(&findings))
            }
            ToolCall::QuickStockCheck { company_name } => {
                let quote = self.research.price_quote(&company_name).await?;
                Ok(message_blob(&quote))
            }
            ToolCall::WebSearch { query } => {
                let answer = self.research.web_search(&query).await?;
                Ok(message_blob(&answer))
            }
            ToolCall::GetUserProfile { userid } => {
                match self.ledger.profile(&userid).await {
                    Ok(account) => Ok(serde_json::to_string(&account)?),
                    Err(error) => self.ledger_outcome(error),
                }
            }
            ToolCall::BuyStock {
                userid,
                stock_symbol,
                quantity,
            } => {
                let price = match self.market_price(&stock_symbol).await? {
                    Ok(price) => price,
                    Err(blob) => return Ok(blob),
                };
                match self.ledger.buy(&userid, &stock_symbol, quantity, price).await {
                    Ok(outcome) => Ok(json!({
                        "message": "Stock purchased successfully.",
                        "stock_symbol": stock_symbol,
                        "shares": quantity,
                        "price_per_share": price.to_string(),
                        "bank_balance": outcome.account.bank_balance.to_string(),
                    })
                    .to_string()),
                    Err(error) => self.ledger_outcome(error),
                }
            }
            ToolCall::SellStock {
                userid,
                stock_symbol,
                quantity,
            } => {
                let price = match self.market_price(&stock_symbol).await? {
                    Ok(price) => price,
                    Err(blob) => return Ok(blob),
                };
                match self.ledger.sell(&userid, &stock_symbol, quantity, price).await {
                    Ok(outcome) => Ok(json!({
                        "message": "Stock sold successfully.",
                        "stock_symbol": stock_symbol,
                        "shares": quantity,
                        "price_per_share": price.to_string(),
                        "bank_balance": outcome.account.bank_balance.to_string(),
                    })
                    .to_string()),
                    Err(error) => self.ledger_outcome(error),
                }
            }
        }
    }

    /// Quote and parse the current price. The outer error is a turn
    /// failure; the inner `Err` is an unusable-price blob.
    async fn market_price(
        &self,
        symbol: &str,
    ) -> Result<std::result::Result<rust_decimal::Decimal, String>> {
        let quote = self.research.price_quote(symbol).await?;
        match extract_price(&quote) {
            Some(price) => Ok(Ok(price)),
            None => {
                warn!(%symbol, %quote, "Quote contained no usable price");
                Ok(Err(error_blob(&LedgerError::PriceUnavailable(
                    symbol.to_string(),
                ))))
            }
        }
    }

    /// Domain rejections become error blobs; storage failures fail the turn.
    fn ledger_outcome(&self, error: LedgerError) -> Result<String> {
        if error.is_domain_rejection() {
            Ok(error_blob(&error))
        } else {
            Err(AgentError::Ledger(error))
        }
    }
}

fn message_blob(message: &str) -> String {
    json!({ "message": message }).to_string()
}

fn error_blob(error: &LedgerError) -> String {
    json!({ "error": error.to_string() }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryBackend;
    use crate::models::UserAccount;
    use rust_decimal_macros::dec;

    struct CannedResearch {
        quote: String,
    }

    #[async_trait::async_trait]
    impl ResearchProvider for CannedResearch {
        async fn market_research(&self, company_name: &str) -> Result<String> {
            Ok(format!("{} looks strong this quarter.", company_name))
        }

        async fn web_search(&self, query: &str) -> Result<String> {
            Ok(format!("Results for {}.", query))
        }

        async fn price_quote(&self, _company_name: &str) -> Result<String> {
            Ok(self.quote.clone())
        }
    }

    fn executor(quote: &str, account: UserAccount) -> ToolExecutor {
        let ledger = Arc::new(LedgerStore::new(Arc::new(
            InMemoryBackend::with_accounts(vec![account]),
        )));
        ToolExecutor::new(
            ledger,
            Arc::new(CannedResearch {
                quote: quote.to_string(),
            }),
        )
    }

    #[test]
    fn test_parse_maps_known_tools() {
        let call = ToolCall::parse(
            "buy_stock",
            &json!({"userid": "U1", "stock_symbol": "AAPL", "quantity": 5}),
        )
        .unwrap();
        assert_eq!(
            call,
            ToolCall::BuyStock {
                userid: "U1".to_string(),
                stock_symbol: "AAPL".to_string(),
                quantity: 5,
            }
        );
        assert_eq!(call.name(), "buy_stock");
    }

    #[test]
    fn test_parse_rejects_unknown_tool() {
        let error = ToolCall::parse("transfer_funds", &json!({})).unwrap_err();
        assert_eq!(
            error,
            ToolParseError::UnknownTool("transfer_funds".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_missing_arguments() {
        let error = ToolCall::parse("buy_stock", &json!({"userid": "U1"})).unwrap_err();
        assert!(matches!(error, ToolParseError::InvalidArguments { .. }));
    }

    #[test]
    fn test_schemas_cover_every_tool() {
        let schemas = ToolCall::schemas();
        let names: Vec<&str> = schemas
            .iter()
            .map(|schema| schema["function"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "end_call",
                "market_research",
                "quick_stock_check",
                "web_search",
                "get_user_profile",
                "buy_stock",
                "sell_stock",
            ]
        );
        for schema in &schemas {
            assert_eq!(schema["type"], "function");
            assert_eq!(
                schema["function"]["parameters"]["additionalProperties"],
                json!(false)
            );
        }
    }

    #[tokio::test]
    async fn test_buy_produces_success_blob() {
        let executor = executor("$100", UserAccount::new("U1", dec!(1000)));

        let blob = executor
            .execute(ToolCall::BuyStock {
                userid: "U1".to_string(),
                stock_symbol: "AAPL".to_string(),
                quantity: 5,
            })
            .await
            .unwrap();

        let parsed: Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed["message"], "Stock purchased successfully.");
        assert_eq!(parsed["bank_balance"], "500");
    }

    #[tokio::test]
    async fn test_insufficient_balance_becomes_error_blob() {
        let executor = executor("$100", UserAccount::new("U1", dec!(50)));

        let blob = executor
            .execute(ToolCall::BuyStock {
                userid: "U1".to_string(),
                stock_symbol: "AAPL".to_string(),
                quantity: 5,
            })
            .await
            .unwrap();

        let parsed: Value = serde_json::from_str(&blob).unwrap();
        assert!(parsed["error"]
            .as_str()
            .unwrap()
            .contains("insufficient balance"));
    }

    #[tokio::test]
    async fn test_unusable_quote_becomes_error_blob() {
        let executor = executor("no idea, sorry", UserAccount::new("U1", dec!(1000)));

        let blob = executor
            .execute(ToolCall::BuyStock {
                userid: "U1".to_string(),
                stock_symbol: "AAPL".to_string(),
                quantity: 1,
            })
            .await
            .unwrap();

        let parsed: Value = serde_json::from_str(&blob).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("price"));
    }

    #[tokio::test]
    async fn test_profile_serializes_the_account() {
        let mut account = UserAccount::new("U1", dec!(750));
        account.portfolio.insert("AAPL".to_string(), 3);
        let executor = executor("$1", account);

        let blob = executor
            .execute(ToolCall::GetUserProfile {
                userid: "U1".to_string(),
            })
            .await
            .unwrap();

        let parsed: Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed["bank_bal"], json!(750.0));
        assert_eq!(parsed["portfolio"]["AAPL"], json!(3));
    }

    #[tokio::test]
    async fn test_unknown_user_profile_is_error_blob() {
        let executor = executor("$1", UserAccount::new("U1", dec!(100)));

        let blob = executor
            .execute(ToolCall::GetUserProfile {
                userid: "nobody".to_string(),
            })
            .await
            .unwrap();

        let parsed: Value = serde_json::from_str(&blob).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("not found"));
    }
}
