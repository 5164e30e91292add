//! Core data models for the trading agent

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One utterance in the running transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub role: Role,
    pub text: String,
}

impl Utterance {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            text: text.into(),
        }
    }
}

/// Ordered transcript supplied whole to each completion request.
/// Append-only: utterances are never edited or removed once pushed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationTurn {
    utterances: Vec<Utterance>,
}

impl ConversationTurn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, utterance: Utterance) {
        self.utterances.push(utterance);
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }
}

//
// ================= Turn Output =================
//

/// One output event produced to the caller during a turn.
///
/// `content_complete` and/or `end_call` mark the terminal event of a turn;
/// exactly one terminal event closes each turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    pub turn_id: Uuid,
    pub content: String,
    pub content_complete: bool,
    pub end_call: bool,
}

impl OutputEvent {
    pub fn chunk(turn_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            turn_id,
            content: content.into(),
            content_complete: false,
            end_call: false,
        }
    }

    pub fn complete(turn_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            turn_id,
            content: content.into(),
            content_complete: true,
            end_call: false,
        }
    }

    pub fn end_call(turn_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            turn_id,
            content: content.into(),
            content_complete: true,
            end_call: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.content_complete || self.end_call
    }
}

//
// ================= Ledger Records =================
//

/// A user's bank balance and share holdings.
///
/// Invariants at every committed state: `bank_balance >= 0` and every
/// portfolio entry holds a strictly positive share count (zero-holding
/// symbols are removed rather than stored).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserAccount {
    pub userid: String,
    #[serde(rename = "bank_bal", with = "rust_decimal::serde::float")]
    pub bank_balance: Decimal,
    #[serde(default)]
    pub portfolio: BTreeMap<String, u64>,
}

impl UserAccount {
    pub fn new(userid: impl Into<String>, bank_balance: Decimal) -> Self {
        Self {
            userid: userid.into(),
            bank_balance,
            portfolio: BTreeMap::new(),
        }
    }

    pub fn shares_held(&self, symbol: &str) -> u64 {
        self.portfolio.get(symbol).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// One committed buy or sell, appended once per ledger mutation.
/// Never mutated or deleted after the append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub userid: String,
    pub stock_symbol: String,
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub shares: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub price_per_share: Decimal,
    pub date: DateTime<Utc>,
    pub initiator: String,
}
