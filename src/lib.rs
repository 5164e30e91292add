//! Stock Trading Agent
//!
//! A conversational trading agent runtime that:
//! - Streams model output to the caller as it arrives
//! - Reconstructs tool calls from either of two streaming wire shapes
//! - Executes slow financial tools without stalling the live stream
//! - Keeps the stream alive with heartbeat ticks while a tool runs
//! - Commits buy/sell effects to a per-user ledger with no lost updates
//! - Compresses raw tool output into short user-facing prose
//!
//! TURN FLOW:
//! TRANSCRIPT → STREAMING → TOOL DETECTED → EXECUTING → SUMMARIZING → DONE

pub mod api;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod ledger;
pub mod llm;
pub mod models;
pub mod settings;
pub mod stream;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use models::*;
