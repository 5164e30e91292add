//! Delta stream reclassification
//!
//! Consumes raw model deltas and produces, in order, verbatim text chunks
//! and at most one completed tool invocation per turn. Two incompatible
//! wire shapes feed one canonical output type:
//!
//! - Atomic: a single delta carries a complete name and fully parseable
//!   arguments together; the invocation completes on receipt.
//! - Incremental: the first delta carries an id and a name, later deltas
//!   carry argument fragments; the invocation completes once the buffer
//!   first parses as a JSON object, checked again at stream end.
//!
//! A second distinct tool id seen mid-accumulation seals the parser:
//! first-seen wins, later tool deltas are dropped, text keeps flowing.

use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{ModelDelta, ToolCallFragment};

/// Fallback id for atomic-shape calls that arrive without one.
const DEFAULT_CALL_ID: &str = "call_0";

/// A completed, shape-agnostic tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Event produced for each consumed delta.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// Verbatim pass-through of a text fragment.
    Text(String),
    /// The turn's single tool invocation, fully reconstructed.
    Invocation(ToolInvocation),
}

/// The stream ended while a tool call was underway but its argument buffer
/// never became a well-formed JSON object. The turn ends with no tool
/// executed; text already emitted stands.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tool call '{name}' ended with unparseable arguments ({buffered} bytes buffered)")]
pub struct ParseFailure {
    pub name: String,
    pub buffered: usize,
}

enum ParseState {
    /// No tool-call data seen yet.
    Empty,
    /// Incremental shape: id and name known, no argument bytes yet.
    NameKnown { id: String, name: String },
    /// Incremental shape: argument fragments are being concatenated.
    AccumulatingArgs {
        id: String,
        name: String,
        buffer: String,
    },
    /// The invocation was emitted; later tool deltas are ignored.
    ArgsComplete,
    /// A second tool id appeared mid-accumulation. The first call's buffer
    /// is frozen and re-checked at stream end; further tool deltas drop.
    Sealed {
        id: String,
        name: String,
        buffer: String,
    },
}

/// Reclassifies one turn's delta stream. One parser instance per turn.
pub struct DeltaStreamParser {
    state: ParseState,
}

impl DeltaStreamParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Empty,
        }
    }

    /// Consume one delta, producing zero or more events in order.
    pub fn feed(&mut self, delta: ModelDelta) -> Vec<ParserEvent> {
        let mut events = Vec::new();

        if let Some(text) = delta.content {
            if !text.is_empty() {
                events.push(ParserEvent::Text(text));
            }
        }

        if let Some(fragment) = delta.tool_call {
            if let Some(invocation) = self.feed_tool_fragment(fragment) {
                events.push(ParserEvent::Invocation(invocation));
            }
        }

        events
    }

    /// Finish the turn at stream end. `None` when no tool call was pending;
    /// otherwise the late-completing invocation or a parse failure.
    pub fn finish(self) -> Option<Result<ToolInvocation, ParseFailure>> {
        match self.state {
            ParseState::Empty | ParseState::ArgsComplete => None,
            ParseState::NameKnown { name, .. } => {
                // Name without any argument bytes never became well-formed.
                Some(Err(ParseFailure { name, buffered: 0 }))
            }
            ParseState::AccumulatingArgs { id, name, buffer }
            | ParseState::Sealed { id, name, buffer } => {
                match parse_arguments(&buffer) {
                    Some(arguments) => Some(Ok(ToolInvocation {
                        id,
                        name,
                        arguments,
                    })),
                    None => Some(Err(ParseFailure {
                        buffered: buffer.len(),
                        name,
                    })),
                }
            }
        }
    }

    fn feed_tool_fragment(&mut self, fragment: ToolCallFragment) -> Option<ToolInvocation> {
        match std::mem::replace(&mut self.state, ParseState::Empty) {
            ParseState::Empty => {
                let Some(name) = fragment.name.filter(|n| !n.is_empty()) else {
                    // Argument bytes before any name; nothing to attach them to.
                    warn!("Dropping tool-call fragment with no name in empty state");
                    self.state = ParseState::Empty;
                    return None;
                };

                let id = fragment
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| DEFAULT_CALL_ID.to_string());

                // Atomic shape: name and parseable arguments in one delta.
                if let Some(arguments) =
                    fragment.arguments.as_deref().and_then(parse_arguments)
                {
                    debug!(tool = %name, "Tool call complete (atomic shape)");
                    self.state = ParseState::ArgsComplete;
                    return Some(ToolInvocation {
                        id,
                        name,
                        arguments,
                    });
                }

                // Incremental shape begins.
                self.state = match fragment.arguments.filter(|a| !a.is_empty()) {
                    Some(buffer) => ParseState::AccumulatingArgs { id, name, buffer },
                    None => ParseState::NameKnown { id, name },
                };
                None
            }

            ParseState::NameKnown { id, name } => {
                if is_new_call(&fragment, &id) {
                    debug!(kept = %name, "Second tool call id observed, first-seen wins");
                    self.state = ParseState::Sealed {
                        id,
                        name,
                        buffer: String::new(),
                    };
                    return None;
                }

                let buffer = fragment.arguments.unwrap_or_default();
                self.try_complete(id, name, buffer)
            }

            ParseState::AccumulatingArgs {
                id,
                name,
                mut buffer,
            } => {
                if is_new_call(&fragment, &id) {
                    debug!(kept = %name, "Second tool call id observed, first-seen wins");
                    self.state = ParseState::Sealed { id, name, buffer };
                    return None;
                }

                if let Some(arguments) = fragment.arguments {
                    buffer.push_str(&arguments);
                }
                self.try_complete(id, name, buffer)
            }

            done @ (ParseState::ArgsComplete | ParseState::Sealed { .. }) => {
                self.state = done;
                None
            }
        }
    }

    fn try_complete(&mut self, id: String, name: String, buffer: String) -> Option<ToolInvocation> {
        match parse_arguments(&buffer) {
            Some(arguments) => {
                debug!(tool = %name, "Tool call complete (incremental shape)");
                self.state = ParseState::ArgsComplete;
                Some(ToolInvocation {
                    id,
                    name,
                    arguments,
                })
            }
            None => {
                self.state = ParseState::AccumulatingArgs { id, name, buffer };
                None
            }
        }
    }
}

impl Default for DeltaStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// A fragment starts a new call when it carries an id different from the
/// one being accumulated.
fn is_new_call(fragment: &ToolCallFragment, current_id: &str) -> bool {
    fragment
        .id
        .as_deref()
        .is_some_and(|id| !id.is_empty() && id != current_id)
}

/// Arguments are complete once they parse as a JSON object. Requiring an
/// object (not any JSON value) keeps prefixes of incremental buffers from
/// completing early.
fn parse_arguments(buffer: &str) -> Option<Value> {
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(Value::is_object)
}
