//! Turn dispatcher
//!
//! Drives one conversational turn through an explicit state machine:
//! Streaming, then (if a tool call was reconstructed) ToolDetected,
//! Executing under the heartbeat, Summarizing, and Done. Text deltas are
//! forwarded the moment they arrive; every turn closes with exactly one
//! terminal event unless it fails or is cancelled outright.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::heartbeat::HeartbeatEmitter;
use crate::llm::CompletionClient;
use crate::models::{ConversationTurn, OutputEvent};
use crate::stream::{DeltaStreamParser, ParserEvent, ToolInvocation};
use crate::tools::{ToolCall, ToolExecutor};

/// System prompt for the streamed conversational turns.
pub const AGENT_SYSTEM_PROMPT: &str = "You are a friendly stock trading \
    assistant on a voice call. Keep replies short and conversational. \
    Use the provided tools for research, price checks, account lookups, \
    and trades; never invent prices or balances. Ask for the userid if a \
    trade or account request does not include one. When the user wants to \
    end the conversation, call end_call with a short farewell message.";

/// Greeting sent before any turn has run.
pub const BEGIN_MESSAGE: &str =
    "Hi! I am your stock trading assistant. I can research stocks, check prices, \
     and buy or sell shares for you. How can I help?";

const SUMMARY_SYSTEM_PROMPT: &str = "You are relaying a tool result to the user \
    in a spoken conversation. Summarize the result in at most two short \
    sentences of plain language. If the result is an error, apologize and \
    state the reason simply.";

const LOST_REQUEST_PHRASE: &str =
    "Sorry, I lost track of that request. Could you say it again?";

const UNSUPPORTED_REQUEST_PHRASE: &str =
    "Sorry, that is not something I can do here.";

/// One request into the dispatcher.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub turn_id: Uuid,
    pub transcript: ConversationTurn,
}

impl TurnRequest {
    pub fn new(transcript: ConversationTurn) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            transcript,
        }
    }
}

/// Canned session-opening event, emitted without a model call.
pub fn begin_event() -> OutputEvent {
    OutputEvent::complete(Uuid::new_v4(), BEGIN_MESSAGE)
}

enum TurnState {
    Streaming,
    ToolDetected(ToolInvocation),
    Executing(ToolCall),
    Summarizing {
        tool: &'static str,
        raw_result: String,
    },
    Done,
}

pub struct ToolDispatcher {
    client: Arc<dyn CompletionClient>,
    executor: ToolExecutor,
    heartbeat: HeartbeatEmitter,
}

impl ToolDispatcher {
    pub fn new(client: Arc<dyn CompletionClient>, executor: ToolExecutor) -> Self {
        Self {
            client,
            executor,
            heartbeat: HeartbeatEmitter::new(),
        }
    }

    /// Run one turn to completion, emitting events on `events`. A closed
    /// receiver cancels the turn.
    pub async fn run_turn(
        &self,
        request: &TurnRequest,
        events: mpsc::Sender<OutputEvent>,
    ) -> crate::Result<()> {
        let mut state = TurnState::Streaming;

        loop {
            state = match state {
                TurnState::Streaming => self.streaming(request, &events).await?,
                TurnState::ToolDetected(invocation) => {
                    self.tool_detected(request, &events, invocation).await?
                }
                TurnState::Executing(call) => self.executing(request, &events, call).await?,
                TurnState::Summarizing { tool, raw_result } => {
                    self.summarizing(request, &events, tool, raw_result).await?
                }
                TurnState::Done => {
                    debug!(turn_id = %request.turn_id, "Turn complete");
                    return Ok(());
                }
            };
        }
    }

    /// Stream the model response, forwarding text verbatim and collecting
    /// at most one reconstructed tool invocation.
    async fn streaming(
        &self,
        request: &TurnRequest,
        events: &mpsc::Sender<OutputEvent>,
    ) -> crate::Result<TurnState> {
        let schemas = ToolCall::schemas();
        let mut deltas = self.client.stream_turn(&request.transcript, &schemas).await?;

        let mut parser = DeltaStreamParser::new();
        let mut invocation: Option<ToolInvocation> = None;

        while let Some(delta) = deltas.next().await {
            for event in parser.feed(delta?) {
                match event {
                    ParserEvent::Text(text) => {
                        self.send(events, OutputEvent::chunk(request.turn_id, text))
                            .await?;
                    }
                    ParserEvent::Invocation(found) => invocation = Some(found),
                }
            }
        }

        if invocation.is_none() {
            match parser.finish() {
                None => {}
                Some(Ok(found)) => invocation = Some(found),
                Some(Err(failure)) => {
                    warn!(turn_id = %request.turn_id, %failure, "Tool call never became parseable");
                    self.send(
                        events,
                        OutputEvent::complete(request.turn_id, LOST_REQUEST_PHRASE),
                    )
                    .await?;
                    return Ok(TurnState::Done);
                }
            }
        }

        match invocation {
            Some(invocation) => Ok(TurnState::ToolDetected(invocation)),
            None => {
                // Text-only turn: close it with an empty terminal marker.
                self.send(events, OutputEvent::complete(request.turn_id, ""))
                    .await?;
                Ok(TurnState::Done)
            }
        }
    }

    /// Map the invocation onto the closed tool set. `end_call` short-
    /// circuits the turn; its message is emitted verbatim, unsummarized.
    async fn tool_detected(
        &self,
        request: &TurnRequest,
        events: &mpsc::Sender<OutputEvent>,
        invocation: ToolInvocation,
    ) -> crate::Result<TurnState> {
        match ToolCall::parse(&invocation.name, &invocation.arguments) {
            Ok(ToolCall::EndCall { message }) => {
                info!(turn_id = %request.turn_id, "End of call requested");
                self.send(events, OutputEvent::end_call(request.turn_id, message))
                    .await?;
                Ok(TurnState::Done)
            }
            Ok(call) => {
                info!(turn_id = %request.turn_id, tool = call.name(), "Tool detected");
                Ok(TurnState::Executing(call))
            }
            Err(error) => {
                warn!(turn_id = %request.turn_id, %error, "Rejected tool invocation");
                self.send(
                    events,
                    OutputEvent::complete(request.turn_id, UNSUPPORTED_REQUEST_PHRASE),
                )
                .await?;
                Ok(TurnState::Done)
            }
        }
    }

    /// Execute the tool under the heartbeat so the caller's stream stays
    /// alive while the operation runs.
    async fn executing(
        &self,
        request: &TurnRequest,
        events: &mpsc::Sender<OutputEvent>,
        call: ToolCall,
    ) -> crate::Result<TurnState> {
        let tool = call.name();
        let phrase = call.started_phrase();
        let executor = self.executor.clone();

        let raw_result = self
            .heartbeat
            .run(request.turn_id, phrase, events, async move {
                executor.execute(call).await
            })
            .await??;

        Ok(TurnState::Summarizing { tool, raw_result })
    }

    /// Turn the raw result blob into a short spoken reply. If the
    /// summarization pass fails, the raw result is emitted verbatim
    /// rather than failing the turn.
    async fn summarizing(
        &self,
        request: &TurnRequest,
        events: &mpsc::Sender<OutputEvent>,
        tool: &'static str,
        raw_result: String,
    ) -> crate::Result<TurnState> {
        let prompt = format!("The {} tool returned: {}", tool, raw_result);

        let reply = match self.client.complete(SUMMARY_SYSTEM_PROMPT, &prompt).await {
            Ok(summary) => summary,
            Err(error) => {
                warn!(turn_id = %request.turn_id, %error, "Summarization failed, emitting raw result");
                raw_result
            }
        };

        self.send(events, OutputEvent::complete(request.turn_id, reply))
            .await?;
        Ok(TurnState::Done)
    }

    async fn send(
        &self,
        events: &mpsc::Sender<OutputEvent>,
        event: OutputEvent,
    ) -> crate::Result<()> {
        events
            .send(event)
            .await
            .map_err(|_| AgentError::TurnCancelled)
    }
}
