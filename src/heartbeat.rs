//! Heartbeat keep-alive for long-running tool operations
//!
//! Wraps a tool operation in a background task and races its completion
//! against a 1-second timer: the caller's stream receives the "starting"
//! phrase immediately, then one placeholder tick per second until the
//! operation resolves. The raw result is returned, never emitted.
//!
//! Cancellation is first-class: if the turn's event channel closes, the
//! background task is aborted and no completion result is produced.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

use crate::error::AgentError;
use crate::models::OutputEvent;

/// Tick payload: a single non-visible placeholder character. Keeps the
/// stream alive without showing the user a distinct phrase.
pub const HEARTBEAT_PAYLOAD: &str = "\u{200B}";

const TICK_PERIOD: Duration = Duration::from_secs(1);

pub struct HeartbeatEmitter {
    period: Duration,
}

impl HeartbeatEmitter {
    pub fn new() -> Self {
        Self {
            period: TICK_PERIOD,
        }
    }

    /// Emit `started_phrase`, run `operation` in the background, and tick
    /// once per elapsed second until it resolves. Returns the operation's
    /// value without emitting it.
    pub async fn run<T>(
        &self,
        turn_id: Uuid,
        started_phrase: &str,
        events: &mpsc::Sender<OutputEvent>,
        operation: impl Future<Output = T> + Send + 'static,
    ) -> crate::Result<T>
    where
        T: Send + 'static,
    {
        if events
            .send(OutputEvent::chunk(turn_id, started_phrase))
            .await
            .is_err()
        {
            return Err(AgentError::TurnCancelled);
        }

        // Aborted if this future is dropped, so a cancelled turn cannot
        // leave the operation running detached.
        let mut task = AbortOnDrop(tokio::spawn(operation));

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick resolves immediately; consume it so an operation
        // finishing in under one period emits zero ticks.
        ticker.tick().await;

        let mut ticks = 0u32;
        loop {
            tokio::select! {
                joined = &mut task => {
                    debug!(%turn_id, ticks, "Tool operation resolved");
                    return joined.map_err(|e: JoinError| {
                        AgentError::ToolTask(format!("background task failed: {}", e))
                    });
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    if events
                        .send(OutputEvent::chunk(turn_id, HEARTBEAT_PAYLOAD))
                        .await
                        .is_err()
                    {
                        // Receiver gone: the turn was cancelled.
                        return Err(AgentError::TurnCancelled);
                    }
                }
            }
        }
    }
}

impl Default for HeartbeatEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// JoinHandle wrapper that aborts the task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_ticks(rx: &mut mpsc::Receiver<OutputEvent>) -> (usize, usize) {
        let mut phrases = 0;
        let mut ticks = 0;
        while let Ok(event) = rx.try_recv() {
            if event.content == HEARTBEAT_PAYLOAD {
                ticks += 1;
            } else {
                phrases += 1;
            }
        }
        (phrases, ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_emits_zero_ticks() {
        let emitter = HeartbeatEmitter::new();
        let (tx, mut rx) = mpsc::channel(16);
        let turn_id = Uuid::new_v4();

        let result = emitter
            .run(turn_id, "Checking that now.", &tx, async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                42
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        let (phrases, ticks) = collect_ticks(&mut rx).await;
        assert_eq!(phrases, 1);
        assert_eq!(ticks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_ticks_once_per_second() {
        let emitter = HeartbeatEmitter::new();
        let (tx, mut rx) = mpsc::channel(16);

        let result = emitter
            .run(Uuid::new_v4(), "Placing that order.", &tx, async {
                tokio::time::sleep(Duration::from_millis(3500)).await;
                "done"
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        let (phrases, ticks) = collect_ticks(&mut rx).await;
        assert_eq!(phrases, 1);
        assert_eq!(ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_phrase_precedes_ticks() {
        let emitter = HeartbeatEmitter::new();
        let (tx, mut rx) = mpsc::channel(16);

        emitter
            .run(Uuid::new_v4(), "Working on it.", &tx, async {
                tokio::time::sleep(Duration::from_millis(1500)).await;
            })
            .await
            .unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.content, "Working on it.");
        assert!(!first.is_terminal());

        let second = rx.try_recv().unwrap();
        assert_eq!(second.content, HEARTBEAT_PAYLOAD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_cancels_the_operation() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let (tx, mut rx) = mpsc::channel(16);
        let completed = Arc::new(AtomicBool::new(false));
        let completed_in_op = completed.clone();

        let handle = tokio::spawn(async move {
            HeartbeatEmitter::new()
                .run(Uuid::new_v4(), "Working on it.", &tx, async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    completed_in_op.store(true, Ordering::SeqCst);
                })
                .await
        });

        // Take the started phrase, then hang up before the first tick.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "Working on it.");
        drop(rx);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AgentError::TurnCancelled)));

        // The background operation was aborted, not left to finish.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!completed.load(Ordering::SeqCst));
    }
}
