//! In-flight prompt tracking and token reassembly.
//!
//! The peer streams two independent token kinds for a prompt: reasoning tokens
//! and answer tokens. Consumers see a single text stream in which reasoning is
//! wrapped in [`REASONING_OPEN`] / [`REASONING_CLOSE`]:
//!
//! - the first reasoning token opens the block
//! - the first answer token after reasoning closes it before the answer text,
//!   even if the peer never signalled the end of reasoning
//! - a prompt that ends with the block still open gets the close marker at `end`
//!
//! Prompt state lives in a [`PromptRegistry`] shared by the session driver
//! (which applies frames) and the [`PromptStream`] consumers (which drain the
//! assembled text by offset and remove their entry when they finish).

use crate::error::{BridgeError, Result};
use dashmap::DashMap;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Marker opening a reasoning block
pub const REASONING_OPEN: &str = "<think>";

/// Marker closing a reasoning block
pub const REASONING_CLOSE: &str = "</think>";

/// Accumulated output for one prompt
#[derive(Debug, Clone, Default)]
pub struct PromptStreamState {
    answer: String,
    reasoning: String,
    text: String,
    reasoning_opened: bool,
    reasoning_closed: bool,
    started: bool,
    done: bool,
    error: Option<String>,
}

impl PromptStreamState {
    /// Peer acknowledged the prompt
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    /// Append a reasoning token
    pub fn push_reasoning(&mut self, token: &str) {
        if !self.reasoning_opened || self.reasoning_closed {
            self.text.push_str(REASONING_OPEN);
            self.reasoning_opened = true;
            self.reasoning_closed = false;
        }
        self.text.push_str(token);
        self.reasoning.push_str(token);
    }

    /// Append an answer token, closing an open reasoning block first
    pub fn push_answer(&mut self, token: &str) {
        self.close_reasoning();
        self.text.push_str(token);
        self.answer.push_str(token);
    }

    /// The peer finished the prompt
    pub fn finish(&mut self) {
        self.close_reasoning();
        self.done = true;
    }

    /// The peer reported a failure
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    fn close_reasoning(&mut self) {
        if self.reasoning_opened && !self.reasoning_closed {
            self.text.push_str(REASONING_CLOSE);
            self.reasoning_closed = true;
        }
    }

    /// Assembled text, reasoning markers included
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the peer has sent `start`
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the peer has sent `end`
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Peer-reported failure, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Reasoning and answer text, separated
    pub fn transcript(&self) -> Transcript {
        Transcript {
            reasoning: self.reasoning.clone(),
            answer: self.answer.clone(),
        }
    }
}

/// Reasoning and answer text of a finished prompt, for persistence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    /// Concatenated reasoning tokens
    pub reasoning: String,
    /// Concatenated answer tokens
    pub answer: String,
}

/// Split assembled text back into reasoning and answer parts
pub fn split_reasoning(text: &str) -> Transcript {
    let mut transcript = Transcript::default();
    let mut rest = text;
    while let Some(open) = rest.find(REASONING_OPEN) {
        transcript.answer.push_str(&rest[..open]);
        let after_open = &rest[open + REASONING_OPEN.len()..];
        match after_open.find(REASONING_CLOSE) {
            Some(close) => {
                transcript.reasoning.push_str(&after_open[..close]);
                rest = &after_open[close + REASONING_CLOSE.len()..];
            }
            None => {
                transcript.reasoning.push_str(after_open);
                rest = "";
            }
        }
    }
    transcript.answer.push_str(rest);
    transcript
}

#[derive(Debug)]
struct PromptSlot {
    state: PromptStreamState,
    notify: Arc<Notify>,
}

/// Arena of in-flight prompts keyed by prompt id
#[derive(Debug, Clone, Default)]
pub struct PromptRegistry {
    slots: Arc<DashMap<String, PromptSlot>>,
}

impl PromptRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entry and return its wake-up handle
    pub fn register(&self, id: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.slots.insert(
            id.to_string(),
            PromptSlot {
                state: PromptStreamState::default(),
                notify: notify.clone(),
            },
        );
        notify
    }

    /// Mutate an entry and wake its consumer; false if the id is unknown
    pub fn apply(&self, id: &str, update: impl FnOnce(&mut PromptStreamState)) -> bool {
        match self.slots.get_mut(id) {
            Some(mut slot) => {
                update(&mut slot.state);
                slot.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Remove an entry
    pub fn remove(&self, id: &str) -> Option<PromptStreamState> {
        self.slots.remove(id).map(|(_, slot)| {
            slot.notify.notify_one();
            slot.state
        })
    }

    /// Drop every entry; their consumers observe the loss and fail
    pub fn clear(&self) -> usize {
        let ids: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        let mut removed = 0;
        for id in ids {
            if self.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Whether an entry exists
    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Number of in-flight prompts
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no prompt is in flight
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn step(&self, id: &str, offset: usize) -> Step {
        let Some(slot) = self.slots.get(id) else {
            return Step::Lost;
        };
        let state = &slot.state;
        if state.text.len() > offset {
            Step::Chunk(state.text[offset..].to_string())
        } else if let Some(error) = &state.error {
            Step::Failed(error.clone())
        } else if state.done {
            Step::Done
        } else {
            Step::Pending
        }
    }
}

enum Step {
    Chunk(String),
    Failed(String),
    Done,
    Lost,
    Pending,
}

/// Lazy, finite sequence of text chunks for one prompt.
///
/// Each chunk is the suffix appended since the previous one. The sequence ends
/// after `end`, raises on `error`, on session loss and on timeout, and cannot
/// be restarted. Dropping it early discards the prompt's registry entry.
#[derive(Debug)]
pub struct PromptStream {
    id: String,
    registry: PromptRegistry,
    notify: Arc<Notify>,
    offset: usize,
    timeout: Duration,
    deadline: Instant,
    finished: bool,
    transcript: Option<Transcript>,
}

impl PromptStream {
    /// Consumer for a registered prompt
    pub fn new(id: String, registry: PromptRegistry, notify: Arc<Notify>, timeout: Duration) -> Self {
        Self {
            id,
            registry,
            notify,
            offset: 0,
            timeout,
            deadline: Instant::now() + timeout,
            finished: false,
            transcript: None,
        }
    }

    /// Prompt identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reasoning and answer text, available once the stream ended normally
    pub fn transcript(&self) -> Option<&Transcript> {
        self.transcript.as_ref()
    }

    /// Wait for the next chunk; `None` once the prompt has ended
    pub async fn next_chunk(&mut self) -> Option<Result<String>> {
        if self.finished {
            return None;
        }

        loop {
            match self.registry.step(&self.id, self.offset) {
                Step::Chunk(chunk) => {
                    self.offset += chunk.len();
                    return Some(Ok(chunk));
                }
                Step::Failed(message) => {
                    self.finish();
                    return Some(Err(BridgeError::PromptError(message)));
                }
                Step::Done => {
                    self.transcript = self.finish().map(|state| state.transcript());
                    return None;
                }
                Step::Lost => {
                    self.finished = true;
                    return Some(Err(BridgeError::PromptLost(self.id.clone())));
                }
                Step::Pending => {}
            }

            // Text that arrived in time is handed out before the deadline applies
            if Instant::now() >= self.deadline {
                return Some(Err(self.time_out()));
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Some(Err(self.time_out()));
                }
            }
        }
    }

    /// Drain the stream into one string
    pub async fn collect_text(&mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }

    /// Adapt into a [`Stream`] of chunks
    pub fn into_stream(self) -> impl Stream<Item = Result<String>> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next_chunk().await.map(|item| (item, stream))
        })
    }

    fn finish(&mut self) -> Option<PromptStreamState> {
        self.finished = true;
        self.registry.remove(&self.id)
    }

    fn time_out(&mut self) -> BridgeError {
        debug!("Prompt {} timed out after {:?}", self.id, self.timeout);
        self.finish();
        BridgeError::PromptTimeout {
            id: self.id.clone(),
            timeout: self.timeout,
        }
    }
}

impl Drop for PromptStream {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.remove(&self.id);
        }
    }
}
