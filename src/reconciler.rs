//! Reassembles a streamed completion and sets the provider's usage block
//! next to locally computed token counts.
//!
//! The two sets of counts are kept apart. A mismatch is logged, never
//! corrected.

use std::io::Write;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};

use crate::gateway::{ChatMessage, CompletionResponse, StreamEvent, Usage};
use crate::tokenizer::TokenCounter;
use crate::{Error, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Receiving,
    Finalizing,
    Done,
}

/// Token counts computed from the request messages and reassembled text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl LocalUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub text: String,
    /// `None` when the provider never sent a usage block.
    pub provider_usage: Option<Usage>,
    pub local_usage: LocalUsage,
    /// Every chunk as received, for diagnostics.
    pub raw_chunks: Vec<serde_json::Value>,
    /// Arrival time of each text fragment, measured from the first event.
    pub fragment_offsets: Vec<Duration>,
    pub elapsed: Duration,
    pub trace_id: Option<String>,
}

/// One metric in the computed-vs-reported comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountComparison {
    pub metric: &'static str,
    pub computed: u64,
    pub reported: Option<u64>,
}

impl CountComparison {
    pub fn matches(&self) -> bool {
        self.reported.map_or(true, |reported| reported == self.computed)
    }
}

impl CompletionResult {
    pub fn comparisons(&self) -> [CountComparison; 3] {
        let reported = self.provider_usage.unwrap_or_default();
        [
            CountComparison {
                metric: "Prompt Tokens",
                computed: self.local_usage.prompt_tokens,
                reported: reported.prompt_tokens,
            },
            CountComparison {
                metric: "Completion Tokens",
                computed: self.local_usage.completion_tokens,
                reported: reported.completion_tokens,
            },
            CountComparison {
                metric: "Total Tokens",
                computed: self.local_usage.total_tokens(),
                reported: reported.total_tokens,
            },
        ]
    }

    /// Logs both sets of counts and warns on every disagreement.
    pub fn log_comparison(&self) {
        if self.provider_usage.is_none() {
            tracing::info!(
                "no provider usage reported; computed prompt={} completion={} total={}",
                self.local_usage.prompt_tokens,
                self.local_usage.completion_tokens,
                self.local_usage.total_tokens()
            );
            return;
        }

        for comparison in self.comparisons() {
            match comparison.reported {
                Some(reported) if reported != comparison.computed => tracing::warn!(
                    "{} differ: computed {} vs reported {}",
                    comparison.metric,
                    comparison.computed,
                    reported
                ),
                Some(reported) => {
                    tracing::info!("{} agree at {}", comparison.metric, reported)
                }
                None => tracing::info!(
                    "{}: computed {}, not reported",
                    comparison.metric,
                    comparison.computed
                ),
            }
        }
    }
}

/// Consumes stream events in order, echoing each fragment to `sink` as it
/// arrives.
pub struct Reconciler<W> {
    sink: W,
    state: ReconcilerState,
    text: String,
    usage: Option<Usage>,
    raw_chunks: Vec<serde_json::Value>,
    fragment_offsets: Vec<Duration>,
    started: Option<Instant>,
    elapsed: Duration,
}

impl<W: Write> Reconciler<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            state: ReconcilerState::Idle,
            text: String::new(),
            usage: None,
            raw_chunks: Vec::new(),
            fragment_offsets: Vec::new(),
            started: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    pub fn accept(&mut self, event: StreamEvent) -> Result<(), Error> {
        let started = *self.started.get_or_insert_with(Instant::now);

        match (self.state, event) {
            (ReconcilerState::Finalizing | ReconcilerState::Done, StreamEvent::Chunk(chunk)) => {
                tracing::warn!("ignoring chunk received after termination: {}", chunk.raw);
            }
            (ReconcilerState::Finalizing | ReconcilerState::Done, StreamEvent::Done) => {
                tracing::warn!("ignoring repeated termination sentinel");
            }
            (ReconcilerState::Idle | ReconcilerState::Receiving, StreamEvent::Done) => {
                self.elapsed = started.elapsed();
                self.state = ReconcilerState::Finalizing;
            }
            (ReconcilerState::Idle | ReconcilerState::Receiving, StreamEvent::Chunk(chunk)) => {
                self.state = ReconcilerState::Receiving;

                if let Some(usage) = chunk.usage {
                    self.usage = Some(usage);
                }
                if let Some(fragment) = &chunk.delta {
                    let offset = started.elapsed();
                    self.sink.write_all(fragment.as_bytes())?;
                    self.sink.flush()?;
                    self.text.push_str(fragment);
                    self.fragment_offsets.push(offset);
                    tracing::debug!(
                        "received fragment {:?} at {:.2} seconds",
                        fragment,
                        offset.as_secs_f64()
                    );
                }
                self.raw_chunks.push(chunk.raw);
            }
        }
        Ok(())
    }

    /// Computes local counts once the sentinel has been seen.
    ///
    /// A stream that ended without the sentinel is a network failure, not a
    /// clean completion.
    pub fn finish(
        &mut self,
        counter: &TokenCounter,
        messages: &[ChatMessage],
    ) -> Result<CompletionResult, Error> {
        match self.state {
            ReconcilerState::Finalizing => {}
            ReconcilerState::Done => {
                return Err(Error::Protocol("completion already finalized".to_owned()))
            }
            ReconcilerState::Idle | ReconcilerState::Receiving => {
                return Err(Error::Network(TransportError::Truncated))
            }
        }
        self.state = ReconcilerState::Done;

        let text = std::mem::take(&mut self.text);
        let local_usage = LocalUsage {
            prompt_tokens: counter.count_messages(messages) as u64,
            completion_tokens: counter.count(&text) as u64,
        };

        Ok(CompletionResult {
            text,
            provider_usage: self.usage.take(),
            local_usage,
            raw_chunks: std::mem::take(&mut self.raw_chunks),
            fragment_offsets: std::mem::take(&mut self.fragment_offsets),
            elapsed: self.elapsed,
            trace_id: None,
        })
    }
}

/// Drives `stream` to its end through a [`Reconciler`].
pub async fn reconcile_stream<S, W>(
    stream: S,
    sink: W,
    counter: &TokenCounter,
    messages: &[ChatMessage],
) -> Result<CompletionResult, Error>
where
    S: Stream<Item = Result<StreamEvent, Error>>,
    W: Write,
{
    let mut stream = std::pin::pin!(stream);
    let mut reconciler = Reconciler::new(sink);

    while let Some(event) = stream.next().await {
        reconciler.accept(event?)?;
    }
    reconciler.finish(counter, messages)
}

/// Builds the same result from a non-streamed response, printing its text
/// in one piece.
pub fn reconcile_response<W: Write>(
    response: CompletionResponse,
    mut sink: W,
    counter: &TokenCounter,
    messages: &[ChatMessage],
    elapsed: Duration,
) -> Result<CompletionResult, Error> {
    sink.write_all(response.text.as_bytes())?;
    sink.flush()?;

    let local_usage = LocalUsage {
        prompt_tokens: counter.count_messages(messages) as u64,
        completion_tokens: counter.count(&response.text) as u64,
    };
    let fragment_offsets = if response.text.is_empty() {
        Vec::new()
    } else {
        vec![elapsed]
    };

    Ok(CompletionResult {
        text: response.text,
        provider_usage: response.usage,
        local_usage,
        raw_chunks: vec![response.raw],
        fragment_offsets,
        elapsed,
        trace_id: response.trace_id,
    })
}
