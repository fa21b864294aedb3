//! Switchable stream
//!
//! Concatenates a sequence of token sources into one output byte stream.
//! Sources are attached one at a time; when a source ends on a length
//! cutoff the output stays open and a [`SwitchEvent::Cutoff`] is emitted so
//! the continuation driver can attach the next source. The client only ever
//! sees a single body.
//!
//! ```rust,ignore
//! let (stream, mut events) = SwitchableStream::new(CumulativeUsage::new());
//! let output = stream.output()?;
//! stream.attach(first_source)?;
//! // hand `output` to the HTTP response, drive `events` in a task
//! ```

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::Stream;
use static_assertions::assert_impl_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::source::{SourceEvent, Termination, TokenSource};
use crate::types::Usage;

/// Completion tokens emitted across every segment of one request.
#[derive(Debug, Clone, Default)]
pub struct CumulativeUsage {
    completion_tokens: Arc<AtomicU64>,
}

impl CumulativeUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens.load(Ordering::SeqCst)
    }

    fn add(&self, tokens: u64) {
        self.completion_tokens.fetch_add(tokens, Ordering::SeqCst);
    }
}

/// Lifecycle of a switchable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, no source attached yet
    Idle,
    /// Forwarding the active source
    Streaming,
    /// Previous source hit a cutoff; waiting for the next attach
    Switching,
    /// Finalized cleanly
    Closed,
    /// Finalized after an error
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Notification sent to the continuation driver when a segment ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    /// Segment stopped on a length boundary; `text` is what it emitted
    Cutoff {
        segment: usize,
        text: String,
        usage: Usage,
    },
    /// Segment finished naturally; the output is closed
    Completed { segment: usize },
    /// Segment failed; the output is finalized
    Failed { segment: usize, error: RelayError },
}

/// Receiving side of the switch notifications.
///
/// Yields `None` once the stream is finalized and every pending event has
/// been delivered.
pub struct SwitchEvents {
    rx: mpsc::UnboundedReceiver<SwitchEvent>,
}

impl SwitchEvents {
    pub async fn next(&mut self) -> Option<SwitchEvent> {
        self.rx.recv().await
    }
}

type TokenCallback = Arc<dyn Fn(u64) + Send + Sync>;

struct Shared {
    state: StreamState,
    active: Option<TokenSource>,
    segments: usize,
    segment_text: String,
    drained: Vec<usize>,
    pending_error: Option<RelayError>,
    waker: Option<Waker>,
    events: Option<mpsc::UnboundedSender<SwitchEvent>>,
    output_taken: bool,
    on_token: Option<TokenCallback>,
}

impl Shared {
    fn emit(&self, event: SwitchEvent) -> bool {
        match &self.events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Move into a terminal state. Returns false if already terminal.
    fn terminate(&mut self, state: StreamState, error: Option<RelayError>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        self.active = None;
        self.pending_error = error;
        self.events = None;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
        true
    }
}

/// Handle used to attach sources to, and finalize, one output stream.
#[derive(Clone)]
pub struct SwitchableStream {
    shared: Arc<Mutex<Shared>>,
    usage: CumulativeUsage,
    cancel: CancellationToken,
}

assert_impl_all!(SwitchableStream: Send, Sync, Clone);
assert_impl_all!(SwitchableOutput: Send);

impl SwitchableStream {
    pub fn new(usage: CumulativeUsage) -> (Self, SwitchEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            state: StreamState::Idle,
            active: None,
            segments: 0,
            segment_text: String::new(),
            drained: Vec::new(),
            pending_error: None,
            waker: None,
            events: Some(tx),
            output_taken: false,
            on_token: None,
        };
        let stream = Self {
            shared: Arc::new(Mutex::new(shared)),
            usage,
            cancel: CancellationToken::new(),
        };
        (stream, SwitchEvents { rx })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the output side. Only one output exists per stream.
    pub fn output(&self) -> Result<SwitchableOutput> {
        let mut shared = self.lock();
        if shared.output_taken {
            return Err(RelayError::invalid_state("output already taken"));
        }
        shared.output_taken = true;
        Ok(SwitchableOutput {
            stream: self.clone(),
        })
    }

    /// Register a callback invoked with the token count of every forwarded delta.
    ///
    /// The callback runs on the task polling the output and must not call
    /// back into this stream.
    pub fn on_token(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        self.lock().on_token = Some(Arc::new(callback));
    }

    /// Start forwarding `source`. Returns the 1-based segment number.
    pub fn attach(&self, source: TokenSource) -> Result<usize> {
        let mut shared = self.lock();
        match shared.state {
            StreamState::Closed | StreamState::Failed => {
                return Err(RelayError::invalid_state(
                    "cannot attach a source to a closed stream",
                ));
            }
            StreamState::Streaming => {
                return Err(RelayError::invalid_state("a source is already active"));
            }
            StreamState::Idle | StreamState::Switching => {}
        }

        shared.segments += 1;
        shared.segment_text.clear();
        shared.active = Some(source);
        shared.state = StreamState::Streaming;
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }

        let segment = shared.segments;
        tracing::debug!(segment, "source attached");
        Ok(segment)
    }

    /// Finalize the output cleanly. Idempotent.
    pub fn close(&self) {
        let finalized = self.lock().terminate(StreamState::Closed, None);
        if finalized {
            tracing::debug!("switchable stream closed");
        }
        self.cancel.cancel();
    }

    /// Finalize the output after an error; the output yields `error` once.
    pub fn fail(&self, error: RelayError) {
        let finalized = self.lock().terminate(StreamState::Failed, Some(error));
        if finalized {
            tracing::debug!("switchable stream failed");
        }
        self.cancel.cancel();
    }

    /// Resolves once the stream has been finalized for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    /// Number of sources attached so far.
    pub fn segments(&self) -> usize {
        self.lock().segments
    }

    /// Segment numbers of sources that ran to their end, in order.
    pub fn drained(&self) -> Vec<usize> {
        self.lock().drained.clone()
    }

    pub fn usage(&self) -> &CumulativeUsage {
        &self.usage
    }
}

/// The single output byte stream, suitable as an HTTP response body.
///
/// Dropping it (for example when the client disconnects) closes the stream.
pub struct SwitchableOutput {
    stream: SwitchableStream,
}

impl Stream for SwitchableOutput {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let handle = &self.get_mut().stream;
        let mut shared = handle.lock();

        loop {
            match shared.state {
                StreamState::Closed => return Poll::Ready(None),
                StreamState::Failed => return Poll::Ready(shared.pending_error.take().map(Err)),
                StreamState::Idle | StreamState::Switching => {
                    shared.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                StreamState::Streaming => {}
            }

            let segment = shared.segments;
            let polled = match shared.active.as_mut() {
                Some(source) => source.as_mut().poll_next(cx),
                None => Poll::Ready(Some(Err(RelayError::invalid_state(
                    "streaming without an active source",
                )))),
            };

            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(SourceEvent::Delta { text, tokens }))) => {
                    handle.usage.add(tokens);
                    let callback = shared.on_token.clone();
                    if text.is_empty() {
                        drop(shared);
                        if let Some(callback) = callback {
                            callback(tokens);
                        }
                        shared = handle.lock();
                        continue;
                    }
                    shared.segment_text.push_str(&text);
                    drop(shared);
                    if let Some(callback) = callback {
                        callback(tokens);
                    }
                    return Poll::Ready(Some(Ok(Bytes::from(text))));
                }
                Poll::Ready(Some(Ok(SourceEvent::End(Termination::Cutoff { usage })))) => {
                    shared.active = None;
                    shared.drained.push(segment);
                    shared.state = StreamState::Switching;
                    let text = std::mem::take(&mut shared.segment_text);
                    tracing::debug!(segment, tokens = usage.completion_tokens, "segment cut off");
                    if !shared.emit(SwitchEvent::Cutoff {
                        segment,
                        text,
                        usage,
                    }) {
                        // Nobody is left to attach a continuation.
                        shared.terminate(StreamState::Closed, None);
                        drop(shared);
                        handle.cancel.cancel();
                        return Poll::Ready(None);
                    }
                }
                Poll::Ready(Some(Ok(SourceEvent::End(Termination::Completed)))) | Poll::Ready(None) => {
                    shared.active = None;
                    shared.drained.push(segment);
                    shared.emit(SwitchEvent::Completed { segment });
                    shared.terminate(StreamState::Closed, None);
                    drop(shared);
                    handle.cancel.cancel();
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(error))) => {
                    tracing::warn!(segment, error = %error, "segment failed mid-stream");
                    shared.emit(SwitchEvent::Failed {
                        segment,
                        error: error.clone(),
                    });
                    shared.terminate(StreamState::Failed, None);
                    drop(shared);
                    handle.cancel.cancel();
                    return Poll::Ready(Some(Err(error)));
                }
            }
        }
    }
}

impl Drop for SwitchableOutput {
    fn drop(&mut self) {
        self.stream.close();
    }
}
