//! Continuation policy
//!
//! Drives a [`SwitchableStream`] after its first source is attached: every
//! cutoff either chains a new generation (the segment's text goes back into
//! the conversation followed by [`CONTINUE_PROMPT`]) or, once the segment
//! budget is spent, finalizes the stream as a clean end.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{RelayError, Result};
use crate::prompts::CONTINUE_PROMPT;
use crate::source::{GenerationRequest, TextGenerator, TokenSource, with_deadline};
use crate::streaming::switchable::{SwitchEvent, SwitchEvents, SwitchableStream};
use crate::types::ChatMessage;

/// Default cap on chained segments per response.
pub const MAX_RESPONSE_SEGMENTS: usize = 2;
/// Default per-segment token budget passed upstream.
pub const MAX_TOKENS: u32 = 8000;
/// Default deadline for one segment, invocation included.
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationConfig {
    /// Maximum number of sources chained into one response
    pub max_segments: usize,
    /// Advisory token budget for each source
    pub max_tokens: u32,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_segments: MAX_RESPONSE_SEGMENTS,
            max_tokens: MAX_TOKENS,
        }
    }
}

impl ContinuationConfig {
    /// A config that never continues past the first source.
    pub fn single_segment(max_tokens: u32) -> Self {
        Self {
            max_segments: 1,
            max_tokens,
        }
    }
}

/// What to do when a segment hits its cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Finalize,
}

/// How a relayed response ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish {
    /// Last source finished naturally
    Completed,
    /// Segment budget exhausted at a cutoff; closed cleanly
    SegmentLimit,
    /// Stream closed from outside (client went away)
    Cancelled,
    /// A source or a continuation invocation failed
    Failed(RelayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub segments: usize,
    pub completion_tokens: u64,
    pub finish: Finish,
}

/// Decides on and performs continuations for one response.
#[derive(Clone)]
pub struct ContinuationPolicy {
    config: ContinuationConfig,
    generator: Arc<dyn TextGenerator>,
    segment_timeout: Duration,
}

impl ContinuationPolicy {
    pub fn new(config: ContinuationConfig, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            config,
            generator,
            segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
        }
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    pub fn config(&self) -> ContinuationConfig {
        self.config
    }

    pub fn decide(&self, segments_used: usize) -> Decision {
        if segments_used < self.config.max_segments {
            Decision::Continue
        } else {
            Decision::Finalize
        }
    }

    /// Start one segment. A single deadline, fixed here, bounds both the
    /// invocation and the body that follows it.
    pub async fn invoke(&self, request: GenerationRequest) -> Result<TokenSource> {
        let deadline = Instant::now() + self.segment_timeout;
        let started = tokio::time::timeout_at(deadline, self.generator.stream_text(request))
            .await
            .map_err(|_| RelayError::TimeoutError("upstream did not answer in time".into()))??;
        Ok(with_deadline(started, deadline))
    }

    /// React to switch events until the stream is finalized.
    ///
    /// `request` is the request that produced the first segment; its
    /// messages grow with each continuation.
    pub async fn run(
        self,
        stream: SwitchableStream,
        mut events: SwitchEvents,
        mut request: GenerationRequest,
    ) -> RelayOutcome {
        let finish = loop {
            let Some(event) = events.next().await else {
                break Finish::Cancelled;
            };

            match event {
                SwitchEvent::Completed { segment } => {
                    tracing::debug!(segment, "response completed");
                    break Finish::Completed;
                }
                SwitchEvent::Failed { segment, error } => {
                    tracing::error!(segment, error = %error, "segment failed");
                    break Finish::Failed(error);
                }
                SwitchEvent::Cutoff {
                    segment,
                    text,
                    usage,
                } => {
                    let used = stream.segments();
                    if self.decide(used) == Decision::Finalize {
                        tracing::info!(
                            segment,
                            max_segments = self.config.max_segments,
                            "segment limit reached, finalizing response"
                        );
                        stream.close();
                        break Finish::SegmentLimit;
                    }

                    tracing::info!(
                        segment,
                        completion_tokens = usage.completion_tokens,
                        "segment cut off, requesting continuation"
                    );
                    request.messages.push(ChatMessage::assistant(text));
                    request.messages.push(ChatMessage::user(CONTINUE_PROMPT));

                    let invoked = tokio::select! {
                        _ = stream.closed() => break Finish::Cancelled,
                        invoked = self.invoke(request.clone()) => invoked,
                    };

                    match invoked {
                        Ok(source) => {
                            if let Err(error) = stream.attach(source) {
                                if stream.is_closed() {
                                    break Finish::Cancelled;
                                }
                                tracing::error!(error = %error, "could not attach continuation");
                                stream.fail(error.clone());
                                break Finish::Failed(error);
                            }
                        }
                        Err(error) => {
                            tracing::error!(
                                segment = segment + 1,
                                error = %error,
                                "continuation invocation failed"
                            );
                            stream.fail(error.clone());
                            break Finish::Failed(error);
                        }
                    }
                }
            }
        };

        RelayOutcome {
            segments: stream.segments(),
            completion_tokens: stream.usage().completion_tokens(),
            finish,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceEvent;
    use crate::streaming::switchable::CumulativeUsage;
    use async_trait::async_trait;
    use futures::{StreamExt, stream};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Generator returning prepared sources in order and recording requests.
    #[derive(Default)]
    struct ScriptedGenerator {
        scripts: Mutex<VecDeque<Result<Vec<SourceEvent>>>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        fn new(scripts: Vec<Result<Vec<SourceEvent>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn stream_text(&self, request: GenerationRequest) -> Result<TokenSource> {
            self.requests.lock().unwrap().push(request);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected invocation")?;
            Ok(Box::pin(stream::iter(script.into_iter().map(Ok))))
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            messages: vec![ChatMessage::user("Say hello world")],
            model: "gpt-4o-mini".into(),
            provider: "OpenAI".into(),
            max_tokens: 8,
            credentials: Arc::default(),
        }
    }

    async fn relay(
        generator: Arc<ScriptedGenerator>,
        config: ContinuationConfig,
    ) -> (String, RelayOutcome) {
        let policy = ContinuationPolicy::new(config, generator.clone());
        let (stream, events) = SwitchableStream::new(CumulativeUsage::new());
        let output = stream.output().unwrap();
        let first = policy.invoke(request()).await.unwrap();
        stream.attach(first).unwrap();

        let driver = tokio::spawn(policy.run(stream, events, request()));
        let body: Vec<_> = output.collect().await;
        let text = body
            .into_iter()
            .filter_map(|chunk| chunk.ok())
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        (text, driver.await.unwrap())
    }

    #[tokio::test]
    async fn two_segments_join_into_one_body() {
        let generator = ScriptedGenerator::new(vec![
            Ok(vec![SourceEvent::delta("Hello "), SourceEvent::cutoff(1)]),
            Ok(vec![SourceEvent::delta("world"), SourceEvent::completed()]),
        ]);

        let (text, outcome) = relay(generator.clone(), ContinuationConfig::default()).await;

        assert_eq!(text, "Hello world");
        assert_eq!(outcome.finish, Finish::Completed);
        assert_eq!(outcome.segments, 2);
        assert_eq!(outcome.completion_tokens, 2);
        assert_eq!(generator.calls(), 2);

        let requests = generator.requests.lock().unwrap();
        let continued = &requests[1].messages;
        assert_eq!(continued[continued.len() - 2], ChatMessage::assistant("Hello "));
        assert_eq!(continued[continued.len() - 1], ChatMessage::user(CONTINUE_PROMPT));
    }

    #[tokio::test]
    async fn segment_limit_closes_without_another_invocation() {
        let generator = ScriptedGenerator::new(vec![
            Ok(vec![SourceEvent::delta("one "), SourceEvent::cutoff(1)]),
            Ok(vec![SourceEvent::delta("two "), SourceEvent::cutoff(1)]),
        ]);

        let (text, outcome) = relay(generator.clone(), ContinuationConfig::default()).await;

        assert_eq!(text, "one two ");
        assert_eq!(outcome.finish, Finish::SegmentLimit);
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn single_segment_config_never_continues() {
        let generator =
            ScriptedGenerator::new(vec![Ok(vec![SourceEvent::delta("short"), SourceEvent::cutoff(1)])]);

        let (text, outcome) = relay(generator.clone(), ContinuationConfig::single_segment(16)).await;

        assert_eq!(text, "short");
        assert_eq!(outcome.finish, Finish::SegmentLimit);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn failed_continuation_keeps_first_segment() {
        let generator = ScriptedGenerator::new(vec![
            Ok(vec![SourceEvent::delta("Hello "), SourceEvent::cutoff(1)]),
            Err(RelayError::api_error(500, "upstream exploded")),
        ]);

        let (text, outcome) = relay(generator.clone(), ContinuationConfig::default()).await;

        assert_eq!(text, "Hello ");
        assert!(matches!(outcome.finish, Finish::Failed(RelayError::ApiError { .. })));
        assert_eq!(generator.calls(), 2);
    }

    /// Takes `delay` to accept the call and `delay` again before its first delta.
    struct SlowGenerator {
        delay: Duration,
    }

    #[async_trait]
    impl TextGenerator for SlowGenerator {
        async fn stream_text(&self, _request: GenerationRequest) -> Result<TokenSource> {
            tokio::time::sleep(self.delay).await;
            let delay = self.delay;
            Ok(Box::pin(async_stream::stream! {
                tokio::time::sleep(delay).await;
                yield Ok::<_, RelayError>(SourceEvent::delta("late"));
                yield Ok(SourceEvent::completed());
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn segment_deadline_spans_invocation_and_body() {
        let policy = ContinuationPolicy::new(
            ContinuationConfig::default(),
            Arc::new(SlowGenerator {
                delay: Duration::from_secs(8),
            }),
        )
        .with_segment_timeout(Duration::from_secs(10));

        let started = Instant::now();
        let source = policy.invoke(request()).await.unwrap();
        let items: Vec<_> = source.collect().await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(RelayError::TimeoutError(_))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[test]
    fn decide_respects_budget() {
        let policy = ContinuationPolicy::new(
            ContinuationConfig {
                max_segments: 3,
                max_tokens: 10,
            },
            ScriptedGenerator::new(vec![]),
        );
        assert_eq!(policy.decide(1), Decision::Continue);
        assert_eq!(policy.decide(2), Decision::Continue);
        assert_eq!(policy.decide(3), Decision::Finalize);
    }
}
