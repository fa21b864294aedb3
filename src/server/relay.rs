//! Request-to-stream wiring shared by the streaming endpoints.

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::source::GenerationRequest;
use crate::streaming::continuation::{ContinuationPolicy, Finish, RelayOutcome};
use crate::streaming::switchable::{CumulativeUsage, SwitchableStream};

/// Start relaying `request` and return the streaming response.
///
/// The first segment is invoked before the response is produced, so a
/// provider that refuses the call still turns into an error status. Every
/// later segment is driven by a spawned task tied to the response body.
pub async fn start_relay(policy: ContinuationPolicy, request: GenerationRequest) -> Result<Response> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "relay",
        %request_id,
        provider = %request.provider,
        model = %request.model,
    );

    async move {
        let (stream, events) = SwitchableStream::new(CumulativeUsage::new());
        let output = stream.output()?;

        let first = policy.invoke(request.clone()).await.inspect_err(|e| {
            tracing::error!(error = %e, "initial invocation failed");
        })?;
        stream.attach(first)?;
        tracing::info!(
            max_segments = policy.config().max_segments,
            "streaming response"
        );

        tokio::spawn(
            async move {
                let outcome = policy.run(stream, events, request).await;
                log_outcome(&outcome);
            }
            .in_current_span(),
        );

        Ok((StatusCode::OK, Body::from_stream(output)).into_response())
    }
    .instrument(span)
    .await
}

fn log_outcome(outcome: &RelayOutcome) {
    match &outcome.finish {
        Finish::Completed | Finish::SegmentLimit => tracing::info!(
            segments = outcome.segments,
            completion_tokens = outcome.completion_tokens,
            finish = ?outcome.finish,
            "response finished"
        ),
        Finish::Cancelled => tracing::info!(
            segments = outcome.segments,
            completion_tokens = outcome.completion_tokens,
            "client went away"
        ),
        Finish::Failed(error) => tracing::warn!(
            segments = outcome.segments,
            completion_tokens = outcome.completion_tokens,
            error = %error,
            "response aborted"
        ),
    }
}
