//! Streaming layer: one continuous output assembled from chained token sources.

pub mod continuation;
pub mod switchable;

pub use continuation::{
    ContinuationConfig, ContinuationPolicy, Decision, Finish, MAX_RESPONSE_SEGMENTS, MAX_TOKENS,
    RelayOutcome,
};
pub use switchable::{
    CumulativeUsage, StreamState, SwitchEvent, SwitchEvents, SwitchableOutput, SwitchableStream,
};
