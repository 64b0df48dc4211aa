//! Client side of the parlor chat backend
//!
//! [`ChatBackend`] talks HTTP, [`FrameDecoder`] turns the streamed body into
//! events and [`StreamConsumer`] folds those events into a transcript.

pub mod api;
pub mod consumer;
pub mod error;
pub mod feedback;
pub mod frame;

pub use api::{BackendStats, ByteStream, ChatBackend, ChatTransport, HealthStatus};
pub use consumer::{
    consume_stream, NoopObserver, StreamConsumer, TranscriptObserver, TranscriptUpdate,
    TurnOutcome,
};
pub use error::{ClientError, ClientResult};
pub use feedback::rate_message;
pub use frame::{Frame, FrameDecoder, StreamEvent};
pub use tokio_util::sync::CancellationToken;
