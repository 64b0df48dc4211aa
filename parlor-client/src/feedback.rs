//! Rating assistant replies

use crate::api::ChatBackend;
use crate::error::ClientResult;
use parlor_core::session::{Rating, Transcript};
use tracing::warn;

/// Rate the reply at `index` and report it to the backend
///
/// Only finished assistant replies can be rated, and only once. The rating
/// is recorded locally first; a backend failure is logged and otherwise
/// ignored.
pub async fn rate_message(
    transcript: &mut Transcript,
    index: usize,
    rating: Rating,
    comment: Option<&str>,
    session_id: &str,
    backend: &ChatBackend,
) -> ClientResult<()> {
    transcript.rate(index, rating)?;

    if let Err(e) = backend.submit_feedback(session_id, rating, comment).await {
        warn!(session_id, index, "Failed to submit feedback: {}", e);
    }
    Ok(())
}
