//! Session data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sessions keyed by id. Ordered so the persisted blob is stable.
pub type SessionMap = BTreeMap<String, Session>;

/// Reply shown when a streaming turn cannot be completed
pub const NETWORK_ERROR_MESSAGE: &str =
    "Sorry, a network error occurred. Please try sending your message again.";

/// A 1-5 score given to an assistant reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    /// Create a rating, rejecting scores outside 1..=5
    pub fn new(score: u8) -> crate::Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&score) {
            Ok(Self(score))
        } else {
            Err(crate::Error::Validation(format!(
                "rating must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                score
            )))
        }
    }

    pub fn score(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = crate::Error;

    fn try_from(score: u8) -> crate::Result<Self> {
        Self::new(score)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

/// One entry of a conversation transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message text; grows while an assistant reply streams in
    pub text: String,
    /// Whether the user wrote this message
    pub is_user: bool,
    /// Whether rating controls are shown
    #[serde(default)]
    pub show_feedback: bool,
    /// Rating the user gave, set at most once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_given: Option<Rating>,
}

impl Message {
    /// A message typed by the user
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_user: true,
            show_feedback: false,
            feedback_given: None,
        }
    }

    /// An empty assistant slot waiting for streamed chunks
    pub fn assistant_placeholder() -> Self {
        Self {
            text: String::new(),
            is_user: false,
            show_feedback: false,
            feedback_given: None,
        }
    }

    /// A synthetic assistant reply reporting a failure; never rateable
    pub fn assistant_error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::assistant_placeholder()
        }
    }

    /// Whether a rating may still be recorded on this message
    pub fn is_rateable(&self) -> bool {
        !self.is_user && self.show_feedback && self.feedback_given.is_none()
    }

    /// Record a rating. Ratings are final: a second rating is rejected.
    pub fn record_rating(&mut self, rating: Rating) -> crate::Result<()> {
        if self.is_user {
            return Err(crate::Error::Validation(
                "only assistant replies can be rated".to_string(),
            ));
        }
        if !self.show_feedback {
            return Err(crate::Error::Validation(
                "reply is not finished and cannot be rated yet".to_string(),
            ));
        }
        if let Some(existing) = self.feedback_given {
            return Err(crate::Error::Validation(format!(
                "reply was already rated {}",
                existing.score()
            )));
        }
        self.feedback_given = Some(rating);
        Ok(())
    }
}

/// A named conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque, time-derived identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Session creation time
    pub created_at: DateTime<Utc>,
    /// Transcript, without the greeting
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    /// Create an empty session
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at,
            messages: Vec::new(),
        }
    }

    /// Summary used for listings
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            message_count: self.messages.len(),
        }
    }
}

/// Lightweight view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

/// The conversation currently on screen
///
/// Tracks the assistant slot that streamed chunks are appended to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<Message>,
    current: Option<usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a transcript from persisted messages
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            current: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Copy of the messages, for flushing into the session store
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Index of the assistant slot receiving chunks, if a reply is streaming
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Append a user message and return its index
    pub fn push_user(&mut self, text: impl Into<String>) -> usize {
        self.messages.push(Message::user(text));
        self.messages.len() - 1
    }

    /// Open a new assistant slot with empty text and hidden feedback
    pub fn begin_assistant(&mut self) -> usize {
        self.messages.push(Message::assistant_placeholder());
        let index = self.messages.len() - 1;
        self.current = Some(index);
        index
    }

    /// Append streamed text to the current assistant slot
    ///
    /// A chunk arriving without a preceding start opens a slot first.
    pub fn append_chunk(&mut self, content: &str) -> usize {
        let index = match self.current {
            Some(index) => index,
            None => self.begin_assistant(),
        };
        self.messages[index].text.push_str(content);
        index
    }

    /// Finish the current assistant slot and reveal its rating controls
    ///
    /// Returns the finished index, or `None` when no reply was streaming.
    pub fn complete(&mut self) -> Option<usize> {
        let index = self.current.take()?;
        self.messages[index].show_feedback = true;
        Some(index)
    }

    /// Report a failed turn with a single synthetic assistant message
    ///
    /// An empty slot opened by `start` is reused; a partially streamed reply
    /// is kept as-is and the error is appended after it.
    pub fn fail(&mut self, text: &str) -> usize {
        match self.current.take() {
            Some(index) if self.messages[index].text.is_empty() => {
                self.messages[index] = Message::assistant_error(text);
                index
            }
            _ => {
                self.messages.push(Message::assistant_error(text));
                self.messages.len() - 1
            }
        }
    }

    /// Stop tracking the streaming slot without completing it
    pub fn abandon(&mut self) {
        self.current = None;
    }

    /// Index of the newest assistant reply that can still be rated
    pub fn latest_rateable(&self) -> Option<usize> {
        self.messages.iter().rposition(Message::is_rateable)
    }

    /// Record a rating on the message at `index`
    pub fn rate(&mut self, index: usize, rating: Rating) -> crate::Result<()> {
        let message = self
            .messages
            .get_mut(index)
            .ok_or_else(|| crate::Error::NotFound(format!("message #{}", index)))?;
        message.record_rating(rating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_bounds() {
        assert!(Rating::new(0).is_err());
        assert_eq!(Rating::new(1).unwrap().score(), 1);
        assert_eq!(Rating::new(5).unwrap().score(), 5);
        assert!(Rating::new(6).is_err());
    }

    #[test]
    fn test_rating_rejected_on_deserialize() {
        let err = serde_json::from_str::<Rating>("9");
        assert!(err.is_err());
    }

    #[test]
    fn test_stream_lifecycle() {
        let mut transcript = Transcript::new();
        transcript.push_user("hello");
        let slot = transcript.begin_assistant();
        transcript.append_chunk("Hi");
        transcript.append_chunk(" there");

        assert!(!transcript.messages()[slot].show_feedback);
        assert_eq!(transcript.complete(), Some(slot));

        let reply = &transcript.messages()[slot];
        assert_eq!(reply.text, "Hi there");
        assert!(reply.show_feedback);
        assert_eq!(transcript.current(), None);
    }

    #[test]
    fn test_chunk_without_start_opens_slot() {
        let mut transcript = Transcript::new();
        let index = transcript.append_chunk("orphan");
        assert_eq!(index, 0);
        assert!(!transcript.messages()[0].is_user);
    }

    #[test]
    fn test_fail_reuses_empty_slot() {
        let mut transcript = Transcript::new();
        transcript.push_user("q");
        transcript.begin_assistant();
        transcript.fail(NETWORK_ERROR_MESSAGE);

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[1].text, NETWORK_ERROR_MESSAGE);
        assert!(!transcript.messages()[1].show_feedback);
    }

    #[test]
    fn test_fail_keeps_partial_reply() {
        let mut transcript = Transcript::new();
        transcript.begin_assistant();
        transcript.append_chunk("partial");
        transcript.fail(NETWORK_ERROR_MESSAGE);

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[0].text, "partial");
        assert_eq!(transcript.messages()[1].text, NETWORK_ERROR_MESSAGE);
    }

    #[test]
    fn test_rating_is_final() {
        let mut transcript = Transcript::new();
        transcript.begin_assistant();
        transcript.append_chunk("answer");
        transcript.complete();

        let index = transcript.latest_rateable().unwrap();
        transcript.rate(index, Rating::new(4).unwrap()).unwrap();
        assert!(transcript.rate(index, Rating::new(2).unwrap()).is_err());
        assert_eq!(
            transcript.messages()[index].feedback_given,
            Some(Rating::new(4).unwrap())
        );
        assert_eq!(transcript.latest_rateable(), None);
    }

    #[test]
    fn test_unfinished_and_user_messages_not_rateable() {
        let mut transcript = Transcript::new();
        transcript.push_user("q");
        transcript.begin_assistant();

        let rating = Rating::new(3).unwrap();
        assert!(transcript.rate(0, rating).is_err());
        assert!(transcript.rate(1, rating).is_err());
        assert!(matches!(
            transcript.rate(7, rating),
            Err(crate::Error::NotFound(_))
        ));
    }
}
