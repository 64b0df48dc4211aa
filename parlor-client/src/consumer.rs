//! Streaming response consumer
//!
//! Sends one user message, reads the streamed reply frame by frame and folds
//! each event into the visible transcript as it arrives.

use crate::api::ChatTransport;
use crate::error::{ClientError, ClientResult};
use crate::frame::{Frame, FrameDecoder, StreamEvent};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use parlor_core::session::{Transcript, NETWORK_ERROR_MESSAGE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MAX_MESSAGE_CHARS: usize = 500;

/// A change applied to the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptUpdate<'a> {
    /// An assistant slot was opened
    Started { index: usize },
    /// Text was appended to a slot
    Appended { index: usize, content: &'a str },
    /// The reply finished and may be rated
    Completed { index: usize },
    /// The turn failed; `index` holds the error reply
    Failed { index: usize },
}

/// Gets called after every transcript mutation, one call per chunk
pub trait TranscriptObserver: Send + Sync {
    fn on_update(&self, transcript: &Transcript, update: TranscriptUpdate<'_>);
}

/// Observer that ignores updates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TranscriptObserver for NoopObserver {
    fn on_update(&self, _transcript: &Transcript, _update: TranscriptUpdate<'_>) {}
}

/// How a streaming turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// A completion event arrived; the reply at `index` is rateable
    Completed { index: usize },
    /// The stream ended without a completion event; feedback stays hidden
    Ended { index: Option<usize> },
    /// The stream failed and an error reply was written at `index`
    Failed { index: usize },
    /// Consumption stopped by the caller or by a newer send to the session
    Cancelled,
}

/// Sends messages and consumes the streamed replies
///
/// At most one stream per session is consumed at a time: a new send to a
/// session cancels the consumption of the stream already running for it.
pub struct StreamConsumer {
    transport: Arc<dyn ChatTransport>,
    max_message_chars: usize,
    in_flight: InFlight,
}

impl StreamConsumer {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            in_flight: InFlight::default(),
        }
    }

    /// Longest accepted message, in characters
    pub fn with_max_message_chars(mut self, max_message_chars: usize) -> Self {
        self.max_message_chars = max_message_chars;
        self
    }

    /// Whether a reply is currently streaming for `session_id`
    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.in_flight.contains(session_id)
    }

    /// Send `text` in `session_id` and stream the reply into `transcript`
    ///
    /// The user message is appended before any network I/O. Only invalid
    /// input is returned as an error; transport failures become an error
    /// reply in the transcript and a [`TurnOutcome::Failed`].
    pub async fn send(
        &self,
        text: &str,
        session_id: &str,
        transcript: &mut Transcript,
        observer: &dyn TranscriptObserver,
        cancel: &CancellationToken,
    ) -> ClientResult<TurnOutcome> {
        let message = self.validate(text)?;
        transcript.push_user(message);

        let ticket = self.in_flight.begin(session_id, cancel);
        let token = ticket.token.clone();

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(TurnOutcome::Cancelled),
            opened = self.transport.open_stream(message, session_id) => opened,
        };

        let outcome = match opened {
            Ok(stream) => consume_stream(stream, transcript, observer, &token).await,
            Err(e) => {
                warn!(session_id, "Failed to open chat stream: {}", e);
                fail(transcript, observer, NETWORK_ERROR_MESSAGE)
            }
        };

        info!(session_id, ?outcome, "Chat turn finished");
        Ok(outcome)
    }

    fn validate<'a>(&self, text: &'a str) -> ClientResult<&'a str> {
        let message = text.trim();
        if message.is_empty() {
            return Err(ClientError::InvalidMessage(
                "message must not be empty".to_string(),
            ));
        }
        let chars = message.chars().count();
        if chars > self.max_message_chars {
            return Err(ClientError::InvalidMessage(format!(
                "message is {} characters, the limit is {}",
                chars, self.max_message_chars
            )));
        }
        Ok(message)
    }
}

/// Fold a streamed reply into `transcript`
///
/// Reading stops at the first completion or error event, at end of stream,
/// or when `cancel` fires. The token is checked before every mutation, so a
/// cancelled consumer leaves the transcript untouched from then on.
pub async fn consume_stream<S>(
    mut stream: S,
    transcript: &mut Transcript,
    observer: &dyn TranscriptObserver,
    cancel: &CancellationToken,
) -> TurnOutcome
where
    S: Stream<Item = ClientResult<Bytes>> + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut received = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(transcript),
            next = stream.next() => next,
        };

        let (frames, ended) = match next {
            Some(Ok(bytes)) => {
                received |= !bytes.is_empty();
                (decoder.push(&bytes), false)
            }
            Some(Err(e)) => {
                if cancel.is_cancelled() {
                    return cancelled(transcript);
                }
                warn!("Chat stream failed mid-response: {}", e);
                return fail(transcript, observer, NETWORK_ERROR_MESSAGE);
            }
            None => (decoder.finish(), true),
        };

        for frame in frames {
            if cancel.is_cancelled() {
                return cancelled(transcript);
            }
            match frame {
                Frame::Malformed { payload, error } => {
                    warn!(%payload, "Skipping malformed frame: {}", error);
                }
                Frame::Event(event) => {
                    if let Some(outcome) = apply_event(event, transcript, observer) {
                        return outcome;
                    }
                }
            }
        }

        if ended {
            break;
        }
    }

    if !received {
        warn!("Chat stream ended without a body: {}", ClientError::MissingBody);
        return fail(transcript, observer, NETWORK_ERROR_MESSAGE);
    }

    let index = transcript.current();
    transcript.abandon();
    debug!(?index, "Chat stream ended without completion");
    TurnOutcome::Ended { index }
}

/// Apply one event; `Some` ends consumption
fn apply_event(
    event: StreamEvent,
    transcript: &mut Transcript,
    observer: &dyn TranscriptObserver,
) -> Option<TurnOutcome> {
    match event {
        StreamEvent::Start => {
            let index = transcript.begin_assistant();
            observer.on_update(transcript, TranscriptUpdate::Started { index });
            None
        }
        StreamEvent::Chunk { content } => {
            let index = transcript.append_chunk(&content);
            observer.on_update(
                transcript,
                TranscriptUpdate::Appended {
                    index,
                    content: &content,
                },
            );
            None
        }
        StreamEvent::Complete { full_message } => {
            let Some(index) = transcript.complete() else {
                debug!("Completion received without an open reply");
                return Some(TurnOutcome::Ended { index: None });
            };
            if let Some(full) = full_message {
                if full != transcript.messages()[index].text {
                    debug!(index, "Streamed text differs from the backend's full message");
                }
            }
            observer.on_update(transcript, TranscriptUpdate::Completed { index });
            Some(TurnOutcome::Completed { index })
        }
        StreamEvent::Error { message } => {
            warn!("Backend reported a streaming error: {}", message);
            let text = if message.trim().is_empty() {
                NETWORK_ERROR_MESSAGE.to_string()
            } else {
                format!("Sorry, I couldn't answer that: {}", message)
            };
            Some(fail(transcript, observer, &text))
        }
    }
}

fn fail(transcript: &mut Transcript, observer: &dyn TranscriptObserver, text: &str) -> TurnOutcome {
    let index = transcript.fail(text);
    observer.on_update(transcript, TranscriptUpdate::Failed { index });
    TurnOutcome::Failed { index }
}

fn cancelled(transcript: &mut Transcript) -> TurnOutcome {
    transcript.abandon();
    debug!("Chat stream consumption cancelled");
    TurnOutcome::Cancelled
}

/// Registry of the stream currently consumed for each session
#[derive(Default)]
struct InFlight {
    streams: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl InFlight {
    /// Register a new stream, cancelling any previous one for the session
    fn begin<'a>(&'a self, session_id: &str, parent: &CancellationToken) -> InFlightTicket<'a> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();

        let previous = self
            .streams
            .lock()
            .insert(session_id.to_string(), (id, token.clone()));
        if let Some((_, previous)) = previous {
            debug!(session_id, "Superseding in-flight chat stream");
            previous.cancel();
        }

        InFlightTicket {
            registry: self,
            session_id: session_id.to_string(),
            id,
            token,
        }
    }

    fn contains(&self, session_id: &str) -> bool {
        self.streams.lock().contains_key(session_id)
    }
}

/// Unregisters its stream on drop unless a newer one replaced it
struct InFlightTicket<'a> {
    registry: &'a InFlight,
    session_id: String,
    id: u64,
    token: CancellationToken,
}

impl Drop for InFlightTicket<'_> {
    fn drop(&mut self) {
        let mut streams = self.registry.streams.lock();
        if streams
            .get(&self.session_id)
            .is_some_and(|(id, _)| *id == self.id)
        {
            streams.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ByteStream;
    use async_trait::async_trait;
    use parlor_core::session::Message;
    use std::collections::VecDeque;
    use tokio::sync::{mpsc, Notify};

    fn frame(json: &str) -> ClientResult<Bytes> {
        Ok(Bytes::from(format!("data: {}\n\n", json)))
    }

    fn body(items: Vec<ClientResult<Bytes>>) -> impl Stream<Item = ClientResult<Bytes>> + Unpin {
        futures::stream::iter(items)
    }

    /// Hands out pre-arranged bodies, one per `open_stream` call
    #[derive(Default)]
    struct ScriptedTransport {
        bodies: Mutex<VecDeque<ClientResult<ByteStream>>>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        fn push_items(&self, items: Vec<ClientResult<Bytes>>) {
            self.bodies
                .lock()
                .push_back(Ok(Box::pin(futures::stream::iter(items))));
        }

        fn push_channel(&self) -> mpsc::UnboundedSender<ClientResult<Bytes>> {
            let (tx, rx) = mpsc::unbounded_channel();
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            self.bodies.lock().push_back(Ok(Box::pin(stream)));
            tx
        }

        fn push_error(&self) {
            self.bodies
                .lock()
                .push_back(Err(ClientError::Api("HTTP 502: bad gateway".to_string())));
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open_stream(&self, message: &str, session_id: &str) -> ClientResult<ByteStream> {
            self.requests
                .lock()
                .push((message.to_string(), session_id.to_string()));
            self.bodies
                .lock()
                .pop_front()
                .unwrap_or(Err(ClientError::MissingBody))
        }
    }

    /// Records the request, then never finishes opening
    #[derive(Default)]
    struct StalledTransport {
        requests: Mutex<Vec<String>>,
        opened: Notify,
    }

    #[async_trait]
    impl ChatTransport for StalledTransport {
        async fn open_stream(&self, message: &str, _session_id: &str) -> ClientResult<ByteStream> {
            self.requests.lock().push(message.to_string());
            self.opened.notify_one();
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<String>>,
        notify: Notify,
    }

    impl TranscriptObserver for Recorder {
        fn on_update(&self, transcript: &Transcript, update: TranscriptUpdate<'_>) {
            let entry = match update {
                TranscriptUpdate::Started { index } => format!("start {}", index),
                TranscriptUpdate::Appended { index, content } => {
                    format!("chunk {} {:?} -> {:?}", index, content, transcript.messages()[index].text)
                }
                TranscriptUpdate::Completed { index } => format!("complete {}", index),
                TranscriptUpdate::Failed { index } => format!("failed {}", index),
            };
            self.updates.lock().push(entry);
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn test_start_chunks_complete() {
        let mut transcript = Transcript::new();
        let recorder = Recorder::default();
        let stream = body(vec![
            frame(r#"{"type":"start"}"#),
            frame(r#"{"type":"chunk","content":"Hel"}"#),
            frame(r#"{"type":"chunk","content":"lo"}"#),
            frame(r#"{"type":"complete","full_message":"Hello"}"#),
        ]);

        let outcome =
            consume_stream(stream, &mut transcript, &recorder, &CancellationToken::new()).await;

        assert_eq!(outcome, TurnOutcome::Completed { index: 0 });
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.messages()[0].text, "Hello");
        assert!(transcript.messages()[0].show_feedback);
        assert_eq!(
            *recorder.updates.lock(),
            vec![
                "start 0".to_string(),
                "chunk 0 \"Hel\" -> \"Hel\"".to_string(),
                "chunk 0 \"lo\" -> \"Hello\"".to_string(),
                "complete 0".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_frames_after_complete_are_ignored() {
        let mut transcript = Transcript::new();
        let stream = body(vec![Ok(Bytes::from(
            "data: {\"type\":\"start\"}\n\
             data: {\"type\":\"chunk\",\"content\":\"done\"}\n\
             data: {\"type\":\"complete\"}\n\
             data: {\"type\":\"chunk\",\"content\":\" extra\"}\n",
        ))]);

        let outcome =
            consume_stream(stream, &mut transcript, &NoopObserver, &CancellationToken::new()).await;

        assert_eq!(outcome, TurnOutcome::Completed { index: 0 });
        assert_eq!(transcript.messages()[0].text, "done");
    }

    #[tokio::test]
    async fn test_missing_complete_keeps_feedback_hidden() {
        let mut transcript = Transcript::new();
        let stream = body(vec![
            frame(r#"{"type":"start"}"#),
            frame(r#"{"type":"chunk","content":"cut off"}"#),
        ]);

        let outcome =
            consume_stream(stream, &mut transcript, &NoopObserver, &CancellationToken::new()).await;

        assert_eq!(outcome, TurnOutcome::Ended { index: Some(0) });
        assert!(!transcript.messages()[0].show_feedback);
        assert_eq!(transcript.current(), None);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let mut transcript = Transcript::new();
        let stream = body(vec![
            frame(r#"{"type":"start"}"#),
            frame(r#"{"type":"chunk","content":"a"}"#),
            Ok(Bytes::from("data: {not json\n")),
            frame(r#"{"type":"chunk","content":"b"}"#),
            frame(r#"{"type":"complete"}"#),
        ]);

        let outcome =
            consume_stream(stream, &mut transcript, &NoopObserver, &CancellationToken::new()).await;

        assert_eq!(outcome, TurnOutcome::Completed { index: 0 });
        assert_eq!(transcript.messages()[0].text, "ab");
    }

    #[tokio::test]
    async fn test_mid_stream_error_appends_error_reply() {
        let mut transcript = Transcript::new();
        let stream = body(vec![
            frame(r#"{"type":"start"}"#),
            frame(r#"{"type":"chunk","content":"partial"}"#),
            Err(ClientError::Api("connection reset".to_string())),
            frame(r#"{"type":"chunk","content":"never"}"#),
        ]);

        let outcome =
            consume_stream(stream, &mut transcript, &NoopObserver, &CancellationToken::new()).await;

        assert_eq!(outcome, TurnOutcome::Failed { index: 1 });
        assert_eq!(transcript.messages()[0].text, "partial");
        assert_eq!(
            transcript.messages()[1],
            Message::assistant_error(NETWORK_ERROR_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_empty_body_reports_network_error() {
        let mut transcript = Transcript::new();
        let outcome = consume_stream(
            body(Vec::new()),
            &mut transcript,
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, TurnOutcome::Failed { index: 0 });
        assert!(!transcript.messages()[0].show_feedback);
    }

    #[tokio::test]
    async fn test_backend_error_event() {
        let mut transcript = Transcript::new();
        let stream = body(vec![
            frame(r#"{"type":"start"}"#),
            frame(r#"{"type":"error","message":"quota exceeded"}"#),
        ]);

        let outcome =
            consume_stream(stream, &mut transcript, &NoopObserver, &CancellationToken::new()).await;

        assert_eq!(outcome, TurnOutcome::Failed { index: 0 });
        assert!(transcript.messages()[0].text.contains("quota exceeded"));
        assert!(!transcript.messages()[0].show_feedback);
    }

    #[tokio::test]
    async fn test_send_appends_user_message_first() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_items(vec![
            frame(r#"{"type":"start"}"#),
            frame(r#"{"type":"chunk","content":"hey"}"#),
            frame(r#"{"type":"complete"}"#),
        ]);
        let consumer = StreamConsumer::new(transport.clone());
        let mut transcript = Transcript::new();

        let outcome = consumer
            .send("  hello  ", "s1", &mut transcript, &NoopObserver, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Completed { index: 1 });
        assert_eq!(transcript.messages()[0], Message::user("hello"));
        assert_eq!(
            *transport.requests.lock(),
            vec![("hello".to_string(), "s1".to_string())]
        );
        assert!(!consumer.is_streaming("s1"));
    }

    #[tokio::test]
    async fn test_user_message_present_while_open_pending() {
        let transport = Arc::new(StalledTransport::default());
        let consumer = StreamConsumer::new(transport.clone());
        let cancel = CancellationToken::new();
        let mut transcript = Transcript::new();

        let send = consumer.send("hello", "s1", &mut transcript, &NoopObserver, &cancel);
        let driver = async {
            transport.opened.notified().await;
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(send, driver);

        // the open never returned, so the message was pushed before it
        assert_eq!(outcome.unwrap(), TurnOutcome::Cancelled);
        assert_eq!(*transport.requests.lock(), vec!["hello".to_string()]);
        assert_eq!(transcript.messages(), [Message::user("hello")].as_slice());
        assert!(!consumer.is_streaming("s1"));
    }

    #[tokio::test]
    async fn test_send_rejects_invalid_input() {
        let consumer = StreamConsumer::new(Arc::new(ScriptedTransport::default()))
            .with_max_message_chars(5);
        let mut transcript = Transcript::new();
        let cancel = CancellationToken::new();

        for text in ["", "   ", "too long"] {
            let err = consumer
                .send(text, "s1", &mut transcript, &NoopObserver, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::InvalidMessage(_)));
        }
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn test_send_open_failure_writes_single_error_reply() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_error();
        let consumer = StreamConsumer::new(transport);
        let mut transcript = Transcript::new();

        let outcome = consumer
            .send("hi", "s1", &mut transcript, &NoopObserver, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Failed { index: 1 });
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[1].text, NETWORK_ERROR_MESSAGE);
        assert!(!transcript.messages()[1].show_feedback);
    }

    #[tokio::test]
    async fn test_cancel_stops_applying_events() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_channel();
        let consumer = StreamConsumer::new(transport);
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();
        let mut transcript = Transcript::new();

        tx.send(frame(r#"{"type":"start"}"#)).unwrap();
        let send = consumer.send("hi", "s1", &mut transcript, &recorder, &cancel);
        let driver = async {
            recorder.notify.notified().await;
            cancel.cancel();
            tx.send(frame(r#"{"type":"chunk","content":"late"}"#)).unwrap();
        };
        let (outcome, ()) = tokio::join!(send, driver);

        assert_eq!(outcome.unwrap(), TurnOutcome::Cancelled);
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[1].text, "");
        assert!(!transcript.messages()[1].show_feedback);
    }

    #[tokio::test]
    async fn test_new_send_supersedes_stream_for_same_session() {
        let transport = Arc::new(ScriptedTransport::default());
        let first_tx = transport.push_channel();
        transport.push_items(vec![
            frame(r#"{"type":"start"}"#),
            frame(r#"{"type":"chunk","content":"second"}"#),
            frame(r#"{"type":"complete"}"#),
        ]);
        let consumer = StreamConsumer::new(transport);
        let first_recorder = Recorder::default();
        let cancel = CancellationToken::new();
        let mut first = Transcript::new();
        let mut second = Transcript::new();

        first_tx.send(frame(r#"{"type":"start"}"#)).unwrap();
        let first_send = consumer.send("one", "s1", &mut first, &first_recorder, &cancel);
        let second_send = async {
            first_recorder.notify.notified().await;
            assert!(consumer.is_streaming("s1"));
            let outcome = consumer
                .send("two", "s1", &mut second, &NoopObserver, &cancel)
                .await;
            first_tx
                .send(frame(r#"{"type":"chunk","content":"stale"}"#))
                .unwrap();
            outcome
        };
        let (first_outcome, second_outcome) = tokio::join!(first_send, second_send);

        assert_eq!(first_outcome.unwrap(), TurnOutcome::Cancelled);
        assert_eq!(second_outcome.unwrap(), TurnOutcome::Completed { index: 1 });
        assert_eq!(first.messages()[1].text, "");
        assert_eq!(second.messages()[1].text, "second");
        assert!(!consumer.is_streaming("s1"));
    }
}
