//! Session store: named conversations with one active at a time

use super::blob::BlobStore;
use super::persist::{decode_collection, encode_collection, SESSIONS_KEY};
use super::store::{Message, Session, SessionMap, SessionSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Error returned by a [`SessionNotifier`]
pub type NotifyError = Box<dyn std::error::Error + Send + Sync>;

/// Receives best-effort notice that a session was deleted locally
#[async_trait]
pub trait SessionNotifier: Send + Sync {
    async fn session_deleted(&self, session_id: &str) -> Result<(), NotifyError>;
}

/// Notifier that tells nobody
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl SessionNotifier for NoopNotifier {
    async fn session_deleted(&self, _session_id: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Owns the persisted session collection and the active session pointer
///
/// The collection always holds at least one session and `active_id` always
/// names one of them. Every mutation rewrites the whole blob.
pub struct SessionStore {
    blobs: Box<dyn BlobStore>,
    sessions: SessionMap,
    active_id: String,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .field("active_id", &self.active_id)
            .finish()
    }
}

impl SessionStore {
    /// Load the collection and pick the active session
    ///
    /// An empty (or unreadable) collection gets one fresh session, which is
    /// persisted immediately. Otherwise the newest session becomes active.
    pub fn bootstrap(blobs: impl BlobStore + 'static) -> crate::Result<Self> {
        let blobs: Box<dyn BlobStore> = Box::new(blobs);
        let sessions = match blobs.get(SESSIONS_KEY)? {
            Some(raw) => decode_collection(&raw),
            None => SessionMap::new(),
        };

        let newest = newest_session_id(&sessions);
        let mut store = Self {
            blobs,
            sessions,
            active_id: String::new(),
        };

        match newest {
            Some(id) => {
                debug!(session_id = %id, "Resuming newest session");
                store.active_id = id;
            }
            None => {
                let id = store.insert_new_session(Utc::now());
                info!(session_id = %id, "Created initial session");
                store.active_id = id;
                store.persist()?;
            }
        }

        Ok(store)
    }

    /// Id of the active session
    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    /// The active session
    pub fn active(&self) -> &Session {
        // active_id is kept pointing at an existing entry by every operation
        &self.sessions[&self.active_id]
    }

    /// Get a session by id
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Number of sessions, never zero
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Summaries, newest first
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> =
            self.sessions.values().map(Session::summary).collect();
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        summaries
    }

    /// Overwrite the active session's transcript and persist
    pub fn save_active(&mut self, transcript: Vec<Message>) -> crate::Result<()> {
        let active_id = self.active_id.clone();
        let session = self
            .sessions
            .get_mut(&active_id)
            .ok_or_else(|| crate::Error::NotFound(format!("session {}", active_id)))?;
        session.messages = transcript;
        self.persist()
    }

    /// Flush the active transcript, then create and activate a new session
    pub fn create_session(&mut self, transcript: Vec<Message>) -> crate::Result<String> {
        self.save_active(transcript)?;

        let id = self.insert_new_session(Utc::now());
        if let Err(e) = self.persist() {
            self.sessions.remove(&id);
            return Err(e);
        }
        self.active_id = id.clone();

        info!(session_id = %id, total = self.sessions.len(), "Created session");
        Ok(id)
    }

    /// Make `target_id` active, flushing the current transcript first
    ///
    /// Returns `None` without touching anything when `target_id` is already
    /// active; otherwise the target's transcript for rendering.
    pub fn switch_session(
        &mut self,
        target_id: &str,
        transcript: Vec<Message>,
    ) -> crate::Result<Option<Vec<Message>>> {
        if target_id == self.active_id {
            return Ok(None);
        }
        if !self.sessions.contains_key(target_id) {
            return Err(crate::Error::NotFound(format!("session {}", target_id)));
        }

        self.save_active(transcript)?;
        self.active_id = target_id.to_string();
        debug!(session_id = %target_id, "Switched session");

        Ok(Some(
            self.sessions
                .get(target_id)
                .map(|s| s.messages.clone())
                .unwrap_or_default(),
        ))
    }

    /// Delete a session
    ///
    /// Refused when it is the last one. The notifier is told first, but its
    /// failure never stops the local deletion. When the active session is
    /// deleted the newest remaining one becomes active and its transcript
    /// is returned.
    pub async fn delete_session(
        &mut self,
        target_id: &str,
        notifier: &dyn SessionNotifier,
    ) -> crate::Result<Option<Vec<Message>>> {
        if self.sessions.len() <= 1 {
            return Err(crate::Error::LastSession);
        }
        if !self.sessions.contains_key(target_id) {
            return Err(crate::Error::NotFound(format!("session {}", target_id)));
        }

        if let Err(e) = notifier.session_deleted(target_id).await {
            warn!(session_id = %target_id, "Failed to notify backend of session deletion: {}", e);
        }

        self.sessions.remove(target_id);
        let was_active = target_id == self.active_id;
        if was_active {
            // Non-empty: we refused above when only one session existed.
            if let Some(next) = newest_session_id(&self.sessions) {
                self.active_id = next;
            }
        }
        self.persist()?;
        info!(session_id = %target_id, remaining = self.sessions.len(), "Deleted session");

        Ok(was_active.then(|| self.active().messages.clone()))
    }

    /// Rename a session
    pub fn rename_session(&mut self, id: &str, name: &str) -> crate::Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(crate::Error::Validation(
                "session name must not be empty".to_string(),
            ));
        }
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| crate::Error::NotFound(format!("session {}", id)))?;
        session.name = name.to_string();
        self.persist()
    }

    fn insert_new_session(&mut self, now: DateTime<Utc>) -> String {
        let id = unique_id(&self.sessions, now);
        let name = format!("Session {}", self.sessions.len() + 1);
        self.sessions
            .insert(id.clone(), Session::new(id.clone(), name, now));
        id
    }

    fn persist(&self) -> crate::Result<()> {
        let raw = encode_collection(&self.sessions)?;
        self.blobs.put(SESSIONS_KEY, &raw)
    }
}

/// Time-derived id: epoch milliseconds, bumped until unused
fn unique_id(sessions: &SessionMap, now: DateTime<Utc>) -> String {
    let mut millis = now.timestamp_millis();
    loop {
        let candidate = millis.to_string();
        if !sessions.contains_key(&candidate) {
            return candidate;
        }
        millis += 1;
    }
}

fn newest_session_id(sessions: &SessionMap) -> Option<String> {
    sessions
        .iter()
        .max_by(|(ka, a), (kb, b)| a.created_at.cmp(&b.created_at).then_with(|| ka.cmp(kb)))
        .map(|(key, _)| key.clone())
}
