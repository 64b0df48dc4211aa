//! Session management for conversation history
//!
//! All sessions live in one versioned JSON blob owned by [`SessionStore`].

pub mod blob;
pub mod manager;
pub mod persist;
pub mod store;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use manager::{NoopNotifier, NotifyError, SessionNotifier, SessionStore};
pub use persist::{SCHEMA_VERSION, SESSIONS_KEY};
pub use store::{
    Message, Rating, Session, SessionMap, SessionSummary, Transcript, NETWORK_ERROR_MESSAGE,
};
