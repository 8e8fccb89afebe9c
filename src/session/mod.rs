//! Session registry
//!
//! Maps a backend plus working directory to a live pane, persisted as a small
//! marker record so later invocations reconnect instead of starting a second
//! assistant with fresh context.

pub mod conversation;
pub mod registry;
pub mod store;

pub use registry::{pane_name, Session, SessionRegistry, SessionStatus};
pub use store::{
    FileSessionStore, InflightClaim, MemorySessionStore, SessionKey, SessionRecord, SessionStore,
};
