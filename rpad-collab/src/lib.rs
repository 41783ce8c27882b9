//! # rpad-collab — Client side of a collaborative plain-text pad
//!
//! Keeps a local text editor in sync with a sequencing server using
//! operational transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   LocalChange    ┌─────────────┐   ClientMsg (JSON)  ┌─────────────┐
//! │ text widget │ ───────────────► │   Session   │ ──────────────────► │   server    │
//! │ (adapter)   │ ◄─────────────── │             │ ◄────────────────── │ (sequencer) │
//! └─────────────┘   apply_remote   └──────┬──────┘   ServerMsg (JSON)  └─────────────┘
//!                                         │
//!                          ┌──────────────┼──────────────┐
//!                          ▼              ▼              ▼
//!                   ┌────────────┐ ┌────────────┐ ┌────────────┐
//!                   │ SyncEngine │ │  Presence  │ │ Transport  │
//!                   │ (OT state) │ │  Tracker   │ │ (reconnect)│
//!                   └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Text operations over UTF-16 offsets: apply, compose, transform
//! - [`protocol`] — JSON wire messages exchanged with the server
//! - [`engine`] — Outstanding/buffer state machine and revision bookkeeping
//! - [`presence`] — Roster and cursors of the other participants
//! - [`editor`] — Editor adapter trait and local change stream
//! - [`transport`] — WebSocket connection with exponential backoff
//! - [`config`] — Endpoint and reconnect settings
//! - [`session`] — Facade wiring everything to the host

pub mod config;
pub mod editor;
pub mod engine;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{socket_uri, ReconnectPolicy, SessionConfig};
pub use editor::{
    local_changes, ApplyGuard, BufferEditor, ChangeReporter, EditorAdapter, EditorError,
    LocalChange, LocalChanges,
};
pub use engine::{PendingEdit, Reaction, SyncEngine, SyncError, SyncState};
pub use operation::{utf16_len, Operation, OperationError, Segment, TextChange};
pub use presence::PresenceTracker;
pub use protocol::{random_hue, ClientMsg, CursorData, ProtocolError, ServerMsg, UserInfo, UserOperation};
pub use session::{ConnectionState, Session, SessionEvent};
pub use transport::{Transport, TransportError, TransportEvent};
