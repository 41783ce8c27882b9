//! The session facade held by the host application.
//!
//! ```text
//!   host ──set_info/set_language/set_cursor/dispose──► Session
//!                                                        │
//!   Transport ──TransportEvent──► SyncEngine ──Reaction──┤──► EditorAdapter
//!                                      │                 │
//!                                      └── PresenceTracker
//!                                                        │
//!   host ◄──────────────── SessionEvent channel ─────────┘
//! ```
//!
//! A session is driven by a single task: the host calls [`Session::step`]
//! (or [`Session::run`]) in its event loop and every state transition
//! happens inside that call. Nothing is shared between threads.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::editor::{EditorAdapter, LocalChange, LocalChanges};
use crate::engine::{Reaction, SyncEngine, SyncError};
use crate::operation::Operation;
use crate::presence::PresenceTracker;
use crate::protocol::{ClientMsg, CursorData, ServerMsg, UserInfo};
use crate::transport::{Transport, TransportEvent};

/// Connection state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connection was lost; reconnect attempts keep running with backoff
    /// until one opens.
    Disconnected,
    /// The first connection attempt has not opened yet.
    Connecting,
    Connected,
    /// Terminal; construct a new session to recover.
    Desynchronized,
}

/// Notifications published to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// Fired at most once per session.
    Desynchronized,
    ChangeLanguage(String),
    /// Full roster of the other participants.
    ChangeUsers(BTreeMap<u64, UserInfo>),
    /// Cursor positions of the other participants.
    ChangeCursors(BTreeMap<u64, CursorData>),
    /// Unacknowledged local edits were discarded after a reconnect.
    LocalEditsDropped,
}

enum Wake {
    Transport(Option<TransportEvent>),
    Local(LocalChange),
}

/// One collaboration on one document.
pub struct Session<E: EditorAdapter> {
    transport: Transport,
    engine: SyncEngine,
    presence: PresenceTracker,
    editor: E,
    changes: LocalChanges,
    state: ConnectionState,
    events: mpsc::UnboundedSender<SessionEvent>,
    disposed: bool,
}

impl<E: EditorAdapter> Session<E> {
    /// Create the session and start connecting.
    ///
    /// `changes` must be the receiving end of the stream the editor reports
    /// user edits to. Must be called inside a tokio runtime.
    pub fn new(
        config: SessionConfig,
        editor: E,
        changes: LocalChanges,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let mut transport = Transport::new(config.uri, config.reconnect);
        transport.connect();
        let session = Self {
            transport,
            engine: SyncEngine::new(),
            presence: PresenceTracker::new(),
            editor,
            changes,
            state: ConnectionState::Connecting,
            events,
            disposed: false,
        };
        (session, event_rx)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn revision(&self) -> u64 {
        self.engine.revision()
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn users(&self) -> &BTreeMap<u64, UserInfo> {
        self.presence.users()
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    pub fn editor_mut(&mut self) -> &mut E {
        &mut self.editor
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn is_inert(&self) -> bool {
        self.disposed || self.state == ConnectionState::Desynchronized
    }

    /// Wait for one transport event or local change and process it.
    ///
    /// Returns `false` once the session is disposed or desynchronized.
    /// Cancel-safe, so it can be used as a `tokio::select!` branch.
    pub async fn step(&mut self) -> bool {
        if self.is_inert() {
            return false;
        }

        let wake = tokio::select! {
            event = self.transport.next_event() => Wake::Transport(event),
            change = self.changes.recv() => Wake::Local(change),
        };

        match wake {
            Wake::Local(change) => self.handle_local_change(change),
            Wake::Transport(Some(event)) => {
                // Edits already typed are older than anything we apply now.
                self.drain_local_changes();
                self.handle_transport(event);
            }
            Wake::Transport(None) => {}
        }
        !self.is_inert()
    }

    /// Drive the session until it is disposed or desynchronized.
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    /// Feed an operation produced by the local user directly.
    pub fn local_edit(&mut self, op: Operation) {
        if self.is_inert() {
            return;
        }
        self.drain_local_changes();
        self.apply_local(op);
    }

    /// Push the local participant's identity. Dropped unless connected.
    pub fn set_info(&mut self, info: UserInfo) {
        if !self.send_if_connected(ClientMsg::ClientInfo(info)) {
            log::debug!("Dropping identity update while not connected");
        }
    }

    /// Push the local cursors. Dropped unless connected.
    pub fn set_cursor(&mut self, data: CursorData) {
        self.send_if_connected(ClientMsg::CursorData(data));
    }

    /// Propose a document language. Returns `true` if it was sent.
    pub fn set_language(&mut self, language: &str) -> bool {
        self.send_if_connected(ClientMsg::change_language(language))
    }

    /// Tear the session down. Every later call is a no-op.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.transport.dispose();
        log::info!("Session disposed");
    }

    fn send_if_connected(&mut self, msg: ClientMsg) -> bool {
        if self.is_inert() || self.state != ConnectionState::Connected {
            return false;
        }
        match self.transport.send(&msg) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to send message: {e}");
                false
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The host may have stopped listening; that is not our concern.
        let _ = self.events.send(event);
    }

    fn drain_local_changes(&mut self) {
        while !self.is_inert() {
            let Some(change) = self.changes.try_recv() else {
                break;
            };
            self.handle_local_change(change);
        }
    }

    fn handle_local_change(&mut self, change: LocalChange) {
        if self.is_inert() {
            return;
        }
        match change.to_operation() {
            Ok(op) => self.apply_local(op),
            Err(e) => self.desynchronize(e.into()),
        }
    }

    fn apply_local(&mut self, op: Operation) {
        if self.presence.transform_cursors(&op) {
            self.emit(SessionEvent::ChangeCursors(self.presence.cursors().clone()));
        }
        let reaction = self.engine.local_edit(op);
        self.apply_reaction(reaction);
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.state = ConnectionState::Connected;
                self.engine.on_open();
                if self.presence.clear() {
                    self.emit(SessionEvent::ChangeUsers(BTreeMap::new()));
                    self.emit(SessionEvent::ChangeCursors(BTreeMap::new()));
                }
                self.emit(SessionEvent::Connected);
            }
            TransportEvent::Close(reason) => {
                log::info!("Disconnected: {reason}");
                self.state = ConnectionState::Disconnected;
                self.engine.on_close();
                self.emit(SessionEvent::Disconnected);
            }
            TransportEvent::Message(msg) => self.handle_message(msg),
        }
    }

    fn handle_message(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::Identity { id } => {
                log::debug!("Assigned participant id {id}");
                self.engine.on_identity(id);
                self.presence.set_local_id(id);
            }
            ServerMsg::History {
                start_revision,
                operations,
            } => {
                let reaction = self.engine.on_history(start_revision, operations);
                self.apply_reaction(reaction);
            }
            ServerMsg::Snapshot { revision, text } => {
                let reaction = self.engine.on_snapshot(revision, text);
                self.apply_reaction(reaction);
            }
            ServerMsg::Edit {
                id,
                revision,
                operation,
            } => {
                let reaction = self.engine.on_edit(id, revision, operation);
                self.apply_reaction(reaction);
            }
            ServerMsg::UserInfo { id, name, hue } => {
                if self.presence.upsert(id, UserInfo { name, hue }) {
                    self.emit(SessionEvent::ChangeUsers(self.presence.users().clone()));
                }
            }
            ServerMsg::UserLeft { id } => {
                let had_cursor = self.presence.cursors().contains_key(&id);
                if self.presence.remove(id) {
                    self.emit(SessionEvent::ChangeUsers(self.presence.users().clone()));
                }
                if had_cursor {
                    self.emit(SessionEvent::ChangeCursors(self.presence.cursors().clone()));
                }
            }
            ServerMsg::LanguageChanged { language } => {
                self.emit(SessionEvent::ChangeLanguage(language));
            }
            ServerMsg::UserCursor { id, data } => {
                if self.presence.update_cursor(id, data) {
                    self.emit(SessionEvent::ChangeCursors(self.presence.cursors().clone()));
                }
            }
        }
    }

    fn apply_reaction(&mut self, reaction: Result<Reaction, SyncError>) {
        let reaction = match reaction {
            Ok(reaction) => reaction,
            Err(e) => return self.desynchronize(e),
        };

        let mut cursors_moved = false;
        for op in &reaction.apply {
            let result = {
                let _guard = self.changes.suppress();
                self.editor.apply_remote(op)
            };
            if let Err(e) = result {
                return self.desynchronize(SyncError::Editor(e.to_string()));
            }
            cursors_moved |= self.presence.transform_cursors(op);
        }
        if cursors_moved {
            self.emit(SessionEvent::ChangeCursors(self.presence.cursors().clone()));
        }
        if reaction.dropped_local {
            self.emit(SessionEvent::LocalEditsDropped);
        }
        for msg in &reaction.send {
            if let Err(e) = self.transport.send(msg) {
                // The engine resends after the next catch-up.
                log::warn!("Could not send edit: {e}");
            }
        }
    }

    fn desynchronize(&mut self, err: SyncError) {
        if self.state == ConnectionState::Desynchronized {
            return;
        }
        log::error!("Desynchronized from server: {err}");
        self.engine.desynchronize();
        self.state = ConnectionState::Desynchronized;
        self.transport.dispose();
        self.emit(SessionEvent::Desynchronized);
    }
}

impl<E: EditorAdapter> Drop for Session<E> {
    fn drop(&mut self) {
        self.dispose();
    }
}
