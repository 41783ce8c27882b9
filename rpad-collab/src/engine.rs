//! Revision and acknowledgement bookkeeping for one collaborating client.
//!
//! ```text
//!  AwaitingConnect ──open──► AwaitingSnapshot ──history/snapshot──► Synchronized
//!        ▲                                                              │
//!        └────────────────────────── close ─────────────────────────────┘
//!
//!  any state ──apply failure / revision gap / bad lengths──► Desynchronized
//! ```
//!
//! The engine is pure: it consumes local operations and server messages and
//! answers with a [`Reaction`] describing what must be applied to the editor
//! and what must be sent. It never performs I/O.
//!
//! At most one local operation is in flight. Edits made while it is
//! unacknowledged are composed into a single buffer that is sent when the
//! acknowledgement arrives.

use thiserror::Error;

use crate::operation::{utf16_len, Operation, OperationError};
use crate::protocol::{ClientMsg, UserOperation};

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No connection; local edits are held.
    AwaitingConnect,
    /// Connected, waiting for the catch-up history or snapshot.
    AwaitingSnapshot,
    Synchronized,
    /// Terminal.
    Desynchronized,
}

/// Reasons the engine gives up on a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("operation does not fit the document: {0}")]
    Operation(#[from] OperationError),
    #[error("revision gap: expected {expected}, received {received}")]
    RevisionGap { expected: u64, received: u64 },
    #[error("server revision {received} is behind local revision {local}")]
    RevisionRegressed { local: u64, received: u64 },
    #[error("server text differs from local text at revision {0}")]
    Diverged(u64),
    #[error("acknowledgement received with no outstanding edit")]
    UnexpectedAck,
    #[error("local edit expects {expected} units, document has {actual}")]
    LocalLengthMismatch { expected: usize, actual: usize },
    #[error("editor rejected a remote edit: {0}")]
    Editor(String),
    #[error("session is desynchronized")]
    Desynchronized,
}

/// The single unacknowledged local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    /// Revision the operation is based on.
    pub revision: u64,
    pub operation: Operation,
    /// Whether it was transmitted on the current connection.
    pub sent: bool,
}

/// What the session must do after feeding the engine.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    /// Operations to apply to the editor, in order.
    pub apply: Vec<Operation>,
    /// Messages to send, in order.
    pub send: Vec<ClientMsg>,
    /// Unacknowledged local edits were discarded to adopt a newer snapshot.
    pub dropped_local: bool,
}

impl Reaction {
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.send.is_empty() && !self.dropped_local
    }
}

/// OT client state machine.
#[derive(Debug)]
pub struct SyncEngine {
    state: SyncState,
    revision: u64,
    /// Server-confirmed text at `revision`.
    document: String,
    outstanding: Option<PendingEdit>,
    buffer: Option<Operation>,
    identity: Option<u64>,
    /// Ids assigned on earlier connections; history entries carrying them
    /// are our own edits.
    past_identities: Vec<u64>,
    /// Whether a catch-up was ever completed.
    synced_once: bool,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            state: SyncState::AwaitingConnect,
            revision: 0,
            document: String::new(),
            outstanding: None,
            buffer: None,
            identity: None,
            past_identities: Vec::new(),
            synced_once: false,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Server-confirmed document text.
    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn outstanding(&self) -> Option<&PendingEdit> {
        self.outstanding.as_ref()
    }

    pub fn buffer(&self) -> Option<&Operation> {
        self.buffer.as_ref()
    }

    pub fn identity(&self) -> Option<u64> {
        self.identity
    }

    pub fn is_desynchronized(&self) -> bool {
        self.state == SyncState::Desynchronized
    }

    /// Length of the local replica: confirmed text plus pending edits.
    pub fn local_len(&self) -> usize {
        match (&self.buffer, &self.outstanding) {
            (Some(buffer), _) => buffer.target_len(),
            (None, Some(pending)) => pending.operation.target_len(),
            (None, None) => utf16_len(&self.document),
        }
    }

    /// Enter the terminal state and discard pending edits.
    pub fn desynchronize(&mut self) {
        self.state = SyncState::Desynchronized;
        self.outstanding = None;
        self.buffer = None;
    }

    fn fail<T>(&mut self, err: SyncError) -> Result<T, SyncError> {
        self.desynchronize();
        Err(err)
    }

    fn ensure_live(&self) -> Result<(), SyncError> {
        if self.is_desynchronized() {
            Err(SyncError::Desynchronized)
        } else {
            Ok(())
        }
    }

    /// The transport opened a new connection.
    pub fn on_open(&mut self) {
        if self.is_desynchronized() {
            return;
        }
        self.state = SyncState::AwaitingSnapshot;
        if let Some(id) = self.identity.take() {
            self.past_identities.push(id);
        }
        if let Some(pending) = &mut self.outstanding {
            pending.sent = false;
        }
    }

    /// The transport lost its connection.
    pub fn on_close(&mut self) {
        if self.is_desynchronized() {
            return;
        }
        self.state = SyncState::AwaitingConnect;
        if let Some(pending) = &mut self.outstanding {
            pending.sent = false;
        }
    }

    pub fn on_identity(&mut self, id: u64) {
        self.identity = Some(id);
    }

    fn is_own(&self, id: u64) -> bool {
        self.identity == Some(id) || self.past_identities.contains(&id)
    }

    /// Record an operation produced by the local user.
    pub fn local_edit(&mut self, op: Operation) -> Result<Reaction, SyncError> {
        self.ensure_live()?;
        let actual = self.local_len();
        if op.base_len() != actual {
            return self.fail(SyncError::LocalLengthMismatch {
                expected: op.base_len(),
                actual,
            });
        }
        if op.is_noop() {
            return Ok(Reaction::default());
        }

        let mut reaction = Reaction::default();
        if self.outstanding.is_some() {
            let merged = match self.buffer.take() {
                Some(buffer) => match buffer.compose(&op) {
                    Ok(merged) => merged,
                    Err(e) => return self.fail(e.into()),
                },
                None => op,
            };
            self.buffer = Some(merged);
        } else {
            self.outstanding = Some(PendingEdit {
                revision: self.revision,
                operation: op,
                sent: false,
            });
            self.flush_outstanding(&mut reaction);
        }
        Ok(reaction)
    }

    /// Send the outstanding edit if the connection is synchronized and it
    /// has not been sent yet.
    fn flush_outstanding(&mut self, reaction: &mut Reaction) {
        if self.state != SyncState::Synchronized {
            return;
        }
        if let Some(pending) = &mut self.outstanding {
            if !pending.sent {
                pending.revision = self.revision;
                pending.sent = true;
                reaction
                    .send
                    .push(ClientMsg::edit(pending.revision, pending.operation.clone()));
            }
        }
    }

    /// An accepted edit broadcast by the server.
    pub fn on_edit(&mut self, id: u64, revision: u64, op: Operation) -> Result<Reaction, SyncError> {
        self.ensure_live()?;
        let mut reaction = Reaction::default();
        self.accept(id, revision, op, &mut reaction)?;
        Ok(reaction)
    }

    fn accept(
        &mut self,
        id: u64,
        revision: u64,
        op: Operation,
        reaction: &mut Reaction,
    ) -> Result<(), SyncError> {
        if revision < self.revision {
            log::debug!("Ignoring stale edit at revision {revision} (local {})", self.revision);
            return Ok(());
        }
        if revision > self.revision {
            return self.fail(SyncError::RevisionGap {
                expected: self.revision,
                received: revision,
            });
        }

        if self.is_own(id) {
            self.acknowledge(reaction)
        } else {
            self.apply_remote(op, reaction)
        }
    }

    fn acknowledge(&mut self, reaction: &mut Reaction) -> Result<(), SyncError> {
        let Some(pending) = self.outstanding.take() else {
            return self.fail(SyncError::UnexpectedAck);
        };
        match pending.operation.apply(&self.document) {
            Ok(text) => self.document = text,
            Err(e) => return self.fail(e.into()),
        }
        self.revision += 1;

        if let Some(buffer) = self.buffer.take() {
            self.outstanding = Some(PendingEdit {
                revision: self.revision,
                operation: buffer,
                sent: false,
            });
            self.flush_outstanding(reaction);
        }
        Ok(())
    }

    fn apply_remote(&mut self, op: Operation, reaction: &mut Reaction) -> Result<(), SyncError> {
        match op.apply(&self.document) {
            Ok(text) => self.document = text,
            Err(e) => return self.fail(e.into()),
        }
        self.revision += 1;

        let mut remote = op;
        if let Some(pending) = &mut self.outstanding {
            match pending.operation.transform(&remote) {
                Ok((local, rebased)) => {
                    pending.operation = local;
                    pending.revision = self.revision;
                    remote = rebased;
                }
                Err(e) => return self.fail(e.into()),
            }
        }
        if let Some(buffer) = &mut self.buffer {
            match buffer.transform(&remote) {
                Ok((local, rebased)) => {
                    *buffer = local;
                    remote = rebased;
                }
                Err(e) => return self.fail(e.into()),
            }
        }

        if !remote.is_noop() {
            reaction.apply.push(remote);
        }
        Ok(())
    }

    /// Catch-up or live batch of accepted operations.
    ///
    /// Entries below the local revision were already applied and are
    /// skipped. Completes a pending catch-up.
    pub fn on_history(
        &mut self,
        start_revision: u64,
        operations: Vec<UserOperation>,
    ) -> Result<Reaction, SyncError> {
        self.ensure_live()?;
        if start_revision > self.revision {
            return self.fail(SyncError::RevisionGap {
                expected: self.revision,
                received: start_revision,
            });
        }

        let mut reaction = Reaction::default();
        for (index, entry) in (start_revision..).zip(operations) {
            self.accept(entry.id, index, entry.operation, &mut reaction)?;
        }
        self.finish_catch_up(&mut reaction);
        Ok(reaction)
    }

    /// Full document state at `revision`.
    pub fn on_snapshot(&mut self, revision: u64, text: String) -> Result<Reaction, SyncError> {
        self.ensure_live()?;
        let mut reaction = Reaction::default();

        if revision == self.revision && text == self.document {
            self.finish_catch_up(&mut reaction);
            return Ok(reaction);
        }
        if revision < self.revision {
            return self.fail(SyncError::RevisionRegressed {
                local: self.revision,
                received: revision,
            });
        }
        if revision == self.revision && self.synced_once {
            return self.fail(SyncError::Diverged(revision));
        }

        if self.outstanding.is_some() || self.buffer.is_some() {
            log::warn!(
                "Dropping unacknowledged local edits to adopt snapshot at revision {revision}"
            );
            reaction.dropped_local = true;
        }
        reaction.apply.push(Operation::replace_all(self.local_len(), &text));
        self.outstanding = None;
        self.buffer = None;
        self.document = text;
        self.revision = revision;
        self.finish_catch_up(&mut reaction);
        Ok(reaction)
    }

    fn finish_catch_up(&mut self, reaction: &mut Reaction) {
        if self.state == SyncState::AwaitingSnapshot {
            self.state = SyncState::Synchronized;
            self.synced_once = true;
            log::debug!("Synchronized at revision {}", self.revision);
        }
        self.flush_outstanding(reaction);
    }
}
