//! Bridge between the session and an external text widget.
//!
//! ```text
//!  user typing ──► widget ──► ChangeReporter::report() ──► LocalChanges ──► Session
//!                    ▲                 │ (dropped while an ApplyGuard is held)
//!                    └── EditorAdapter::apply_remote() ◄── Session
//! ```
//!
//! Widgets usually fire their change notifications synchronously while a
//! programmatic edit is applied. Those notifications describe remote text and
//! must not be echoed back as local edits, so every `apply_remote` call runs
//! under an [`ApplyGuard`] and reports made in the meantime are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::operation::{utf16_len, Operation, OperationError, TextChange};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditorError {
    #[error("editor rejected operation: {0}")]
    Rejected(#[from] OperationError),
    #[error("editor is read-only")]
    ReadOnly,
}

/// The narrow interface the session needs from a text widget.
pub trait EditorAdapter {
    /// Current full text.
    fn text(&self) -> String;

    /// Programmatically apply a remote operation.
    fn apply_remote(&mut self, op: &Operation) -> Result<(), EditorError>;
}

/// A batch of widget changes, all relative to the text before the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    /// Length of the text before the changes, in UTF-16 units.
    pub base_len: usize,
    pub changes: Vec<TextChange>,
}

impl LocalChange {
    pub fn to_operation(&self) -> Result<Operation, OperationError> {
        Operation::from_changes(self.base_len, &self.changes)
    }
}

/// Create the local change stream shared by a widget and its session.
pub fn local_changes() -> (ChangeReporter, LocalChanges) {
    let applying = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChangeReporter {
            applying: applying.clone(),
            tx,
        },
        LocalChanges { applying, rx },
    )
}

/// Widget-side handle that forwards user edits to the session.
#[derive(Debug, Clone)]
pub struct ChangeReporter {
    applying: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<LocalChange>,
}

impl ChangeReporter {
    /// Report changes made to the widget.
    ///
    /// Returns `false` when the report was suppressed (a remote edit is being
    /// applied) or the session is gone.
    pub fn report(&self, base_len: usize, changes: Vec<TextChange>) -> bool {
        if self.applying.load(Ordering::Acquire) {
            return false;
        }
        if changes.is_empty() {
            return true;
        }
        self.tx.send(LocalChange { base_len, changes }).is_ok()
    }

    pub fn is_suppressed(&self) -> bool {
        self.applying.load(Ordering::Acquire)
    }
}

/// Session-side end of the local change stream.
#[derive(Debug)]
pub struct LocalChanges {
    applying: Arc<AtomicBool>,
    rx: mpsc::UnboundedReceiver<LocalChange>,
}

impl LocalChanges {
    /// Wait for the next local change. Pends forever once every reporter is
    /// dropped.
    pub async fn recv(&mut self) -> LocalChange {
        match self.rx.recv().await {
            Some(change) => change,
            None => std::future::pending().await,
        }
    }

    /// Take a change that is already queued.
    pub fn try_recv(&mut self) -> Option<LocalChange> {
        self.rx.try_recv().ok()
    }

    /// Suppress reports until the returned guard is dropped.
    pub fn suppress(&self) -> ApplyGuard {
        self.applying.store(true, Ordering::Release);
        ApplyGuard {
            applying: self.applying.clone(),
        }
    }
}

/// Scoped suppression token held around `apply_remote`.
#[derive(Debug)]
#[must_use = "reports are only suppressed while the guard is alive"]
pub struct ApplyGuard {
    applying: Arc<AtomicBool>,
}

impl Drop for ApplyGuard {
    fn drop(&mut self) {
        self.applying.store(false, Ordering::Release);
    }
}

/// In-memory editor for headless hosts and tests.
///
/// Behaves like a widget: user edits go through [`BufferEditor::edit`] and
/// are reported, and applying a remote operation fires a (suppressed)
/// change notification for the replaced text.
#[derive(Debug)]
pub struct BufferEditor {
    text: String,
    reporter: ChangeReporter,
}

impl BufferEditor {
    pub fn new(reporter: ChangeReporter) -> Self {
        Self {
            text: String::new(),
            reporter,
        }
    }

    pub fn len_utf16(&self) -> usize {
        utf16_len(&self.text)
    }

    /// A user edit: replace `removed` units at `offset` with `inserted`.
    pub fn edit(&mut self, offset: usize, removed: usize, inserted: &str) -> Result<(), EditorError> {
        let change = TextChange::replace(offset, removed, inserted);
        let base_len = self.len_utf16();
        let op = Operation::from_changes(base_len, std::slice::from_ref(&change))?;
        self.text = op.apply(&self.text)?;
        self.reporter.report(base_len, vec![change]);
        Ok(())
    }

    /// A user edit appending text at the end.
    pub fn append(&mut self, text: &str) -> Result<(), EditorError> {
        self.edit(self.len_utf16(), 0, text)
    }
}

impl EditorAdapter for BufferEditor {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn apply_remote(&mut self, op: &Operation) -> Result<(), EditorError> {
        let base_len = self.len_utf16();
        let text = op.apply(&self.text)?;
        let change = TextChange::replace(0, base_len, text.as_str());
        self.text = text;
        self.reporter.report(base_len, vec![change]);
        Ok(())
    }
}
