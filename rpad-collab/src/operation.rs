//! Plain-text operations for operational transform.
//!
//! An [`Operation`] walks the source text from start to end as a sequence of
//! segments:
//!
//! ```text
//!   source:  h e l l o ␣ w o r l d
//!            └─ retain 6 ┘└del 5─┘
//!   insert:              "there"
//!   result:  h e l l o ␣ t h e r e
//! ```
//!
//! All lengths and offsets are counted in UTF-16 code units, the unit used by
//! the editor widgets on the other end of the wire. Retain and delete
//! segments must consume the source exactly; a length mismatch is how a
//! diverged replica is detected.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems"

use std::cmp::Ordering;
use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when an operation does not fit the text or operation it is
/// combined with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("operation expects a base length of {expected}, text has {actual}")]
    OperationMismatch { expected: usize, actual: usize },
    #[error("cannot compose: first target length {first} != second base length {second}")]
    ComposeMismatch { first: usize, second: usize },
    #[error("cannot transform: base lengths {left} and {right} differ")]
    TransformMismatch { left: usize, right: usize },
    #[error("offset {0} splits a surrogate pair")]
    SplitSurrogate(usize),
    #[error("change at {offset}..{end} is outside a document of length {len}")]
    ChangeOutOfBounds { offset: usize, end: usize, len: usize },
}

/// A single step of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Keep the next `n` code units.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next `n` code units.
    Delete(usize),
}

/// Length of `text` in UTF-16 code units.
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Split `text` after `units` UTF-16 code units.
fn split_utf16(text: &str, units: usize) -> Result<(&str, &str), OperationError> {
    let mut seen = 0;
    for (byte, ch) in text.char_indices() {
        if seen == units {
            return Ok(text.split_at(byte));
        }
        if seen > units {
            return Err(OperationError::SplitSurrogate(units));
        }
        seen += ch.len_utf16();
    }
    match seen.cmp(&units) {
        Ordering::Equal => Ok((text, "")),
        _ => Err(OperationError::SplitSurrogate(units)),
    }
}

/// An edit of a plain-text document.
///
/// Built with the chaining constructors, which keep segments in canonical
/// form: adjacent segments of the same kind are merged and an insert always
/// precedes a neighbouring delete. Two operations with the same effect
/// therefore compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Operation {
    segments: Vec<Segment>,
    base_len: usize,
    target_len: usize,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `len` units of the whole document unchanged.
    pub fn identity(len: usize) -> Self {
        Self::new().retain(len)
    }

    /// Replace a document of `old_len` units with `text`.
    pub fn replace_all(old_len: usize, text: &str) -> Self {
        Self::new().delete(old_len).insert(text)
    }

    pub fn retain(mut self, n: usize) -> Self {
        self.push_retain(n);
        self
    }

    pub fn insert(mut self, text: &str) -> Self {
        self.push_insert(text);
        self
    }

    pub fn delete(mut self, n: usize) -> Self {
        self.push_delete(n);
        self
    }

    /// Length of the text this operation applies to.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the text this operation produces.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True if applying the operation leaves every text unchanged.
    pub fn is_noop(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Retain(_)))
    }

    fn push_retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Segment::Retain(last)) = self.segments.last_mut() {
            *last += n;
        } else {
            self.segments.push(Segment::Retain(n));
        }
    }

    fn push_insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.target_len += utf16_len(text);
        match self.segments.as_mut_slice() {
            [.., Segment::Insert(last)] | [.., Segment::Insert(last), Segment::Delete(_)] => {
                last.push_str(text);
                return;
            }
            _ => {}
        }
        let segment = Segment::Insert(text.to_owned());
        match self.segments.last() {
            Some(Segment::Delete(_)) => {
                let at = self.segments.len() - 1;
                self.segments.insert(at, segment);
            }
            _ => self.segments.push(segment),
        }
    }

    fn push_delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(Segment::Delete(last)) = self.segments.last_mut() {
            *last += n;
        } else {
            self.segments.push(Segment::Delete(n));
        }
    }

    /// Apply the operation to `text`.
    pub fn apply(&self, text: &str) -> Result<String, OperationError> {
        let actual = utf16_len(text);
        if actual != self.base_len {
            return Err(OperationError::OperationMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut offset = 0;
        for segment in &self.segments {
            match segment {
                Segment::Retain(n) => {
                    let (kept, tail) = split_utf16(rest, *n)
                        .map_err(|_| OperationError::SplitSurrogate(offset + n))?;
                    out.push_str(kept);
                    rest = tail;
                    offset += n;
                }
                Segment::Insert(s) => out.push_str(s),
                Segment::Delete(n) => {
                    let (_, tail) = split_utf16(rest, *n)
                        .map_err(|_| OperationError::SplitSurrogate(offset + n))?;
                    rest = tail;
                    offset += n;
                }
            }
        }
        Ok(out)
    }

    /// Merge `self` followed by `next` into one equivalent operation.
    pub fn compose(&self, next: &Operation) -> Result<Operation, OperationError> {
        if self.target_len != next.base_len {
            return Err(OperationError::ComposeMismatch {
                first: self.target_len,
                second: next.base_len,
            });
        }

        let mut out = Operation::new();
        let mut first = self.segments.iter().cloned();
        let mut second = next.segments.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Segment::Delete(n)), rest) => {
                    out.push_delete(n);
                    a = first.next();
                    b = rest;
                }
                (rest, Some(Segment::Insert(s))) => {
                    out.push_insert(&s);
                    a = rest;
                    b = second.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OperationError::ComposeMismatch {
                        first: self.target_len,
                        second: next.base_len,
                    });
                }
                (Some(Segment::Retain(n)), Some(Segment::Retain(m))) => {
                    out.push_retain(n.min(m));
                    (a, b) = match n.cmp(&m) {
                        Ordering::Less => (first.next(), Some(Segment::Retain(m - n))),
                        Ordering::Equal => (first.next(), second.next()),
                        Ordering::Greater => (Some(Segment::Retain(n - m)), second.next()),
                    };
                }
                (Some(Segment::Insert(s)), Some(Segment::Delete(m))) => {
                    let len = utf16_len(&s);
                    (a, b) = match len.cmp(&m) {
                        Ordering::Less => (first.next(), Some(Segment::Delete(m - len))),
                        Ordering::Equal => (first.next(), second.next()),
                        Ordering::Greater => {
                            let (_, tail) = split_utf16(&s, m)?;
                            (Some(Segment::Insert(tail.to_owned())), second.next())
                        }
                    };
                }
                (Some(Segment::Insert(s)), Some(Segment::Retain(m))) => {
                    let len = utf16_len(&s);
                    (a, b) = match len.cmp(&m) {
                        Ordering::Less => {
                            out.push_insert(&s);
                            (first.next(), Some(Segment::Retain(m - len)))
                        }
                        Ordering::Equal => {
                            out.push_insert(&s);
                            (first.next(), second.next())
                        }
                        Ordering::Greater => {
                            let (head, tail) = split_utf16(&s, m)?;
                            out.push_insert(head);
                            (Some(Segment::Insert(tail.to_owned())), second.next())
                        }
                    };
                }
                (Some(Segment::Retain(n)), Some(Segment::Delete(m))) => {
                    out.push_delete(n.min(m));
                    (a, b) = match n.cmp(&m) {
                        Ordering::Less => (first.next(), Some(Segment::Delete(m - n))),
                        Ordering::Equal => (first.next(), second.next()),
                        Ordering::Greater => (Some(Segment::Retain(n - m)), second.next()),
                    };
                }
            }
        }

        Ok(out)
    }

    /// Rebase two concurrent operations over each other.
    ///
    /// Returns `(a', b')` such that applying `a'` after `other` yields the
    /// same text as applying `b'` after `self`. When both insert at the same
    /// offset, the insert of `self` is placed first.
    pub fn transform(&self, other: &Operation) -> Result<(Operation, Operation), OperationError> {
        if self.base_len != other.base_len {
            return Err(OperationError::TransformMismatch {
                left: self.base_len,
                right: other.base_len,
            });
        }

        let mut left = Operation::new();
        let mut right = Operation::new();
        let mut first = self.segments.iter().cloned();
        let mut second = other.segments.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Segment::Insert(s)), rest) => {
                    right.push_retain(utf16_len(&s));
                    left.push_insert(&s);
                    a = first.next();
                    b = rest;
                }
                (rest, Some(Segment::Insert(s))) => {
                    left.push_retain(utf16_len(&s));
                    right.push_insert(&s);
                    a = rest;
                    b = second.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OperationError::TransformMismatch {
                        left: self.base_len,
                        right: other.base_len,
                    });
                }
                (Some(Segment::Retain(n)), Some(Segment::Retain(m))) => {
                    left.push_retain(n.min(m));
                    right.push_retain(n.min(m));
                    (a, b) = step(n, m, Segment::Retain, Segment::Retain, &mut first, &mut second);
                }
                (Some(Segment::Delete(n)), Some(Segment::Delete(m))) => {
                    (a, b) = step(n, m, Segment::Delete, Segment::Delete, &mut first, &mut second);
                }
                (Some(Segment::Delete(n)), Some(Segment::Retain(m))) => {
                    left.push_delete(n.min(m));
                    (a, b) = step(n, m, Segment::Delete, Segment::Retain, &mut first, &mut second);
                }
                (Some(Segment::Retain(n)), Some(Segment::Delete(m))) => {
                    right.push_delete(n.min(m));
                    (a, b) = step(n, m, Segment::Retain, Segment::Delete, &mut first, &mut second);
                }
            }
        }

        Ok((left, right))
    }

    /// Map a position in the source text to the matching position in the
    /// result. Inserts exactly at the position move it to the right.
    pub fn transform_index(&self, position: usize) -> usize {
        let mut index = position as isize;
        let mut new_index = index;
        for segment in &self.segments {
            match segment {
                Segment::Retain(n) => index -= *n as isize,
                Segment::Insert(s) => new_index += utf16_len(s) as isize,
                Segment::Delete(n) => {
                    new_index -= index.min(*n as isize);
                    index -= *n as isize;
                }
            }
            if index < 0 {
                break;
            }
        }
        new_index.max(0) as usize
    }

    /// Build one operation from widget change events.
    ///
    /// Every change is expressed against the text *before* any of them were
    /// made (`base_len` units long) and changes must not overlap.
    pub fn from_changes(base_len: usize, changes: &[TextChange]) -> Result<Operation, OperationError> {
        let mut sorted: Vec<&TextChange> = changes.iter().collect();
        sorted.sort_by(|a, b| b.offset.cmp(&a.offset));

        let mut op = Operation::identity(base_len);
        for change in sorted {
            let len = op.target_len();
            let end = change.offset + change.removed;
            if end > len {
                return Err(OperationError::ChangeOutOfBounds {
                    offset: change.offset,
                    end,
                    len,
                });
            }
            let step = Operation::new()
                .retain(change.offset)
                .delete(change.removed)
                .insert(&change.inserted)
                .retain(len - end);
            op = op.compose(&step)?;
        }
        Ok(op)
    }
}

/// Advance two segment streams past `min(n, m)` units, keeping the remainder
/// of the longer segment.
fn step<I, J>(
    n: usize,
    m: usize,
    left: fn(usize) -> Segment,
    right: fn(usize) -> Segment,
    first: &mut I,
    second: &mut J,
) -> (Option<Segment>, Option<Segment>)
where
    I: Iterator<Item = Segment>,
    J: Iterator<Item = Segment>,
{
    match n.cmp(&m) {
        Ordering::Less => (first.next(), Some(right(m - n))),
        Ordering::Equal => (first.next(), second.next()),
        Ordering::Greater => (Some(left(n - m)), second.next()),
    }
}

/// A single edit reported by a text widget: `removed` units at `offset` were
/// replaced with `inserted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub offset: usize,
    pub removed: usize,
    pub inserted: String,
}

impl TextChange {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed: 0,
            inserted: text.into(),
        }
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self {
            offset,
            removed: len,
            inserted: String::new(),
        }
    }

    pub fn replace(offset: usize, removed: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed,
            inserted: text.into(),
        }
    }
}

// Wire form: `[5, "abc", -2]` = retain 5, insert "abc", delete 2.

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.segments.len()))?;
        for segment in &self.segments {
            match segment {
                Segment::Retain(n) => seq.serialize_element(&(*n as i64))?,
                Segment::Insert(s) => seq.serialize_element(s)?,
                Segment::Delete(n) => seq.serialize_element(&-(*n as i64))?,
            }
        }
        seq.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSegment {
    Count(i64),
    Text(String),
}

struct OperationVisitor;

impl<'de> Visitor<'de> for OperationVisitor {
    type Value = Operation;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of non-zero integers and strings")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Operation, A::Error> {
        let mut op = Operation::new();
        while let Some(raw) = seq.next_element::<RawSegment>()? {
            let (consumed, produced) = match &raw {
                RawSegment::Count(0) => {
                    return Err(de::Error::custom("zero-length segment"));
                }
                RawSegment::Count(n) if *n > 0 => (*n as u64, *n as u64),
                RawSegment::Count(n) => (n.unsigned_abs(), 0),
                RawSegment::Text(s) => (0, utf16_len(s) as u64),
            };
            let base_len = usize::try_from(consumed)
                .ok()
                .and_then(|n| op.base_len.checked_add(n));
            let target_len = usize::try_from(produced)
                .ok()
                .and_then(|n| op.target_len.checked_add(n));
            if base_len.is_none() || target_len.is_none() {
                return Err(de::Error::custom("operation length overflows"));
            }

            match raw {
                RawSegment::Count(n) if n > 0 => op.push_retain(n as usize),
                RawSegment::Count(n) => op.push_delete(n.unsigned_abs() as usize),
                RawSegment::Text(s) => op.push_insert(&s),
            }
        }
        Ok(op)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(OperationVisitor)
    }
}
