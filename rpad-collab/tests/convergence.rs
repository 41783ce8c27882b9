//! Property tests for the operation algebra.

use proptest::prelude::*;
use rpad_collab::operation::{utf16_len, Operation, TextChange};

/// One step of an edit plan: 0 = retain, 1 = delete, 2 = insert.
type Plan = Vec<(u8, usize, String)>;

fn arb_document() -> impl Strategy<Value = String> {
    "[a-z é😀\n]{0,40}"
}

fn arb_plan() -> impl Strategy<Value = Plan> {
    prop::collection::vec((0u8..3, 1usize..6, "[A-Z😺]{1,3}"), 0..10)
}

fn units(chars: &[char]) -> usize {
    chars.iter().map(|c| c.len_utf16()).sum()
}

/// Walk `doc` character by character following `plan`; whatever is left
/// at the end is retained.
fn build_op(doc: &str, plan: &Plan) -> Operation {
    let chars: Vec<char> = doc.chars().collect();
    let mut pos = 0;
    let mut op = Operation::new();
    for (kind, n, text) in plan {
        let end = (pos + n).min(chars.len());
        match kind {
            0 => op = op.retain(units(&chars[pos..end])),
            1 => op = op.delete(units(&chars[pos..end])),
            _ => {
                op = op.insert(text);
                continue;
            }
        }
        pos = end;
    }
    op.retain(units(&chars[pos..]))
}

/// The same plan expressed as widget changes against the unedited text.
fn build_changes(doc: &str, plan: &Plan) -> Vec<TextChange> {
    let chars: Vec<char> = doc.chars().collect();
    let mut pos = 0;
    let mut offset = 0;
    let mut pending: Option<TextChange> = None;
    let mut changes = Vec::new();
    for (kind, n, text) in plan {
        let end = (pos + n).min(chars.len());
        let len = units(&chars[pos..end]);
        match kind {
            0 if len == 0 => {}
            0 => {
                changes.extend(pending.take());
                offset += len;
            }
            1 => {
                pending.get_or_insert_with(|| TextChange::insert(offset, "")).removed += len;
                offset += len;
            }
            _ => {
                pending.get_or_insert_with(|| TextChange::insert(offset, "")).inserted += text;
                continue;
            }
        }
        pos = end;
    }
    changes.extend(pending);
    changes
}

proptest! {
    #[test]
    fn prop_apply_matches_target_len(doc in arb_document(), plan in arb_plan()) {
        let op = build_op(&doc, &plan);
        prop_assert_eq!(op.base_len(), utf16_len(&doc));
        let result = op.apply(&doc).unwrap();
        prop_assert_eq!(op.target_len(), utf16_len(&result));
    }

    #[test]
    fn prop_compose_equals_sequential_apply(
        doc in arb_document(),
        first in arb_plan(),
        second in arb_plan(),
    ) {
        let a = build_op(&doc, &first);
        let after_a = a.apply(&doc).unwrap();
        let b = build_op(&after_a, &second);
        let sequential = b.apply(&after_a).unwrap();

        let composed = a.compose(&b).unwrap();
        prop_assert_eq!(composed.apply(&doc).unwrap(), sequential);
    }

    #[test]
    fn prop_transform_converges(doc in arb_document(), left in arb_plan(), right in arb_plan()) {
        let a = build_op(&doc, &left);
        let b = build_op(&doc, &right);
        let (a_prime, b_prime) = a.transform(&b).unwrap();

        let via_a = b_prime.apply(&a.apply(&doc).unwrap()).unwrap();
        let via_b = a_prime.apply(&b.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(via_a, via_b);
    }

    #[test]
    fn prop_transform_index_in_bounds(doc in arb_document(), plan in arb_plan(), at in 0usize..80) {
        let op = build_op(&doc, &plan);
        let position = at.min(op.base_len());
        prop_assert!(op.transform_index(position) <= op.target_len());
    }

    #[test]
    fn prop_from_changes_matches_walk(doc in arb_document(), plan in arb_plan()) {
        let expected = build_op(&doc, &plan).apply(&doc).unwrap();
        let changes = build_changes(&doc, &plan);
        let op = Operation::from_changes(utf16_len(&doc), &changes).unwrap();
        prop_assert_eq!(op.apply(&doc).unwrap(), expected);
    }
}

#[test]
fn test_concurrent_edits_scenario() {
    // Two replicas of "Xabc": one appends "Y", the other deletes "a".
    let doc = "Xabc";
    let append = Operation::new().retain(4).insert("Y");
    let delete = Operation::new().retain(1).delete(1).retain(2);
    let (append_prime, delete_prime) = append.transform(&delete).unwrap();
    assert_eq!(
        delete_prime.apply(&append.apply(doc).unwrap()).unwrap(),
        "XbcY"
    );
    assert_eq!(
        append_prime.apply(&delete.apply(doc).unwrap()).unwrap(),
        "XbcY"
    );
}
