//! Plain-text operation set.
//!
//! Member bookkeeping plus character-indexed text edits over a
//! [`TextDocument`], together with the transformation rules between them.
//! Positions and lengths count Unicode scalar values, not bytes.

use crate::{
    pass_unchanged, MemberId, Operation, OperationFactory, OperationSpec, OperationTransformer,
    PairTransform, Playback, PlaybackError, Timestamp, TransformMatrix,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const ADD_MEMBER: &str = "AddMember";
pub const REMOVE_MEMBER: &str = "RemoveMember";
pub const INSERT_TEXT: &str = "InsertText";
pub const REMOVE_TEXT: &str = "RemoveText";

/// Display properties attached to a joining member.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberProperties {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub image_url: String,
}

/// A text document operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "optype")]
pub enum TextOperation {
    AddMember {
        #[serde(rename = "memberid")]
        member_id: MemberId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
        #[serde(rename = "setProperties", default)]
        properties: MemberProperties,
    },
    RemoveMember {
        #[serde(rename = "memberid")]
        member_id: MemberId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    InsertText {
        #[serde(rename = "memberid")]
        member_id: MemberId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
        position: usize,
        text: String,
    },
    RemoveText {
        #[serde(rename = "memberid")]
        member_id: MemberId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
        position: usize,
        length: usize,
    },
}

impl TextOperation {
    pub fn insert_text(
        member_id: impl Into<MemberId>,
        position: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::InsertText {
            member_id: member_id.into(),
            timestamp: None,
            position,
            text: text.into(),
        }
    }

    pub fn remove_text(member_id: impl Into<MemberId>, position: usize, length: usize) -> Self {
        Self::RemoveText {
            member_id: member_id.into(),
            timestamp: None,
            position,
            length,
        }
    }

    pub fn optype(&self) -> &'static str {
        match self {
            Self::AddMember { .. } => ADD_MEMBER,
            Self::RemoveMember { .. } => REMOVE_MEMBER,
            Self::InsertText { .. } => INSERT_TEXT,
            Self::RemoveText { .. } => REMOVE_TEXT,
        }
    }
}

impl Operation for TextOperation {
    fn spec(&self) -> OperationSpec {
        serde_json::to_value(self)
            .ok()
            .and_then(OperationSpec::from_value)
            .unwrap_or_default()
    }

    fn is_edit(&self) -> bool {
        matches!(self, Self::InsertText { .. } | Self::RemoveText { .. })
    }
}

/// Decodes [`TextOperation`]s from specs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOperationFactory;

impl OperationFactory for TextOperationFactory {
    type Op = TextOperation;

    fn create(&self, spec: &OperationSpec) -> Option<TextOperation> {
        serde_json::from_value(spec.clone().into_value()).ok()
    }
}

/// In-memory document the text operations apply to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDocument {
    text: String,
    members: BTreeSet<MemberId>,
}

impl TextDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            members: BTreeSet::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn members(&self) -> &BTreeSet<MemberId> {
        &self.members
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn apply(&mut self, op: &TextOperation) -> Result<(), PlaybackError> {
        let fail = |reason: String| PlaybackError::new(op.optype(), reason);

        match op {
            TextOperation::AddMember { member_id, .. } => {
                if !self.members.insert(member_id.clone()) {
                    return Err(fail(format!("member {member_id} already exists")));
                }
            }
            TextOperation::RemoveMember { member_id, .. } => {
                if !self.members.remove(member_id) {
                    return Err(fail(format!("member {member_id} does not exist")));
                }
            }
            TextOperation::InsertText { position, text, .. } => {
                let at = self
                    .byte_offset(*position)
                    .ok_or_else(|| fail(format!("position {position} out of bounds")))?;
                self.text.insert_str(at, text);
            }
            TextOperation::RemoveText {
                position, length, ..
            } => {
                let range = position
                    .checked_add(*length)
                    .and_then(|end| Some(self.byte_offset(*position)?..self.byte_offset(end)?))
                    .ok_or_else(|| fail(format!("range {position}+{length} out of bounds")))?;
                self.text.replace_range(range, "");
            }
        }
        Ok(())
    }

    fn byte_offset(&self, position: usize) -> Option<usize> {
        self.text
            .char_indices()
            .map(|(offset, _)| offset)
            .chain(std::iter::once(self.text.len()))
            .nth(position)
    }

    /// The document content as bytes, for persisting.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }
}

impl Playback<TextOperation> for TextDocument {
    fn play(&mut self, op: &TextOperation) -> Result<(), PlaybackError> {
        self.apply(op)
    }
}

fn text_len(spec: &OperationSpec) -> Option<usize> {
    spec.get_str("text").map(|text| text.chars().count())
}

fn insert_text_insert_text(
    mut insert_a: OperationSpec,
    mut insert_b: OperationSpec,
    a_has_priority: bool,
) -> Option<PairTransform> {
    let position_a = insert_a.get_usize("position")?;
    let position_b = insert_b.get_usize("position")?;

    if position_a < position_b || (position_a == position_b && a_has_priority) {
        insert_b.insert("position", position_b.checked_add(text_len(&insert_a)?)?);
    } else {
        insert_a.insert("position", position_a.checked_add(text_len(&insert_b)?)?);
    }
    Some(PairTransform::unchanged(insert_a, insert_b))
}

fn insert_text_remove_text(
    mut insert: OperationSpec,
    mut remove: OperationSpec,
    _insert_has_priority: bool,
) -> Option<PairTransform> {
    let insert_position = insert.get_usize("position")?;
    let inserted = text_len(&insert)?;
    let remove_position = remove.get_usize("position")?;
    let remove_length = remove.get_usize("length")?;
    // Ranges past the addressable end cannot be transformed.
    let remove_end = remove_position.checked_add(remove_length)?;

    if remove_end <= insert_position {
        insert.insert("position", insert_position - remove_length);
        return Some(PairTransform::unchanged(insert, remove));
    }
    if insert_position <= remove_position {
        remove.insert("position", remove_position.checked_add(inserted)?);
        return Some(PairTransform::unchanged(insert, remove));
    }

    // Insertion inside the removed range: remove around it in two steps.
    // The tail goes first so the head keeps its position.
    let mut tail = remove.clone();
    tail.insert("position", insert_position.checked_add(inserted)?);
    tail.insert("length", remove_end - insert_position);
    remove.insert("length", insert_position - remove_position);
    insert.insert("position", remove_position);

    Some(PairTransform::new(vec![insert], vec![tail, remove]))
}

fn remove_text_remove_text(
    mut remove_a: OperationSpec,
    mut remove_b: OperationSpec,
    _a_has_priority: bool,
) -> Option<PairTransform> {
    let position_a = remove_a.get_usize("position")?;
    let length_a = remove_a.get_usize("length")?;
    let position_b = remove_b.get_usize("position")?;
    let length_b = remove_b.get_usize("length")?;
    let end_a = position_a.checked_add(length_a)?;
    let end_b = position_b.checked_add(length_b)?;

    if end_b <= position_a {
        remove_a.insert("position", position_a - length_b);
        return Some(PairTransform::unchanged(remove_a, remove_b));
    }
    if end_a <= position_b {
        remove_b.insert("position", position_b - length_a);
        return Some(PairTransform::unchanged(remove_a, remove_b));
    }

    // Overlapping: each side keeps only what the other did not remove.
    let keep_a = trim_overlap(position_a, end_a, position_b, end_b);
    let keep_b = trim_overlap(position_b, end_b, position_a, end_a);

    let mut specs_a = Vec::new();
    if let Some((position, length)) = keep_a {
        remove_a.insert("position", position);
        remove_a.insert("length", length);
        specs_a.push(remove_a);
    }
    let mut specs_b = Vec::new();
    if let Some((position, length)) = keep_b {
        remove_b.insert("position", position);
        remove_b.insert("length", length);
        specs_b.push(remove_b);
    }
    Some(PairTransform::new(specs_a, specs_b))
}

/// What remains of removal `[start, end)` once the overlapping removal
/// `[other_start, other_end)` has been applied, as `(position, length)`.
fn trim_overlap(
    start: usize,
    end: usize,
    other_start: usize,
    other_end: usize,
) -> Option<(usize, usize)> {
    let before = other_start.saturating_sub(start).min(end - start);
    let after = end.saturating_sub(other_end).min(end - start);
    let length = before + after;
    (length > 0).then(|| (start.min(other_start), length))
}

/// Transformation rules for all pairs of text operations.
///
/// Member operations only originate on the server, so pairs between them
/// have no rule.
pub fn transform_matrix() -> TransformMatrix {
    TransformMatrix::new()
        .with_rule(ADD_MEMBER, INSERT_TEXT, pass_unchanged)
        .with_rule(ADD_MEMBER, REMOVE_TEXT, pass_unchanged)
        .with_rule(INSERT_TEXT, REMOVE_MEMBER, pass_unchanged)
        .with_rule(REMOVE_MEMBER, REMOVE_TEXT, pass_unchanged)
        .with_rule(INSERT_TEXT, INSERT_TEXT, insert_text_insert_text)
        .with_rule(INSERT_TEXT, REMOVE_TEXT, insert_text_remove_text)
        .with_rule(REMOVE_TEXT, REMOVE_TEXT, remove_text_remove_text)
}

/// A transformer loaded with [`transform_matrix`].
pub fn transformer() -> OperationTransformer {
    OperationTransformer::new(transform_matrix())
}

/// Deterministic display color for a member.
pub fn member_color(member_id: &str) -> String {
    // FNV-1a
    let hash = member_id
        .bytes()
        .fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
        });
    format!("#{:06x}", hash & 0x00ff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply_specs(doc: &mut TextDocument, specs: &[OperationSpec]) {
        for spec in specs {
            let op = TextOperationFactory
                .create(spec)
                .unwrap_or_else(|| panic!("not a text op: {spec:?}"));
            doc.apply(&op).unwrap();
        }
    }

    fn spec(op: TextOperation) -> OperationSpec {
        op.spec()
    }

    /// Applies A then B' and B then A', returning both texts.
    fn converge(base: &str, a: Vec<TextOperation>, b: Vec<TextOperation>) -> (String, String) {
        let a: Vec<_> = a.into_iter().map(spec).collect();
        let b: Vec<_> = b.into_iter().map(spec).collect();
        let result = transformer().transform(&a, &b).unwrap();

        let mut left = TextDocument::new(base);
        apply_specs(&mut left, &a);
        apply_specs(&mut left, &result.specs_b);

        let mut right = TextDocument::new(base);
        apply_specs(&mut right, &b);
        apply_specs(&mut right, &result.specs_a);

        (left.text, right.text)
    }

    // ========================================================================
    // Document
    // ========================================================================

    #[test]
    fn insert_and_remove_text() {
        let mut doc = TextDocument::new("hello");
        doc.apply(&TextOperation::insert_text("a", 5, " world")).unwrap();
        assert_eq!(doc.text(), "hello world");

        doc.apply(&TextOperation::remove_text("a", 0, 6)).unwrap();
        assert_eq!(doc.text(), "world");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn positions_count_characters() {
        let mut doc = TextDocument::new("héllo");
        doc.apply(&TextOperation::insert_text("a", 2, "→")).unwrap();
        assert_eq!(doc.text(), "hé→llo");

        doc.apply(&TextOperation::remove_text("a", 1, 2)).unwrap();
        assert_eq!(doc.text(), "hllo");
    }

    #[test]
    fn out_of_bounds_edits_fail() {
        let mut doc = TextDocument::new("abc");
        let err = doc
            .apply(&TextOperation::insert_text("a", 4, "x"))
            .unwrap_err();
        assert_eq!(err.optype, INSERT_TEXT);
        assert!(doc.apply(&TextOperation::remove_text("a", 2, 2)).is_err());
        assert!(doc.apply(&TextOperation::remove_text("a", usize::MAX, 2)).is_err());
        assert_eq!(doc.text(), "abc");
    }

    #[test]
    fn members_join_and_leave() {
        let mut doc = TextDocument::default();
        let add = TextOperation::AddMember {
            member_id: "bob".into(),
            timestamp: None,
            properties: MemberProperties::default(),
        };
        doc.apply(&add).unwrap();
        assert!(doc.members().contains("bob"));
        assert!(doc.apply(&add).is_err());

        let remove = TextOperation::RemoveMember {
            member_id: "bob".into(),
            timestamp: None,
        };
        doc.apply(&remove).unwrap();
        assert!(doc.members().is_empty());
        assert!(doc.apply(&remove).is_err());
    }

    // ========================================================================
    // Factory
    // ========================================================================

    #[test]
    fn spec_round_trips_through_factory() {
        let op = TextOperation::InsertText {
            member_id: "alice".into(),
            timestamp: Some(1000),
            position: 3,
            text: "abc".into(),
        };
        let spec = op.spec();
        assert_eq!(
            spec.clone().into_value(),
            json!({"optype": "InsertText", "memberid": "alice", "timestamp": 1000, "position": 3, "text": "abc"})
        );
        assert_eq!(TextOperationFactory.create(&spec), Some(op));
    }

    #[test]
    fn factory_reads_server_member_records() {
        let spec = OperationSpec::new(ADD_MEMBER, "bob").with(
            "setProperties",
            json!({"fullName": "bob", "color": "#123456", "imageUrl": ""}),
        );
        let op = TextOperationFactory.create(&spec).unwrap();
        assert!(!op.is_edit());
        match op {
            TextOperation::AddMember { properties, .. } => assert_eq!(properties.color, "#123456"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn factory_rejects_unknown_and_invalid_specs() {
        let factory = TextOperationFactory;
        assert!(factory.create(&OperationSpec::new("SetParagraphStyle", "a")).is_none());
        assert!(factory.create(&OperationSpec::new(INSERT_TEXT, "a")).is_none());
        assert!(factory
            .create(&OperationSpec::new(REMOVE_TEXT, "a").with("position", -1).with("length", 1))
            .is_none());
    }

    #[test]
    fn member_color_is_stable() {
        assert_eq!(member_color("alice"), member_color("alice"));
        assert_eq!(member_color("alice").len(), 7);
        assert_ne!(member_color("alice"), member_color("bob"));
    }

    // ========================================================================
    // Transformation
    // ========================================================================

    #[test]
    fn concurrent_inserts_at_same_position_favour_second_sequence() {
        let (left, right) = converge(
            "ab",
            vec![TextOperation::insert_text("a", 1, "X")],
            vec![TextOperation::insert_text("b", 1, "Y")],
        );
        assert_eq!(left, "aYXb");
        assert_eq!(left, right);
    }

    #[test]
    fn insert_inside_removed_range_survives() {
        let (left, right) = converge(
            "abcdef",
            vec![TextOperation::insert_text("a", 3, "XY")],
            vec![TextOperation::remove_text("b", 1, 4)],
        );
        assert_eq!(left, "aXYf");
        assert_eq!(left, right);
    }

    #[test]
    fn removal_split_by_insert_is_carried_through_later_ops() {
        let (left, right) = converge(
            "abcdefgh",
            vec![
                TextOperation::insert_text("a", 3, "XY"),
                TextOperation::insert_text("a", 9, "Z"),
            ],
            vec![TextOperation::remove_text("b", 1, 5)],
        );
        assert_eq!(left, right);
        assert_eq!(left, "aXYgZh");
    }

    #[test]
    fn nested_removals_collapse() {
        let (left, right) = converge(
            "abcdefg",
            vec![TextOperation::remove_text("a", 0, 5)],
            vec![TextOperation::remove_text("b", 1, 2)],
        );
        assert_eq!(left, "fg");
        assert_eq!(left, right);
    }

    #[test]
    fn identical_removals_cancel_out() {
        let a = vec![spec(TextOperation::remove_text("a", 1, 2))];
        let b = vec![spec(TextOperation::remove_text("b", 1, 2))];
        let result = transformer().transform(&a, &b).unwrap();
        assert!(result.specs_a.is_empty());
        assert!(result.specs_b.is_empty());
    }

    #[test]
    fn member_ops_pass_text_edits_unchanged() {
        let a = vec![spec(TextOperation::insert_text("a", 0, "x"))];
        let b = vec![OperationSpec::new(ADD_MEMBER, "c")];
        let result = transformer().transform(&a, &b).unwrap();
        assert_eq!(result.specs_a, a);
        assert_eq!(result.specs_b, b);
    }

    #[test]
    fn unknown_op_type_is_unresolvable() {
        let a = vec![spec(TextOperation::insert_text("a", 0, "x"))];
        let b = vec![OperationSpec::new("SetParagraphStyle", "b")];
        let err = transformer().transform(&a, &b).unwrap_err();
        assert_eq!(err.optype_a, INSERT_TEXT);
        assert_eq!(err.optype_b, "SetParagraphStyle");
    }

    #[test]
    fn overflowing_ranges_are_unresolvable() {
        let huge = vec![spec(TextOperation::remove_text("b", 2, usize::MAX))];

        let insert = vec![spec(TextOperation::insert_text("a", 3, "x"))];
        let err = transformer().transform(&insert, &huge).unwrap_err();
        assert_eq!(err.optype_b, REMOVE_TEXT);

        let remove = vec![spec(TextOperation::remove_text("a", 0, 1))];
        assert!(transformer().transform(&remove, &huge).is_err());
        assert!(transformer().transform(&huge, &remove).is_err());

        let far = vec![spec(TextOperation::insert_text("a", usize::MAX, "x"))];
        let near = vec![spec(TextOperation::insert_text("b", 0, "y"))];
        assert!(transformer().transform(&near, &far).is_err());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        /// Raw material for one edit, made valid against the running document.
        type RawEdit = (bool, usize, usize, String);

        fn arb_edits() -> impl Strategy<Value = Vec<RawEdit>> {
            prop::collection::vec(
                (any::<bool>(), 0usize..64, 0usize..64, "[a-z]{1,3}"),
                0..6,
            )
        }

        fn materialize(base: &str, member: &str, raw: Vec<RawEdit>) -> Vec<TextOperation> {
            let mut doc = TextDocument::new(base);
            let mut ops = Vec::new();
            for (insert, position_seed, length_seed, text) in raw {
                let len = doc.len();
                let op = if insert || len == 0 {
                    TextOperation::insert_text(member, position_seed % (len + 1), text)
                } else {
                    let position = position_seed % len;
                    TextOperation::remove_text(member, position, 1 + length_seed % (len - position))
                };
                doc.apply(&op).unwrap();
                ops.push(op);
            }
            ops
        }

        proptest! {
            #[test]
            fn prop_transform_converges(
                base in "[a-z]{0,12}",
                raw_a in arb_edits(),
                raw_b in arb_edits(),
            ) {
                let a = materialize(&base, "a", raw_a);
                let b = materialize(&base, "b", raw_b);
                let (left, right) = converge(&base, a, b);
                prop_assert_eq!(left, right);
            }

            #[test]
            fn prop_transform_is_deterministic(
                base in "[a-z]{0,12}",
                raw_a in arb_edits(),
                raw_b in arb_edits(),
            ) {
                let a: Vec<_> = materialize(&base, "a", raw_a).into_iter().map(spec).collect();
                let b: Vec<_> = materialize(&base, "b", raw_b).into_iter().map(spec).collect();
                let first = transformer().transform(&a, &b).unwrap();
                let second = transformer().transform(&a, &b).unwrap();
                prop_assert_eq!(first, second);
            }
        }
    }
}
