use crate::models::{Exam, Item, ItemEntry, SectionEntry};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Supplies item content for `{"ref": ...}` entries.
pub trait ItemResolver {
    fn resolve(&self, item_id: &str) -> Option<Item>;
}

impl ItemResolver for HashMap<String, Item> {
    fn resolve(&self, item_id: &str) -> Option<Item> {
        self.get(item_id).cloned()
    }
}

/// Resolver over a borrowed list of items, e.g. an exam's own item bank.
pub struct ItemBank<'a> {
    items: HashMap<&'a str, &'a Item>,
}

impl<'a> ItemBank<'a> {
    pub fn new(items: &'a [Item]) -> Self {
        Self {
            items: items.iter().map(|item| (item.id.as_str(), item)).collect(),
        }
    }
}

impl ItemResolver for ItemBank<'_> {
    fn resolve(&self, item_id: &str) -> Option<Item> {
        self.items.get(item_id).map(|item| (*item).clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionRef {
    pub id: String,
    pub kind: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemSlot {
    /// 0-based position among item slots only.
    pub ordinal: usize,
    pub section: SectionRef,
    pub item: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Emitted once per section kind, before its first section.
    Intro { section: SectionRef, first_ordinal: usize },
    Item(ItemSlot),
    End { item_count: usize },
}

impl Slot {
    pub fn as_item(&self) -> Option<&ItemSlot> {
        match self {
            Slot::Item(slot) => Some(slot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    MalformedSection,
    MalformedItem,
    EmptyItemId,
    UnresolvedReference { reference: String },
    DuplicateItemId { item_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedEntry {
    pub section_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub struct FlattenedExam {
    pub exam_id: String,
    pub title: String,
    pub time_limit_minutes: Option<u32>,
    pub slots: Vec<Slot>,
    /// Section kind -> position of its intro slot.
    pub intro_positions: HashMap<String, usize>,
    /// Section id -> passage content, for sections that carry one.
    pub passages: HashMap<String, Value>,
    pub item_count: usize,
    pub skipped: Vec<SkippedEntry>,
    item_positions: HashMap<String, usize>,
}

impl FlattenedExam {
    pub fn slot(&self, position: usize) -> Option<&Slot> {
        self.slots.get(position)
    }

    pub fn item_slots(&self) -> impl Iterator<Item = &ItemSlot> {
        self.slots.iter().filter_map(Slot::as_item)
    }

    pub fn position_of_item(&self, item_id: &str) -> Option<usize> {
        self.item_positions.get(item_id).copied()
    }

    pub fn item_slot(&self, item_id: &str) -> Option<&ItemSlot> {
        self.position_of_item(item_id)
            .and_then(|position| self.slots.get(position))
            .and_then(Slot::as_item)
    }

    pub fn section_of(&self, item_id: &str) -> Option<SectionRef> {
        self.item_slot(item_id).map(|slot| slot.section.clone())
    }

    pub fn passage(&self, section_id: &str) -> Option<&Value> {
        self.passages.get(section_id)
    }

    pub fn contains_item(&self, item_id: &str) -> bool {
        self.item_positions.contains_key(item_id)
    }

    pub fn end_position(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }
}

/// Flattens using the exam's own item bank to resolve references.
pub fn flatten_exam(exam: &Exam) -> FlattenedExam {
    let bank = ItemBank::new(&exam.item_bank);
    flatten_with(exam, &bank)
}

pub fn flatten_with(exam: &Exam, resolver: &dyn ItemResolver) -> FlattenedExam {
    let mut slots = Vec::new();
    let mut intro_positions = HashMap::new();
    let mut passages = HashMap::new();
    let mut item_positions = HashMap::new();
    let mut seen_kinds = HashSet::new();
    let mut skipped = Vec::new();
    let mut ordinal = 0usize;

    for (section_index, entry) in exam.sections.iter().enumerate() {
        let section = match entry {
            SectionEntry::Section(section)
                if !section.id.trim().is_empty() && !section.kind.trim().is_empty() =>
            {
                section
            }
            SectionEntry::Section(section) => {
                skipped.push(SkippedEntry {
                    section_index,
                    section_id: Some(section.id.clone()).filter(|id| !id.is_empty()),
                    item_index: None,
                    reason: SkipReason::MalformedSection,
                });
                continue;
            }
            SectionEntry::Malformed(_) => {
                skipped.push(SkippedEntry {
                    section_index,
                    section_id: None,
                    item_index: None,
                    reason: SkipReason::MalformedSection,
                });
                continue;
            }
        };

        let section_ref = SectionRef {
            id: section.id.clone(),
            kind: section.kind.clone(),
            title: section.title.clone(),
        };
        if let Some(passage) = &section.passage {
            passages.insert(section.id.clone(), passage.clone());
        }
        if seen_kinds.insert(section.kind.clone()) {
            intro_positions.insert(section.kind.clone(), slots.len());
            slots.push(Slot::Intro {
                section: section_ref.clone(),
                first_ordinal: ordinal,
            });
        }

        for (item_index, entry) in section.items.iter().enumerate() {
            let skip = |reason| SkippedEntry {
                section_index,
                section_id: Some(section.id.clone()),
                item_index: Some(item_index),
                reason,
            };
            let item = match entry {
                ItemEntry::Inline(item) => item.clone(),
                ItemEntry::Reference { reference } => match resolver.resolve(reference) {
                    Some(item) => item,
                    None => {
                        skipped.push(skip(SkipReason::UnresolvedReference {
                            reference: reference.clone(),
                        }));
                        continue;
                    }
                },
                ItemEntry::Malformed(_) => {
                    skipped.push(skip(SkipReason::MalformedItem));
                    continue;
                }
            };
            if item.id.trim().is_empty() {
                skipped.push(skip(SkipReason::EmptyItemId));
                continue;
            }
            if item_positions.contains_key(&item.id) {
                skipped.push(skip(SkipReason::DuplicateItemId {
                    item_id: item.id.clone(),
                }));
                continue;
            }

            item_positions.insert(item.id.clone(), slots.len());
            slots.push(Slot::Item(ItemSlot {
                ordinal,
                section: section_ref.clone(),
                item,
            }));
            ordinal += 1;
        }
    }

    slots.push(Slot::End { item_count: ordinal });

    for entry in &skipped {
        warn!(
            exam_id = %exam.id,
            section_index = entry.section_index,
            item_index = ?entry.item_index,
            reason = ?entry.reason,
            "skipping exam entry"
        );
    }

    FlattenedExam {
        exam_id: exam.id.clone(),
        title: exam.title.clone(),
        time_limit_minutes: exam.time_limit_minutes,
        slots,
        intro_positions,
        passages,
        item_count: ordinal,
        skipped,
        item_positions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_section_exam() -> Exam {
        serde_json::from_value(json!({
            "id": "e1",
            "title": "Mock",
            "sections": [
                {"id": "s1", "kind": "reading", "items": [
                    {"id": "i0", "kind": "single_choice"},
                    {"id": "i1", "kind": "single_choice"},
                    {"id": "i2", "kind": "single_choice"}
                ]},
                {"id": "s2", "kind": "ela_b", "items": [
                    {"id": "i3", "kind": "blank_fill"},
                    {"id": "i4", "kind": "table_match"}
                ]}
            ]
        }))
        .unwrap()
    }

    fn shape(flat: &FlattenedExam) -> Vec<String> {
        flat.slots
            .iter()
            .map(|slot| match slot {
                Slot::Intro { section, .. } => format!("intro({})", section.kind),
                Slot::Item(slot) => format!("item{}", slot.ordinal),
                Slot::End { item_count } => format!("end({item_count})"),
            })
            .collect()
    }

    #[test]
    fn emits_intro_items_and_end_in_order() {
        let flat = flatten_exam(&two_section_exam());
        assert_eq!(
            shape(&flat),
            vec!["intro(reading)", "item0", "item1", "item2", "intro(ela_b)", "item3", "item4", "end(5)"]
        );
        assert_eq!(flat.item_count, 5);
        assert_eq!(flat.intro_positions["reading"], 0);
        assert_eq!(flat.intro_positions["ela_b"], 4);
        assert_eq!(flat.position_of_item("i3"), Some(5));
        assert_eq!(flat.section_of("i4").unwrap().id, "s2");
    }

    #[test]
    fn repeated_kind_gets_a_single_intro() {
        let exam: Exam = serde_json::from_value(json!({
            "id": "e2",
            "sections": [
                {"id": "a", "kind": "math", "items": [{"id": "x", "kind": "single_choice"}]},
                {"id": "b", "kind": "math", "items": [{"id": "y", "kind": "single_choice"}]}
            ]
        }))
        .unwrap();
        let flat = flatten_exam(&exam);
        assert_eq!(shape(&flat), vec!["intro(math)", "item0", "item1", "end(2)"]);
    }

    #[test]
    fn intro_records_first_ordinal_of_its_section() {
        let flat = flatten_exam(&two_section_exam());
        match &flat.slots[4] {
            Slot::Intro { first_ordinal, .. } => assert_eq!(*first_ordinal, 3),
            other => panic!("unexpected slot {other:?}"),
        }
    }

    #[test]
    fn zero_item_exam_still_has_intro_and_end() {
        let exam: Exam = serde_json::from_value(json!({
            "id": "empty",
            "sections": [{"id": "s", "kind": "reading", "items": []}]
        }))
        .unwrap();
        let flat = flatten_exam(&exam);
        assert_eq!(shape(&flat), vec!["intro(reading)", "end(0)"]);
        assert_eq!(flat.item_count, 0);
    }

    #[test]
    fn unresolved_and_malformed_entries_are_skipped() {
        let exam: Exam = serde_json::from_value(json!({
            "id": "e3",
            "sections": [
                {"id": "s1", "kind": "math", "items": [
                    {"ref": "bank-a"},
                    {"ref": "nowhere"},
                    {"prompt": "no id"},
                    {"id": "", "kind": "single_choice"},
                    {"id": "bank-a", "kind": "single_choice"}
                ]},
                {"kind": "reading"},
                {"id": "s3", "kind": "reading", "items": [{"id": "r", "kind": "multi_choice"}]}
            ],
            "itemBank": [{"id": "bank-a", "kind": "single_choice", "key": {"single_choice": 1}}]
        }))
        .unwrap();
        let flat = flatten_exam(&exam);

        assert_eq!(shape(&flat), vec!["intro(math)", "item0", "intro(reading)", "item1", "end(2)"]);
        let reasons: Vec<_> = flat.skipped.iter().map(|s| s.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                SkipReason::UnresolvedReference { reference: "nowhere".into() },
                SkipReason::MalformedItem,
                SkipReason::EmptyItemId,
                SkipReason::DuplicateItemId { item_id: "bank-a".into() },
                SkipReason::MalformedSection,
            ]
        );
    }

    #[test]
    fn external_resolver_supplies_content() {
        let exam: Exam = serde_json::from_value(json!({
            "id": "e4",
            "sections": [{"id": "s", "kind": "math", "items": [{"ref": "ext"}]}]
        }))
        .unwrap();
        let mut bank = HashMap::new();
        bank.insert(
            "ext".to_string(),
            serde_json::from_value::<Item>(json!({"id": "ext", "kind": "blank_fill"})).unwrap(),
        );
        let flat = flatten_with(&exam, &bank);
        assert_eq!(flat.item_count, 1);
        assert!(flat.contains_item("ext"));
    }
}
