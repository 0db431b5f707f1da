use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

pub const DEFAULT_POINTS: u32 = 1;

/// Mapping payload shared by bin placement, table match and blank fill.
/// Values are kept as raw json scalars and stringified when compared.
pub type ChoiceMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    SingleChoice,
    MultiChoice,
    BinPlacement,
    TableMatch,
    BlankFill,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::SingleChoice => "single_choice",
            InteractionKind::MultiChoice => "multi_choice",
            InteractionKind::BinPlacement => "bin_placement",
            InteractionKind::TableMatch => "table_match",
            InteractionKind::BlankFill => "blank_fill",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative correct response for an item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKey {
    SingleChoice(usize),
    MultiChoice(Vec<usize>),
    BinPlacement(ChoiceMap),
    TableMatch(ChoiceMap),
    BlankFill(ChoiceMap),
}

impl AnswerKey {
    pub fn kind(&self) -> InteractionKind {
        match self {
            AnswerKey::SingleChoice(_) => InteractionKind::SingleChoice,
            AnswerKey::MultiChoice(_) => InteractionKind::MultiChoice,
            AnswerKey::BinPlacement(_) => InteractionKind::BinPlacement,
            AnswerKey::TableMatch(_) => InteractionKind::TableMatch,
            AnswerKey::BlankFill(_) => InteractionKind::BlankFill,
        }
    }

    /// An empty index list or empty mapping carries no key at all.
    pub fn is_present(&self) -> bool {
        match self {
            AnswerKey::SingleChoice(_) => true,
            AnswerKey::MultiChoice(indices) => !indices.is_empty(),
            AnswerKey::BinPlacement(map) | AnswerKey::TableMatch(map) | AnswerKey::BlankFill(map) => {
                !map.is_empty()
            }
        }
    }
}

/// A learner's in-progress answer for one item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    SingleChoice(usize),
    MultiChoice(Vec<usize>),
    BinPlacement(ChoiceMap),
    TableMatch(ChoiceMap),
    BlankFill(ChoiceMap),
}

impl Response {
    pub fn kind(&self) -> InteractionKind {
        match self {
            Response::SingleChoice(_) => InteractionKind::SingleChoice,
            Response::MultiChoice(_) => InteractionKind::MultiChoice,
            Response::BinPlacement(_) => InteractionKind::BinPlacement,
            Response::TableMatch(_) => InteractionKind::TableMatch,
            Response::BlankFill(_) => InteractionKind::BlankFill,
        }
    }

    /// Index `0` is a real selection; only empty sets and mappings count as blank.
    pub fn is_empty(&self) -> bool {
        match self {
            Response::SingleChoice(_) => false,
            Response::MultiChoice(indices) => indices.is_empty(),
            Response::BinPlacement(map) | Response::TableMatch(map) | Response::BlankFill(map) => {
                map.is_empty()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: String,
    pub kind: InteractionKind,
    #[serde(default)]
    pub prompt: Value,
    /// Choices, bins, tables or blanks; opaque to the engine.
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<AnswerKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
}

impl Item {
    pub fn max_points(&self) -> u32 {
        self.points.unwrap_or(DEFAULT_POINTS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ItemEntry {
    Reference {
        #[serde(rename = "ref")]
        reference: String,
    },
    Inline(Item),
    Malformed(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Open set: `reading`, `math`, `ela_a`, `ela_b`, ...
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passage: Option<Value>,
    #[serde(default)]
    pub items: Vec<ItemEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SectionEntry {
    Section(Section),
    Malformed(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_minutes: Option<u32>,
    #[serde(default)]
    pub sections: Vec<SectionEntry>,
    #[serde(default)]
    pub item_bank: Vec<Item>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

fn issue(field: String, issue: &str) -> ValidationIssue {
    ValidationIssue {
        field,
        issue: issue.into(),
    }
}

fn validate_item(field: &str, item: &Item, item_ids: &mut HashSet<String>, issues: &mut Vec<ValidationIssue>) {
    if item.id.trim().is_empty() {
        issues.push(issue(format!("{field}.id"), "must not be empty"));
    } else if !item_ids.insert(item.id.clone()) {
        issues.push(issue(format!("{field}.id"), "must be unique across the exam"));
    }
    if item.points == Some(0) {
        issues.push(issue(format!("{field}.points"), "must be positive when present"));
    }
    match &item.key {
        None => issues.push(issue(format!("{field}.key"), "missing, item will be unscored")),
        Some(key) if key.kind() != item.kind => {
            issues.push(issue(format!("{field}.key"), "must match item kind"));
        }
        Some(key) if !key.is_present() => {
            issues.push(issue(format!("{field}.key"), "is empty, item will be unscored"));
        }
        Some(AnswerKey::MultiChoice(indices)) => {
            let mut seen = HashSet::new();
            for (k, idx) in indices.iter().enumerate() {
                if !seen.insert(*idx) {
                    issues.push(issue(format!("{field}.key[{k}]"), "must be unique"));
                }
            }
        }
        Some(_) => {}
    }
}

/// Authoring diagnostics. Advisory only: the flattener loads whatever it can use.
pub fn validate_exam(exam: &Exam) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if exam.id.trim().is_empty() {
        issues.push(issue("id".into(), "must not be empty"));
    }
    if exam.title.trim().is_empty() {
        issues.push(issue("title".into(), "must not be empty"));
    }
    if exam.sections.is_empty() {
        issues.push(issue("sections".into(), "must contain at least one section"));
    }

    let bank: HashSet<&str> = exam.item_bank.iter().map(|item| item.id.as_str()).collect();
    let mut section_ids = HashSet::new();
    let mut item_ids = HashSet::new();
    for (i, entry) in exam.sections.iter().enumerate() {
        let section = match entry {
            SectionEntry::Section(section) => section,
            SectionEntry::Malformed(_) => {
                issues.push(issue(format!("sections[{i}]"), "malformed section, will be skipped"));
                continue;
            }
        };
        if section.id.trim().is_empty() {
            issues.push(issue(format!("sections[{i}].id"), "must not be empty"));
        }
        if !section_ids.insert(section.id.clone()) {
            issues.push(issue(format!("sections[{i}].id"), "must be unique"));
        }
        if section.kind.trim().is_empty() {
            issues.push(issue(format!("sections[{i}].kind"), "must not be empty"));
        }
        for (j, item) in section.items.iter().enumerate() {
            let field = format!("sections[{i}].items[{j}]");
            match item {
                ItemEntry::Inline(item) => validate_item(&field, item, &mut item_ids, &mut issues),
                ItemEntry::Reference { reference } => {
                    if !bank.contains(reference.as_str()) {
                        issues.push(issue(format!("{field}.ref"), "does not resolve in item bank"));
                    } else if !item_ids.insert(reference.clone()) {
                        issues.push(issue(format!("{field}.ref"), "must be unique across the exam"));
                    }
                }
                ItemEntry::Malformed(_) => {
                    issues.push(issue(field, "malformed item, will be skipped"));
                }
            }
        }
    }

    for (k, item) in exam.item_bank.iter().enumerate() {
        if let Some(key) = &item.key {
            if key.kind() != item.kind {
                issues.push(issue(format!("itemBank[{k}].key"), "must match item kind"));
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_exam() -> Exam {
        serde_json::from_value(json!({
            "id": "practice-1",
            "title": "Practice",
            "sections": [
                {
                    "id": "s1",
                    "title": "Reading",
                    "kind": "reading",
                    "passage": {"md": "Once upon a time"},
                    "items": [
                        {"id": "r1", "kind": "single_choice", "prompt": "Why?", "key": {"single_choice": 2}},
                        {"ref": "bank-1"}
                    ]
                },
                {
                    "id": "s2",
                    "kind": "math",
                    "items": [
                        {"id": "m1", "kind": "multi_choice", "key": {"multi_choice": [1, 3]}, "points": 2}
                    ]
                }
            ],
            "itemBank": [
                {"id": "bank-1", "kind": "blank_fill", "key": {"blank_fill": {"b1": "t1", "b2": 7}}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn exam_deserializes_inline_and_referenced_items() {
        let exam = sample_exam();
        let SectionEntry::Section(reading) = &exam.sections[0] else {
            panic!("expected a section");
        };
        assert!(matches!(reading.items[0], ItemEntry::Inline(_)));
        assert!(matches!(&reading.items[1], ItemEntry::Reference { reference } if reference == "bank-1"));
        assert_eq!(exam.item_bank[0].max_points(), 1);
    }

    #[test]
    fn malformed_entries_do_not_abort_deserialization() {
        let exam: Exam = serde_json::from_value(json!({
            "id": "broken",
            "sections": [
                {"title": "no id or kind"},
                {"id": "s1", "kind": "math", "items": [{"prompt": "no id"}, 42]}
            ]
        }))
        .unwrap();
        assert!(matches!(exam.sections[0], SectionEntry::Malformed(_)));
        let SectionEntry::Section(math) = &exam.sections[1] else {
            panic!("expected a section");
        };
        assert!(math.items.iter().all(|i| matches!(i, ItemEntry::Malformed(_))));
    }

    #[test]
    fn validate_exam_ok() {
        assert!(validate_exam(&sample_exam()).is_ok());
    }

    #[test]
    fn validate_exam_negative() {
        let mut exam = sample_exam();
        if let SectionEntry::Section(section) = &mut exam.sections[1] {
            section.items.push(ItemEntry::Inline(Item {
                id: "r1".into(),
                kind: InteractionKind::TableMatch,
                prompt: Value::Null,
                content: Value::Null,
                key: Some(AnswerKey::SingleChoice(0)),
                points: None,
            }));
            section.items.push(ItemEntry::Reference { reference: "missing".into() });
        }
        let issues = validate_exam(&exam).unwrap_err();
        assert!(issues.iter().any(|i| i.issue.contains("unique")));
        assert!(issues.iter().any(|i| i.issue == "must match item kind"));
        assert!(issues.iter().any(|i| i.issue.contains("does not resolve")));
    }

    #[test]
    fn empty_keys_are_not_present() {
        assert!(AnswerKey::SingleChoice(0).is_present());
        assert!(!AnswerKey::MultiChoice(vec![]).is_present());
        assert!(!AnswerKey::TableMatch(ChoiceMap::new()).is_present());
    }

    #[test]
    fn response_emptiness() {
        assert!(!Response::SingleChoice(0).is_empty());
        assert!(Response::MultiChoice(vec![]).is_empty());
        assert!(Response::BinPlacement(ChoiceMap::new()).is_empty());
        let raw = json!({"table_match": {"row1": "opt2"}});
        let parsed: Response = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.kind(), InteractionKind::TableMatch);
        assert!(!parsed.is_empty());
    }
}
