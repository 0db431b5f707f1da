use crate::models::Response;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Item id -> current response. Shape checks belong to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnswerStore {
    responses: BTreeMap<String, Response>,
}

impl AnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, item_id: &str) -> Option<&Response> {
        self.responses.get(item_id)
    }

    /// Replaces whatever was stored before; never merges.
    pub fn set(&mut self, item_id: impl Into<String>, response: Response) -> Option<Response> {
        self.responses.insert(item_id.into(), response)
    }

    pub fn clear(&mut self, item_id: &str) -> Option<Response> {
        self.responses.remove(item_id)
    }

    pub fn is_answered(&self, item_id: &str) -> bool {
        self.responses
            .get(item_id)
            .map(|response| !response.is_empty())
            .unwrap_or(false)
    }

    pub fn answered_count(&self) -> usize {
        self.responses.values().filter(|r| !r.is_empty()).count()
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Response)> {
        self.responses.iter()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.responses.retain(|id, _| keep(id));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookmarkSet {
    items: BTreeSet<String>,
}

impl BookmarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips membership and returns whether the item is now bookmarked.
    pub fn toggle(&mut self, item_id: &str) -> bool {
        if self.items.remove(item_id) {
            false
        } else {
            self.items.insert(item_id.to_string());
            true
        }
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.items.contains(item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.items.iter()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.items.retain(|id| keep(id));
    }
}

impl FromIterator<String> for BookmarkSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Free-text scratch notes per item.
pub type Notes = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChoiceMap;
    use serde_json::json;

    #[test]
    fn set_replaces_instead_of_merging() {
        let mut store = AnswerStore::new();
        let mut first = ChoiceMap::new();
        first.insert("optA".into(), json!("bin1"));
        first.insert("optB".into(), json!("bin2"));
        store.set("i1", Response::BinPlacement(first));

        let mut second = ChoiceMap::new();
        second.insert("optA".into(), json!("bin2"));
        let previous = store.set("i1", Response::BinPlacement(second.clone()));

        assert!(previous.is_some());
        assert_eq!(store.get("i1"), Some(&Response::BinPlacement(second)));
    }

    #[test]
    fn unanswered_detection() {
        let mut store = AnswerStore::new();
        assert!(!store.is_answered("missing"));

        store.set("zero", Response::SingleChoice(0));
        store.set("empty_set", Response::MultiChoice(vec![]));
        store.set("empty_map", Response::BlankFill(ChoiceMap::new()));

        assert!(store.is_answered("zero"));
        assert!(!store.is_answered("empty_set"));
        assert!(!store.is_answered("empty_map"));
        assert_eq!(store.answered_count(), 1);

        store.clear("zero");
        assert!(!store.is_answered("zero"));
    }

    #[test]
    fn bookmark_toggle_flips_membership() {
        let mut marks = BookmarkSet::new();
        assert!(marks.toggle("i3"));
        assert!(marks.contains("i3"));
        assert!(!marks.toggle("i3"));
        assert!(marks.is_empty());
    }

    #[test]
    fn store_serializes_as_plain_map() {
        let mut store = AnswerStore::new();
        store.set("q1", Response::MultiChoice(vec![3, 1]));
        let value = serde_json::to_value(&store).unwrap();
        assert_eq!(value, json!({"q1": {"multi_choice": [3, 1]}}));
        let back: AnswerStore = serde_json::from_value(value).unwrap();
        assert_eq!(back, store);
    }
}
