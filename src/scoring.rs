use crate::answers::AnswerStore;
use crate::flatten::{FlattenedExam, SectionRef};
use crate::models::{AnswerKey, ChoiceMap, InteractionKind, Item, Response};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

pub const UNASSIGNED_SECTION: &str = "unassigned";

/// Outcome of one scorer. `correct == None` means unscored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub correct: Option<bool>,
    pub points_earned: u32,
    pub max_points: u32,
}

impl Verdict {
    fn graded(correct: bool, points: u32) -> Self {
        Self {
            correct: Some(correct),
            points_earned: if correct { points } else { 0 },
            max_points: points,
        }
    }

    /// Unscored items carry no points either way so they never widen a denominator.
    pub fn unscored() -> Self {
        Self {
            correct: None,
            points_earned: 0,
            max_points: 0,
        }
    }
}

pub fn score_single_choice(key: usize, response: Option<&Response>, points: u32) -> Verdict {
    let correct = matches!(response, Some(Response::SingleChoice(selected)) if *selected == key);
    Verdict::graded(correct, points)
}

pub fn score_multi_choice(key: &[usize], response: Option<&Response>, points: u32) -> Verdict {
    let correct = match response {
        Some(Response::MultiChoice(selected)) => selection(selected) == selection(key),
        _ => false,
    };
    Verdict::graded(correct, points)
}

pub fn score_bin_placement(key: &ChoiceMap, response: Option<&Response>, points: u32) -> Verdict {
    let correct = match response {
        Some(Response::BinPlacement(placed)) => maps_agree(key, placed),
        _ => false,
    };
    Verdict::graded(correct, points)
}

pub fn score_table_match(key: &ChoiceMap, response: Option<&Response>, points: u32) -> Verdict {
    let correct = match response {
        Some(Response::TableMatch(rows)) => maps_agree(key, rows),
        _ => false,
    };
    Verdict::graded(correct, points)
}

pub fn score_blank_fill(key: &ChoiceMap, response: Option<&Response>, points: u32) -> Verdict {
    let correct = match response {
        Some(Response::BlankFill(blanks)) => maps_agree(key, blanks),
        _ => false,
    };
    Verdict::graded(correct, points)
}

pub fn score_unknown() -> Verdict {
    Verdict::unscored()
}

/// Selections are a set: order and repeats do not matter.
fn selection(indices: &[usize]) -> BTreeSet<usize> {
    indices.iter().copied().collect()
}

fn token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compares over the union of both key sets; a missing or extra entry is a mismatch.
fn maps_agree(key: &ChoiceMap, response: &ChoiceMap) -> bool {
    let ids: BTreeSet<&String> = key.keys().chain(response.keys()).collect();
    ids.into_iter()
        .all(|id| key.get(id).map(token) == response.get(id).map(token))
}

/// Dispatches on the key's tag. A missing key, an empty key, or a key whose tag
/// disagrees with the item's declared kind all fall through to the unknown scorer.
pub fn score_verdict(item: &Item, response: Option<&Response>) -> Verdict {
    let points = item.max_points();
    match &item.key {
        Some(key) if key.is_present() && key.kind() == item.kind => match key {
            AnswerKey::SingleChoice(index) => score_single_choice(*index, response, points),
            AnswerKey::MultiChoice(indices) => score_multi_choice(indices, response, points),
            AnswerKey::BinPlacement(map) => score_bin_placement(map, response, points),
            AnswerKey::TableMatch(map) => score_table_match(map, response, points),
            AnswerKey::BlankFill(map) => score_blank_fill(map, response, points),
        },
        _ => score_unknown(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreDetail {
    pub item_id: String,
    pub section_id: String,
    pub kind: InteractionKind,
    pub answered: bool,
    pub correct: Option<bool>,
    pub points_earned: u32,
    pub max_points: u32,
}

pub fn score_item(item: &Item, response: Option<&Response>, section_id: &str) -> ScoreDetail {
    let verdict = score_verdict(item, response);
    ScoreDetail {
        item_id: item.id.clone(),
        section_id: section_id.to_string(),
        kind: item.kind,
        answered: response.map(|r| !r.is_empty()).unwrap_or(false),
        correct: verdict.correct,
        points_earned: verdict.points_earned,
        max_points: verdict.max_points,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreTotals {
    pub correct_count: u32,
    pub total_scored: u32,
    pub points_earned: u64,
    pub points_possible: u64,
    /// `None` while nothing has been scored.
    pub percent: Option<f64>,
}

impl ScoreTotals {
    fn record(&mut self, detail: &ScoreDetail) {
        if let Some(correct) = detail.correct {
            self.total_scored += 1;
            if correct {
                self.correct_count += 1;
            }
        }
        self.points_earned = self.points_earned.saturating_add(u64::from(detail.points_earned));
        self.points_possible = self.points_possible.saturating_add(u64::from(detail.max_points));
        self.refresh_percent();
    }

    fn merge(&mut self, other: &ScoreTotals) {
        self.correct_count = self.correct_count.saturating_add(other.correct_count);
        self.total_scored = self.total_scored.saturating_add(other.total_scored);
        self.points_earned = self.points_earned.saturating_add(other.points_earned);
        self.points_possible = self.points_possible.saturating_add(other.points_possible);
        self.refresh_percent();
    }

    fn refresh_percent(&mut self) {
        self.percent = if self.points_possible == 0 {
            None
        } else {
            Some(self.points_earned as f64 * 100.0 / self.points_possible as f64)
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionScore {
    pub section_id: String,
    pub section_kind: String,
    pub title: String,
    pub item_count: u32,
    #[serde(flatten)]
    pub totals: ScoreTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreReport {
    pub per_item: Vec<ScoreDetail>,
    pub per_section: Vec<SectionScore>,
    pub totals: ScoreTotals,
}

/// Scores every item against the store and buckets the results by the section
/// returned from `section_lookup`, in first-seen order.
pub fn score_exam<'a, I, F>(items: I, responses: &AnswerStore, section_lookup: F) -> ScoreReport
where
    I: IntoIterator<Item = &'a Item>,
    F: Fn(&str) -> Option<SectionRef>,
{
    let mut per_item = Vec::new();
    let mut per_section: Vec<SectionScore> = Vec::new();
    let mut section_index: HashMap<String, usize> = HashMap::new();
    let mut totals = ScoreTotals::default();

    for item in items {
        let section = section_lookup(&item.id).unwrap_or_else(|| SectionRef {
            id: UNASSIGNED_SECTION.into(),
            kind: UNASSIGNED_SECTION.into(),
            title: String::new(),
        });
        let detail = score_item(item, responses.get(&item.id), &section.id);

        let idx = *section_index.entry(section.id.clone()).or_insert_with(|| {
            per_section.push(SectionScore {
                section_id: section.id.clone(),
                section_kind: section.kind.clone(),
                title: section.title.clone(),
                item_count: 0,
                totals: ScoreTotals::default(),
            });
            per_section.len() - 1
        });
        per_section[idx].item_count += 1;
        per_section[idx].totals.record(&detail);
        totals.record(&detail);
        per_item.push(detail);
    }

    ScoreReport {
        per_item,
        per_section,
        totals,
    }
}

impl FlattenedExam {
    pub fn score(&self, responses: &AnswerStore) -> ScoreReport {
        score_exam(
            self.item_slots().map(|slot| &slot.item),
            responses,
            |item_id| self.section_of(item_id),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayGroupScore {
    pub label: String,
    pub section_ids: Vec<String>,
    #[serde(flatten)]
    pub totals: ScoreTotals,
}

/// Re-sums section scores under caller-chosen labels. No re-scoring happens here.
pub fn regroup<F>(sections: &[SectionScore], label_for: F) -> Vec<DisplayGroupScore>
where
    F: Fn(&str) -> String,
{
    let mut groups: Vec<DisplayGroupScore> = Vec::new();
    for section in sections {
        let label = label_for(&section.section_kind);
        match groups.iter_mut().find(|group| group.label == label) {
            Some(group) => {
                group.section_ids.push(section.section_id.clone());
                group.totals.merge(&section.totals);
            }
            None => {
                let mut totals = ScoreTotals::default();
                totals.merge(&section.totals);
                groups.push(DisplayGroupScore {
                    label,
                    section_ids: vec![section.section_id.clone()],
                    totals,
                });
            }
        }
    }
    groups
}

/// Label function backed by a kind -> label table; unmapped kinds keep their own name.
pub fn label_from_map(labels: &HashMap<String, String>) -> impl Fn(&str) -> String + '_ {
    move |kind: &str| labels.get(kind).cloned().unwrap_or_else(|| kind.to_string())
}
