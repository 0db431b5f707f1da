use crate::answers::{AnswerStore, BookmarkSet, Notes};
use crate::error::AttemptError;
use crate::flatten::{FlattenedExam, Slot};
use crate::models::{InteractionKind, Response};
use crate::persistence::{AttemptKey, AttemptSnapshot, Clock};
use crate::scoring::ScoreReport;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewTab {
    #[default]
    All,
    Unanswered,
    Bookmarked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    #[default]
    InProgress,
    Submitted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewEntry {
    pub position: usize,
    pub ordinal: usize,
    pub item_id: String,
    pub kind: InteractionKind,
    pub answered: bool,
    pub bookmarked: bool,
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewGroup {
    pub label: String,
    pub entries: Vec<ReviewEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCounts {
    pub total: usize,
    pub answered: usize,
    pub unanswered: usize,
    pub bookmarked: usize,
}

/// Everything one learner's attempt at one exam carries between actions.
#[derive(Debug, Clone)]
pub struct AttemptSession {
    key: AttemptKey,
    exam: Arc<FlattenedExam>,
    position: usize,
    answers: AnswerStore,
    bookmarks: BookmarkSet,
    notes: Notes,
    review_open: bool,
    status: AttemptStatus,
    started_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    report: Option<ScoreReport>,
    clock: Arc<dyn Clock>,
}

impl AttemptSession {
    /// Starts the attempt at the clock's current wall time.
    pub fn new(key: AttemptKey, exam: Arc<FlattenedExam>, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.wall();
        Self {
            key,
            exam,
            position: 0,
            answers: AnswerStore::new(),
            bookmarks: BookmarkSet::new(),
            notes: Notes::new(),
            review_open: false,
            status: AttemptStatus::InProgress,
            started_at,
            last_active: started_at,
            report: None,
            clock,
        }
    }

    /// Loads saved work, dropping anything that refers to items this exam no longer has.
    /// A submitted attempt comes back frozen with its report rebuilt from the saved answers.
    pub fn restore(&mut self, snapshot: AttemptSnapshot) {
        let exam = Arc::clone(&self.exam);
        let AttemptSnapshot {
            mut answers,
            mut bookmarks,
            mut notes,
            position,
            status,
            started_at,
            ..
        } = snapshot;

        let before = answers.len() + bookmarks.len() + notes.len();
        answers.retain(|id| exam.contains_item(id));
        bookmarks.retain(|id| exam.contains_item(id));
        notes.retain(|id, _| exam.contains_item(id));
        let dropped = before - (answers.len() + bookmarks.len() + notes.len());
        if dropped > 0 {
            debug!(exam_id = %exam.exam_id, dropped, "dropped saved entries for unknown items");
        }

        self.answers = answers;
        self.bookmarks = bookmarks;
        self.notes = notes;
        self.position = position.unwrap_or(0).min(exam.end_position());
        if let Some(started_at) = started_at {
            self.started_at = started_at;
        }
        self.status = status;
        self.report = match status {
            AttemptStatus::Submitted => Some(exam.score(&self.answers)),
            AttemptStatus::InProgress => None,
        };
    }

    pub fn snapshot(&self) -> AttemptSnapshot {
        AttemptSnapshot {
            answers: self.answers.clone(),
            bookmarks: self.bookmarks.clone(),
            notes: self.notes.clone(),
            position: Some(self.position),
            status: self.status,
            started_at: Some(self.started_at),
            saved_at: None,
        }
    }

    pub fn key(&self) -> &AttemptKey {
        &self.key
    }

    pub fn exam(&self) -> &FlattenedExam {
        &self.exam
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn current_slot(&self) -> Option<&Slot> {
        self.exam.slot(self.position)
    }

    pub fn answers(&self) -> &AnswerStore {
        &self.answers
    }

    pub fn bookmarks(&self) -> &BookmarkSet {
        &self.bookmarks
    }

    pub fn notes(&self) -> &Notes {
        &self.notes
    }

    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    pub fn review_open(&self) -> bool {
        self.review_open
    }

    pub fn report(&self) -> Option<&ScoreReport> {
        self.report.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current wall time according to the attempt's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.wall()
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    /// Records learner activity; idle attempts are evicted from memory.
    pub fn touch(&mut self) {
        self.last_active = self.clock.wall();
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.exam
            .time_limit_minutes
            .map(|minutes| self.started_at + Duration::minutes(i64::from(minutes)))
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.deadline().map(|deadline| (deadline - now).num_seconds().max(0))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline().map(|deadline| now >= deadline).unwrap_or(false)
    }

    fn ensure_editable(&self) -> Result<(), AttemptError> {
        if self.status == AttemptStatus::Submitted {
            return Err(AttemptError::Submitted);
        }
        if self.is_expired(self.now()) {
            return Err(AttemptError::TimeExpired);
        }
        Ok(())
    }

    pub fn next(&mut self) -> usize {
        self.position = (self.position + 1).min(self.exam.end_position());
        self.position
    }

    pub fn previous(&mut self) -> usize {
        self.position = self.position.saturating_sub(1);
        self.position
    }

    pub fn go_to(&mut self, position: usize) -> Result<usize, AttemptError> {
        if position > self.exam.end_position() {
            return Err(AttemptError::InvalidPosition(position));
        }
        self.position = position;
        Ok(position)
    }

    pub fn go_to_item(&mut self, item_id: &str) -> Result<usize, AttemptError> {
        let position = self
            .exam
            .position_of_item(item_id)
            .ok_or_else(|| AttemptError::UnknownItem(item_id.to_string()))?;
        self.position = position;
        Ok(position)
    }

    /// Jumps to the intro page of a section kind.
    pub fn go_to_section(&mut self, kind: &str) -> Result<usize, AttemptError> {
        let position = self
            .exam
            .intro_positions
            .get(kind)
            .copied()
            .ok_or_else(|| AttemptError::UnknownSectionKind(kind.to_string()))?;
        self.position = position;
        Ok(position)
    }

    /// Stores `response` for `item_id`, replacing any earlier value. The response
    /// must have the item's interaction kind.
    pub fn set_response(&mut self, item_id: &str, response: Response) -> Result<Option<Response>, AttemptError> {
        self.ensure_editable()?;
        let slot = self
            .exam
            .item_slot(item_id)
            .ok_or_else(|| AttemptError::UnknownItem(item_id.to_string()))?;
        if slot.item.kind != response.kind() {
            return Err(AttemptError::ShapeMismatch {
                item_id: item_id.to_string(),
                expected: slot.item.kind,
                got: response.kind(),
            });
        }
        Ok(self.answers.set(item_id, response))
    }

    pub fn clear_response(&mut self, item_id: &str) -> Result<Option<Response>, AttemptError> {
        self.ensure_editable()?;
        if !self.exam.contains_item(item_id) {
            return Err(AttemptError::UnknownItem(item_id.to_string()));
        }
        Ok(self.answers.clear(item_id))
    }

    /// Toggles the bookmark on the current slot. `Ok(None)` on intro and end pages.
    pub fn toggle_bookmark(&mut self) -> Result<Option<bool>, AttemptError> {
        self.ensure_editable()?;
        let Some(item_id) = self.current_slot().and_then(Slot::as_item).map(|slot| slot.item.id.clone()) else {
            return Ok(None);
        };
        Ok(Some(self.bookmarks.toggle(&item_id)))
    }

    pub fn toggle_bookmark_item(&mut self, item_id: &str) -> Result<bool, AttemptError> {
        self.ensure_editable()?;
        if !self.exam.contains_item(item_id) {
            return Err(AttemptError::UnknownItem(item_id.to_string()));
        }
        Ok(self.bookmarks.toggle(item_id))
    }

    /// Blank text removes the note.
    pub fn set_note(&mut self, item_id: &str, text: &str) -> Result<(), AttemptError> {
        self.ensure_editable()?;
        if !self.exam.contains_item(item_id) {
            return Err(AttemptError::UnknownItem(item_id.to_string()));
        }
        if text.trim().is_empty() {
            self.notes.remove(item_id);
        } else {
            self.notes.insert(item_id.to_string(), text.to_string());
        }
        Ok(())
    }

    pub fn toggle_review(&mut self) -> bool {
        self.review_open = !self.review_open;
        self.review_open
    }

    /// Intro pages count as the first item of their section and the end page as
    /// 100, so progress never moves backwards while walking forward.
    pub fn progress_percent(&self) -> u32 {
        let total = self.exam.item_count;
        let ordinal = match self.current_slot() {
            Some(Slot::End { .. }) | None => return 100,
            Some(Slot::Item(slot)) => slot.ordinal,
            Some(Slot::Intro { first_ordinal, .. }) => *first_ordinal,
        };
        if total == 0 {
            return 0;
        }
        let percent = (100.0 * (ordinal + 1) as f64 / total as f64).round() as u32;
        percent.min(100)
    }

    pub fn counts(&self) -> ReviewCounts {
        let total = self.exam.item_count;
        let answered = self
            .exam
            .item_slots()
            .filter(|slot| self.answers.is_answered(&slot.item.id))
            .count();
        ReviewCounts {
            total,
            answered,
            unanswered: total - answered,
            bookmarked: self.bookmarks.len(),
        }
    }

    /// Item slots passing `tab`, grouped by section kind in first-seen order.
    pub fn review(&self, tab: ReviewTab) -> Vec<ReviewGroup> {
        let mut groups: Vec<ReviewGroup> = Vec::new();
        let mut by_label: HashMap<&str, usize> = HashMap::new();

        for (position, slot) in self.exam.slots.iter().enumerate() {
            let Some(slot) = slot.as_item() else {
                continue;
            };
            let answered = self.answers.is_answered(&slot.item.id);
            let bookmarked = self.bookmarks.contains(&slot.item.id);
            let keep = match tab {
                ReviewTab::All => true,
                ReviewTab::Unanswered => !answered,
                ReviewTab::Bookmarked => bookmarked,
            };
            if !keep {
                continue;
            }

            let idx = *by_label.entry(slot.section.kind.as_str()).or_insert_with(|| {
                groups.push(ReviewGroup {
                    label: slot.section.kind.clone(),
                    entries: Vec::new(),
                });
                groups.len() - 1
            });
            groups[idx].entries.push(ReviewEntry {
                position,
                ordinal: slot.ordinal,
                item_id: slot.item.id.clone(),
                kind: slot.item.kind,
                answered,
                bookmarked,
                current: position == self.position,
            });
        }
        groups
    }

    /// Scores the attempt, then freezes it. Repeated calls return the first report.
    pub fn submit(&mut self) -> &ScoreReport {
        let (exam, answers, key) = (&self.exam, &self.answers, &self.key);
        let report = self.report.get_or_insert_with(|| {
            let report = exam.score(answers);
            info!(
                exam_id = %key.exam_id,
                learner_id = %key.learner_id,
                correct = report.totals.correct_count,
                scored = report.totals.total_scored,
                "attempt submitted"
            );
            report
        });
        self.status = AttemptStatus::Submitted;
        self.review_open = false;
        report
    }
}
