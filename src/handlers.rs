use crate::error::{AppError, ErrorDetail};
use crate::flatten::{FlattenedExam, SectionRef, SkippedEntry, Slot};
use crate::models::{validate_exam, Exam, InteractionKind, Response, ValidationIssue};
use crate::persistence::AttemptKey;
use crate::scoring::{label_from_map, regroup, DisplayGroupScore, ScoreReport};
use crate::session::{AttemptSession, AttemptStatus, ReviewCounts, ReviewGroup, ReviewTab};
use crate::state::{AppState, AttemptStart};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};
use validator::{Validate, ValidationErrors};

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn validation_error(errors: ValidationErrors, req_id: String) -> AppError {
    let details = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| ErrorDetail {
                field: field.to_string(),
                issue: e.code.to_string(),
            })
        })
        .collect();
    AppError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "request validation failed", req_id)
        .with_details(details)
}

fn internal(err: anyhow::Error, req_id: String) -> AppError {
    warn!("request {} failed: {:#}", req_id, err);
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "internal error", req_id)
}

fn attempt_not_found(req_id: String) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "attempt not started", req_id)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRegistered {
    pub exam_id: String,
    pub item_count: usize,
    pub skipped: Vec<SkippedEntry>,
    pub issues: Vec<ValidationIssue>,
}

pub async fn register_exam(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(exam): Json<Exam>,
) -> Result<(StatusCode, Json<ExamRegistered>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if exam.id.trim().is_empty() {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "exam id must not be empty", req_id)
            .with_details(vec![ErrorDetail {
                field: "id".into(),
                issue: "must not be empty".into(),
            }]));
    }
    let issues = validate_exam(&exam).err().unwrap_or_default();
    let flat = state.register_exam(&exam).await;
    Ok((
        StatusCode::CREATED,
        Json(ExamRegistered {
            exam_id: flat.exam_id.clone(),
            item_count: flat.item_count,
            skipped: flat.skipped.clone(),
            issues,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineSlot {
    pub position: usize,
    #[serde(rename = "type")]
    pub slot_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<SectionRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<InteractionKind>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamOutline {
    pub exam_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_minutes: Option<u32>,
    pub item_count: usize,
    pub intro_positions: HashMap<String, usize>,
    pub slots: Vec<OutlineSlot>,
}

fn outline(flat: &FlattenedExam) -> ExamOutline {
    let slots = flat
        .slots
        .iter()
        .enumerate()
        .map(|(position, slot)| match slot {
            Slot::Intro { section, .. } => OutlineSlot {
                position,
                slot_type: "intro",
                section: Some(section.clone()),
                ordinal: None,
                item_id: None,
                kind: None,
            },
            Slot::Item(item) => OutlineSlot {
                position,
                slot_type: "item",
                section: Some(item.section.clone()),
                ordinal: Some(item.ordinal),
                item_id: Some(item.item.id.clone()),
                kind: Some(item.item.kind),
            },
            Slot::End { .. } => OutlineSlot {
                position,
                slot_type: "end",
                section: None,
                ordinal: None,
                item_id: None,
                kind: None,
            },
        })
        .collect();
    ExamOutline {
        exam_id: flat.exam_id.clone(),
        title: flat.title.clone(),
        time_limit_minutes: flat.time_limit_minutes,
        item_count: flat.item_count,
        intro_positions: flat.intro_positions.clone(),
        slots,
    }
}

pub async fn exam_outline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(exam_id): Path<String>,
) -> Result<Json<ExamOutline>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let flat = state
        .exam(&exam_id)
        .await
        .map_err(|err| internal(err, req_id.clone()))?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "exam not found", req_id))?;
    Ok(Json(outline(&flat)))
}

/// Item content handed to the presentation layer. Answer keys never leave the engine.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub id: String,
    pub kind: InteractionKind,
    pub prompt: Value,
    pub content: Value,
    pub points: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotView {
    #[serde(rename_all = "camelCase")]
    Intro {
        section: SectionRef,
        first_ordinal: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        passage: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Item {
        ordinal: usize,
        section: SectionRef,
        item: ItemView,
        #[serde(skip_serializing_if = "Option::is_none")]
        passage: Option<Value>,
        response: Option<Response>,
        answered: bool,
        bookmarked: bool,
        note: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    End { item_count: usize },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    pub exam_id: String,
    pub learner_id: String,
    pub status: AttemptStatus,
    pub position: usize,
    pub slot_count: usize,
    pub progress_percent: u32,
    pub counts: ReviewCounts,
    pub review_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<i64>,
    pub slot: SlotView,
}

fn slot_view(session: &AttemptSession) -> SlotView {
    let exam = session.exam();
    match session.current_slot() {
        Some(Slot::Intro { section, first_ordinal }) => SlotView::Intro {
            section: section.clone(),
            first_ordinal: *first_ordinal,
            passage: exam.passage(&section.id).cloned(),
        },
        Some(Slot::Item(slot)) => {
            let item_id = slot.item.id.as_str();
            SlotView::Item {
                ordinal: slot.ordinal,
                section: slot.section.clone(),
                item: ItemView {
                    id: slot.item.id.clone(),
                    kind: slot.item.kind,
                    prompt: slot.item.prompt.clone(),
                    content: slot.item.content.clone(),
                    points: slot.item.max_points(),
                },
                passage: exam.passage(&slot.section.id).cloned(),
                response: session.answers().get(item_id).cloned(),
                answered: session.answers().is_answered(item_id),
                bookmarked: session.bookmarks().contains(item_id),
                note: session.notes().get(item_id).cloned(),
            }
        }
        Some(Slot::End { .. }) | None => SlotView::End {
            item_count: exam.item_count,
        },
    }
}

fn attempt_view(session: &AttemptSession) -> AttemptView {
    AttemptView {
        exam_id: session.key().exam_id.clone(),
        learner_id: session.key().learner_id.clone(),
        status: session.status(),
        position: session.position(),
        slot_count: session.exam().slots.len(),
        progress_percent: session.progress_percent(),
        counts: session.counts(),
        review_open: session.review_open(),
        remaining_seconds: session.remaining_seconds(session.now()),
        slot: slot_view(session),
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartAttemptPayload {
    #[validate(length(min = 1, max = 128))]
    pub learner_id: String,
    #[validate(length(min = 1, max = 128))]
    pub exam_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptStarted {
    pub resumed: bool,
    pub restored: bool,
    pub attempt: AttemptView,
}

pub async fn start_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<StartAttemptPayload>,
) -> Result<(StatusCode, Json<AttemptStarted>), AppError> {
    let req_id = request_id_from_headers(&headers);
    payload.validate().map_err(|e| validation_error(e, req_id.clone()))?;

    let key = AttemptKey::new(payload.learner_id.trim(), payload.exam_id.trim());
    let start = state
        .start_attempt(key.clone())
        .await
        .map_err(|err| internal(err, req_id.clone()))?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "exam not found", req_id.clone()))?;
    let attempt = state
        .with_attempt(&key, |session| attempt_view(session))
        .ok_or_else(|| attempt_not_found(req_id))?;

    let (status, resumed, restored) = match start {
        AttemptStart::Started { restored } => (StatusCode::CREATED, false, restored),
        AttemptStart::Resumed => (StatusCode::OK, true, false),
    };
    Ok((status, Json(AttemptStarted { resumed, restored, attempt })))
}

pub async fn get_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id)): Path<(String, String)>,
) -> Result<Json<AttemptView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let key = AttemptKey::new(learner_id, exam_id);
    state
        .with_attempt(&key, |session| attempt_view(session))
        .map(Json)
        .ok_or_else(|| attempt_not_found(req_id))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NavigatePayload {
    Next,
    Previous,
    Goto { position: usize },
    Item {
        #[serde(rename = "itemId")]
        item_id: String,
    },
    Section { kind: String },
}

pub async fn navigate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id)): Path<(String, String)>,
    Json(payload): Json<NavigatePayload>,
) -> Result<Json<AttemptView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let key = AttemptKey::new(learner_id, exam_id);
    let (view, snapshot) = state
        .with_attempt(&key, |session| {
            let moved = match &payload {
                NavigatePayload::Next => Ok(session.next()),
                NavigatePayload::Previous => Ok(session.previous()),
                NavigatePayload::Goto { position } => session.go_to(*position),
                NavigatePayload::Item { item_id } => session.go_to_item(item_id),
                NavigatePayload::Section { kind } => session.go_to_section(kind),
            };
            moved.map(|_| (attempt_view(session), session.snapshot()))
        })
        .ok_or_else(|| attempt_not_found(req_id.clone()))?
        .map_err(|err| AppError::from_attempt(err, req_id))?;
    if view.status == AttemptStatus::InProgress {
        state.autosaver.request(&key, snapshot);
    }
    Ok(Json(view))
}

pub async fn put_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id, item_id)): Path<(String, String, String)>,
    Json(response): Json<Response>,
) -> Result<Json<AttemptView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let key = AttemptKey::new(learner_id, exam_id);
    let (view, snapshot) = state
        .with_attempt(&key, |session| {
            session
                .set_response(&item_id, response)
                .map(|_| (attempt_view(session), session.snapshot()))
        })
        .ok_or_else(|| attempt_not_found(req_id.clone()))?
        .map_err(|err| AppError::from_attempt(err, req_id))?;
    state.autosaver.request(&key, snapshot);
    Ok(Json(view))
}

pub async fn delete_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id, item_id)): Path<(String, String, String)>,
) -> Result<Json<AttemptView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let key = AttemptKey::new(learner_id, exam_id);
    let (view, snapshot) = state
        .with_attempt(&key, |session| {
            session
                .clear_response(&item_id)
                .map(|_| (attempt_view(session), session.snapshot()))
        })
        .ok_or_else(|| attempt_not_found(req_id.clone()))?
        .map_err(|err| AppError::from_attempt(err, req_id))?;
    state.autosaver.request(&key, snapshot);
    Ok(Json(view))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkToggled {
    /// `None` when the current slot is an intro or end page.
    pub bookmarked: Option<bool>,
    pub attempt: AttemptView,
}

pub async fn toggle_bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id)): Path<(String, String)>,
) -> Result<Json<BookmarkToggled>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let key = AttemptKey::new(learner_id, exam_id);
    let (bookmarked, attempt, snapshot) = state
        .with_attempt(&key, |session| {
            session
                .toggle_bookmark()
                .map(|flag| (flag, attempt_view(session), session.snapshot()))
        })
        .ok_or_else(|| attempt_not_found(req_id.clone()))?
        .map_err(|err| AppError::from_attempt(err, req_id))?;
    if bookmarked.is_some() {
        state.autosaver.save_now(&key, snapshot).await;
    }
    Ok(Json(BookmarkToggled { bookmarked, attempt }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct NotePayload {
    #[validate(length(max = 10000))]
    pub text: String,
}

pub async fn put_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id, item_id)): Path<(String, String, String)>,
    Json(payload): Json<NotePayload>,
) -> Result<Json<AttemptView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    payload.validate().map_err(|e| validation_error(e, req_id.clone()))?;
    let key = AttemptKey::new(learner_id, exam_id);
    let (view, snapshot) = state
        .with_attempt(&key, |session| {
            session
                .set_note(&item_id, &payload.text)
                .map(|_| (attempt_view(session), session.snapshot()))
        })
        .ok_or_else(|| attempt_not_found(req_id.clone()))?
        .map_err(|err| AppError::from_attempt(err, req_id))?;
    state.autosaver.request(&key, snapshot);
    Ok(Json(view))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPanel {
    pub review_open: bool,
}

pub async fn toggle_review_panel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id)): Path<(String, String)>,
) -> Result<Json<ReviewPanel>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let key = AttemptKey::new(learner_id, exam_id);
    let review_open = state
        .with_attempt(&key, |session| session.toggle_review())
        .ok_or_else(|| attempt_not_found(req_id))?;
    Ok(Json(ReviewPanel { review_open }))
}

#[derive(Debug, Deserialize)]
pub struct ReviewQuery {
    #[serde(default)]
    pub tab: ReviewTab,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub tab: ReviewTab,
    pub counts: ReviewCounts,
    pub groups: Vec<ReviewGroup>,
}

pub async fn review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id)): Path<(String, String)>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<ReviewResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let key = AttemptKey::new(learner_id, exam_id);
    state
        .with_attempt(&key, |session| ReviewResponse {
            tab: query.tab,
            counts: session.counts(),
            groups: session.review(query.tab),
        })
        .map(Json)
        .ok_or_else(|| attempt_not_found(req_id))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPayload {
    /// Section kind -> display label, e.g. `ela_a` and `ela_b` both shown as "Reading".
    #[serde(default)]
    pub display_groups: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub report: ScoreReport,
    pub display_groups: Vec<DisplayGroupScore>,
}

pub async fn submit_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((exam_id, learner_id)): Path<(String, String)>,
    payload: Option<Json<SubmitPayload>>,
) -> Result<Json<SubmitResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let key = AttemptKey::new(learner_id, exam_id);
    let (report, snapshot) = state
        .with_attempt(&key, |session| {
            let snapshot = session.snapshot();
            (session.submit().clone(), snapshot)
        })
        .ok_or_else(|| attempt_not_found(req_id))?;

    // final answers land even if the debounce window has not closed yet
    state.autosaver.save_now(&key, snapshot).await;
    info!(exam_id = %key.exam_id, learner_id = %key.learner_id, "score report issued");

    let display_groups = regroup(&report.per_section, label_from_map(&payload.display_groups));
    Ok(Json(SubmitResponse { report, display_groups }))
}
