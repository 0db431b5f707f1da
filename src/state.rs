use crate::config::Config;
use crate::flatten::{flatten_exam, FlattenedExam};
use crate::models::Exam;
use crate::persistence::{
    restore_snapshot, AttemptKey, AttemptSnapshot, AttemptStore, Autosaver, Clock, SystemClock,
};
use crate::session::AttemptSession;
use crate::source::ExamSource;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub exams: Arc<RwLock<HashMap<String, Arc<FlattenedExam>>>>,
    pub attempts: Arc<DashMap<AttemptKey, AttemptSession>>,
    pub exam_source: Arc<dyn ExamSource>,
    pub store: Arc<dyn AttemptStore>,
    pub autosaver: Arc<Autosaver>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStart {
    /// A fresh session; `restored` tells whether saved work was found.
    Started { restored: bool },
    /// The attempt was already live in memory.
    Resumed,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn AttemptStore>, exam_source: Arc<dyn ExamSource>) -> Self {
        Self::with_clock(config, store, exam_source, Arc::new(SystemClock::default()))
    }

    pub fn with_clock(
        config: Config,
        store: Arc<dyn AttemptStore>,
        exam_source: Arc<dyn ExamSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let autosaver = Arc::new(Autosaver::new(store.clone(), clock.clone(), config.autosave_debounce));
        Self {
            exams: Arc::new(RwLock::new(HashMap::new())),
            attempts: Arc::new(DashMap::new()),
            exam_source,
            store,
            autosaver,
            clock,
            config,
        }
    }

    /// Flattens and caches an exam, replacing any earlier definition with the same id.
    /// Attempts already running keep the definition they started with.
    pub async fn register_exam(&self, exam: &Exam) -> Arc<FlattenedExam> {
        let flat = Arc::new(flatten_exam(exam));
        info!(
            exam_id = %flat.exam_id,
            items = flat.item_count,
            skipped = flat.skipped.len(),
            "exam registered"
        );
        self.exams.write().await.insert(flat.exam_id.clone(), flat.clone());
        flat
    }

    /// Cached exam, or a one-shot fetch from the exam source.
    pub async fn exam(&self, exam_id: &str) -> anyhow::Result<Option<Arc<FlattenedExam>>> {
        if let Some(flat) = self.exams.read().await.get(exam_id).cloned() {
            return Ok(Some(flat));
        }
        match self.exam_source.fetch_exam(exam_id).await? {
            Some(exam) => Ok(Some(self.register_exam(&exam).await)),
            None => Ok(None),
        }
    }

    /// Starts an attempt, restoring autosaved work when there is any. Returns
    /// `None` when the exam cannot be found.
    pub async fn start_attempt(&self, key: AttemptKey) -> anyhow::Result<Option<AttemptStart>> {
        if self.attempts.contains_key(&key) {
            return Ok(Some(AttemptStart::Resumed));
        }
        let Some(exam) = self.exam(&key.exam_id).await? else {
            return Ok(None);
        };

        let snapshot = restore_snapshot(self.store.as_ref(), &key).await;
        let restored = snapshot != AttemptSnapshot::default();
        let mut session = AttemptSession::new(key.clone(), exam, self.clock.clone());
        session.restore(snapshot);
        let initial = (!restored).then(|| session.snapshot());
        info!(exam_id = %key.exam_id, learner_id = %key.learner_id, restored, "attempt started");

        // another request may have started the same attempt while we were loading
        let start = match self.attempts.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => AttemptStart::Resumed,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                AttemptStart::Started { restored }
            }
        };
        // the start time must survive a restart before the first edit
        if let (AttemptStart::Started { .. }, Some(initial)) = (start, initial) {
            self.autosaver.save_now(&key, initial).await;
        }
        Ok(Some(start))
    }

    /// Runs `f` against a live attempt without holding the map guard across an await.
    pub fn with_attempt<T>(&self, key: &AttemptKey, f: impl FnOnce(&mut AttemptSession) -> T) -> Option<T> {
        self.attempts.get_mut(key).map(|mut session| {
            let session = session.value_mut();
            session.touch();
            f(session)
        })
    }

    /// Moves attempts idle for longer than the configured ttl out of memory, saving
    /// each one's final snapshot. A later start restores it from the store.
    pub async fn evict_idle(&self) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(self.config.attempt_idle_ttl) else {
            return 0;
        };
        let cutoff = self.clock.wall() - ttl;
        let idle: Vec<AttemptKey> = self
            .attempts
            .iter()
            .filter(|entry| entry.last_active() <= cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in idle {
            // activity after the scan keeps the attempt alive
            let Some((key, session)) = self.attempts.remove_if(&key, |_, s| s.last_active() <= cutoff) else {
                continue;
            };
            self.autosaver.save_now(&key, session.snapshot()).await;
            self.autosaver.forget(&key);
            debug!(exam_id = %key.exam_id, learner_id = %key.learner_id, "idle attempt evicted");
            evicted += 1;
        }
        if evicted > 0 {
            info!(evicted, "idle attempts moved out of memory");
        }
        evicted
    }

    pub fn spawn_autosave_worker(&self) -> tokio::task::JoinHandle<()> {
        self.autosaver.clone().spawn_worker(self.config.autosave_tick)
    }

    pub fn spawn_eviction_worker(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        let tick = self.config.attempt_idle_ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                state.evict_idle().await;
            }
        })
    }
}
