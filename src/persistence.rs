//! Best-effort autosave of in-progress attempts.
//!
//! Snapshots are a convenience cache, not the system of record: every failure
//! here is logged and swallowed so a broken store never blocks the learner.

use crate::answers::{AnswerStore, BookmarkSet, Notes};
use crate::error::StoreError;
use crate::session::AttemptStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

static UNSAFE_FILE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9.-]").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptKey {
    pub learner_id: String,
    pub exam_id: String,
}

fn escape_part(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

impl AttemptKey {
    pub fn new(learner_id: impl Into<String>, exam_id: impl Into<String>) -> Self {
        Self {
            learner_id: learner_id.into(),
            exam_id: exam_id.into(),
        }
    }

    /// Stable string key; distinct (learner, exam) pairs never collide.
    pub fn storage_key(&self) -> String {
        format!("attempt:{}:{}", escape_part(&self.exam_id), escape_part(&self.learner_id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSnapshot {
    #[serde(default)]
    pub answers: AnswerStore,
    #[serde(default)]
    pub bookmarks: BookmarkSet,
    #[serde(default)]
    pub notes: Notes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default)]
    pub status: AttemptStatus,
    /// Absent in records written before the attempt clock was persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn save(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get(key))
    }
}

/// One json file per attempt key under `dir`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let name = UNSAFE_FILE_CHARS.replace_all(key, |caps: &Captures| {
            caps[0].bytes().map(|b| format!("_{b:02x}")).collect::<String>()
        });
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl AttemptStore for FileStore {
    async fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let serialized = serde_json::to_vec_pretty(&value)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serialized).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw = match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

/// Reads the saved snapshot for `key`. Anything other than a clean record
/// yields an empty snapshot.
pub async fn restore_snapshot(store: &dyn AttemptStore, key: &AttemptKey) -> AttemptSnapshot {
    let storage_key = key.storage_key();
    match store.load(&storage_key).await {
        Ok(Some(value)) => match serde_json::from_value::<AttemptSnapshot>(value) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(key = %storage_key, "discarding corrupt attempt snapshot: {}", err);
                AttemptSnapshot::default()
            }
        },
        Ok(None) => AttemptSnapshot::default(),
        Err(err) => {
            warn!(key = %storage_key, "attempt store unavailable on restore: {}", err);
            AttemptSnapshot::default()
        }
    }
}

/// Time source for the debounce policy and attempt deadlines.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;
    fn wall(&self) -> DateTime<Utc>;
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Logical clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    base: DateTime<Utc>,
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            millis: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }

    fn wall(&self) -> DateTime<Utc> {
        let elapsed = i64::try_from(self.millis.load(Ordering::SeqCst)).unwrap_or(i64::MAX);
        self.base + chrono::Duration::milliseconds(elapsed)
    }
}

struct PendingSave {
    snapshot: AttemptSnapshot,
    due: Duration,
    seq: u64,
}

/// Trailing-edge debouncer in front of an `AttemptStore`. Each request carries a
/// full snapshot, so the latest one for a key simply replaces the earlier ones.
///
/// Every snapshot is stamped with a sequence number when it is handed over.
/// Writes for one key run one at a time, and a write older than the last one
/// that landed is dropped, so the store always ends on the newest snapshot.
pub struct Autosaver {
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
    pending: DashMap<String, PendingSave>,
    sequence: AtomicU64,
    /// Per-key write lock holding the sequence number of the last landed write.
    written: DashMap<String, Arc<Mutex<u64>>>,
}

impl Autosaver {
    pub fn new(store: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            store,
            clock,
            window,
            pending: DashMap::new(),
            sequence: AtomicU64::new(0),
            written: DashMap::new(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn request(&self, key: &AttemptKey, snapshot: AttemptSnapshot) {
        let due = self.clock.now() + self.window;
        let seq = self.next_seq();
        let storage_key = key.storage_key();
        debug!(key = %storage_key, seq, "autosave scheduled");
        self.pending.insert(storage_key, PendingSave { snapshot, due, seq });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Writes immediately and cancels any pending write for the same key.
    pub async fn save_now(&self, key: &AttemptKey, snapshot: AttemptSnapshot) -> bool {
        let seq = self.next_seq();
        let storage_key = key.storage_key();
        self.pending.remove(&storage_key);
        self.write(&storage_key, snapshot, seq).await
    }

    /// Writes every pending snapshot whose window has elapsed; returns how many landed.
    pub async fn flush_due(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.due <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut written = 0;
        for key in due {
            // a request that arrived after the scan pushed `due` forward again
            if let Some((key, pending)) = self.pending.remove_if(&key, |_, p| p.due <= now) {
                if self.write(&key, pending.snapshot, pending.seq).await {
                    written += 1;
                }
            }
        }
        written
    }

    pub async fn flush_all(&self) -> usize {
        let keys: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let mut written = 0;
        for key in keys {
            if let Some((key, pending)) = self.pending.remove(&key) {
                if self.write(&key, pending.snapshot, pending.seq).await {
                    written += 1;
                }
            }
        }
        written
    }

    /// Drops the write lock of a key nobody is writing to anymore.
    pub fn forget(&self, key: &AttemptKey) {
        let storage_key = key.storage_key();
        if !self.pending.contains_key(&storage_key) {
            self.written.remove_if(&storage_key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    async fn write(&self, key: &str, mut snapshot: AttemptSnapshot, seq: u64) -> bool {
        let lock = self
            .written
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone();
        let mut last = lock.lock().await;
        if seq <= *last {
            debug!(key = %key, seq, last = *last, "stale autosave skipped");
            return false;
        }

        snapshot.saved_at = Some(self.clock.wall());
        let value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %key, "failed to serialize attempt snapshot: {}", err);
                return false;
            }
        };
        match self.store.save(key, value).await {
            Ok(()) => {
                *last = seq;
                true
            }
            Err(err) => {
                warn!(key = %key, "autosave dropped: {}", err);
                false
            }
        }
    }

    pub fn spawn_worker(self: Arc<Self>, tick: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                self.flush_due().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Response;
    use serde_json::json;

    struct BrokenStore;

    #[async_trait]
    impl AttemptStore for BrokenStore {
        async fn save(&self, _key: &str, _value: Value) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }

        async fn load(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    fn snapshot_with(item: &str, choice: usize) -> AttemptSnapshot {
        let mut snapshot = AttemptSnapshot::default();
        snapshot.answers.set(item, Response::SingleChoice(choice));
        snapshot
    }

    fn saver(store: Arc<dyn AttemptStore>, clock: Arc<ManualClock>) -> Autosaver {
        Autosaver::new(store, clock, Duration::from_millis(400))
    }

    #[test]
    fn storage_keys_do_not_collide() {
        let a = AttemptKey::new("a:b", "c").storage_key();
        let b = AttemptKey::new("b", "c:a").storage_key();
        assert_ne!(a, b);
        assert_eq!(AttemptKey::new("kim", "sat-1").storage_key(), "attempt:sat-1:kim");
    }

    #[test]
    fn file_names_are_sanitized_injectively() {
        let store = FileStore::new("/tmp/attempts");
        let one = store.path_for("attempt:x:a_b");
        let two = store.path_for("attempt:x:a/b");
        assert_ne!(one, two);
        assert!(one.to_string_lossy().ends_with("attempt_3ax_3aa_5fb.json"));
    }

    #[tokio::test]
    async fn rapid_requests_coalesce_into_last_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let autosave = saver(store.clone(), clock.clone());
        let key = AttemptKey::new("learner", "exam");

        autosave.request(&key, snapshot_with("q1", 0));
        clock.advance(Duration::from_millis(150));
        autosave.request(&key, snapshot_with("q1", 1));
        clock.advance(Duration::from_millis(150));
        autosave.request(&key, snapshot_with("q1", 2));

        assert_eq!(autosave.flush_due().await, 0);
        clock.advance(Duration::from_millis(399));
        assert_eq!(autosave.flush_due().await, 0);
        clock.advance(Duration::from_millis(1));
        assert_eq!(autosave.flush_due().await, 1);
        assert_eq!(autosave.pending_count(), 0);

        let restored = restore_snapshot(store.as_ref(), &key).await;
        assert_eq!(restored.answers.get("q1"), Some(&Response::SingleChoice(2)));
        assert!(restored.saved_at.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn save_now_skips_the_window_and_cancels_pending() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let autosave = saver(store.clone(), clock.clone());
        let key = AttemptKey::new("learner", "exam");

        autosave.request(&key, snapshot_with("q1", 0));
        let mut marked = snapshot_with("q1", 0);
        marked.bookmarks.toggle("q1");
        assert!(autosave.save_now(&key, marked).await);
        assert_eq!(autosave.pending_count(), 0);

        let restored = restore_snapshot(store.as_ref(), &key).await;
        assert!(restored.bookmarks.contains("q1"));
    }

    /// Holds writes of bookmark-free snapshots long enough for a newer save to queue up.
    struct SlowStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl AttemptStore for SlowStore {
        async fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
            if value["bookmarks"].as_array().map_or(true, |marks| marks.is_empty()) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.inner.save(key, value).await
        }

        async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.load(key).await
        }
    }

    #[tokio::test]
    async fn in_flight_debounced_write_cannot_bury_a_later_save() {
        let store = Arc::new(SlowStore { inner: MemoryStore::new() });
        let clock = Arc::new(ManualClock::new());
        let autosave = Arc::new(saver(store.clone(), clock.clone()));
        let key = AttemptKey::new("learner", "exam");

        autosave.request(&key, snapshot_with("q1", 0));
        clock.advance(Duration::from_millis(400));
        let flushing = tokio::spawn({
            let autosave = autosave.clone();
            async move { autosave.flush_due().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut marked = snapshot_with("q1", 0);
        marked.bookmarks.toggle("q1");
        assert!(autosave.save_now(&key, marked).await);
        assert_eq!(flushing.await.unwrap(), 1);

        let restored = restore_snapshot(store.as_ref(), &key).await;
        assert!(restored.bookmarks.contains("q1"));
    }

    #[tokio::test]
    async fn older_snapshot_is_skipped_once_a_newer_one_landed() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let autosave = saver(store.clone(), clock.clone());
        let key = AttemptKey::new("learner", "exam");

        let stale = autosave.next_seq();
        let mut marked = snapshot_with("q1", 1);
        marked.bookmarks.toggle("q1");
        assert!(autosave.save_now(&key, marked).await);
        assert!(!autosave.write(&key.storage_key(), snapshot_with("q1", 0), stale).await);

        let restored = restore_snapshot(store.as_ref(), &key).await;
        assert_eq!(restored.answers.get("q1"), Some(&Response::SingleChoice(1)));
        assert!(restored.bookmarks.contains("q1"));

        autosave.forget(&key);
        assert!(autosave.written.is_empty());
    }

    #[tokio::test]
    async fn concurrent_file_writes_leave_a_readable_record() {
        let dir = std::env::temp_dir().join(format!("exam-attempts-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(FileStore::new(&dir));
        let key = AttemptKey::new("learner", "exam").storage_key();

        let writers: Vec<_> = (0..8)
            .map(|choice| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    store
                        .save(&key, serde_json::to_value(snapshot_with("q1", choice)).unwrap())
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let value = store.load(&key).await.unwrap().unwrap();
        assert!(serde_json::from_value::<AttemptSnapshot>(value).is_ok());
        let mut leftovers = tokio::fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names.len(), 1, "{names:?}");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn manual_clock_moves_wall_time_with_it() {
        let base = Utc::now();
        let clock = ManualClock::starting_at(base);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), Duration::from_secs(90));
        assert_eq!(clock.wall(), base + chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn flush_all_writes_every_pending_key() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let autosave = saver(store.clone(), clock);
        autosave.request(&AttemptKey::new("a", "exam"), snapshot_with("q", 1));
        autosave.request(&AttemptKey::new("b", "exam"), snapshot_with("q", 2));
        assert_eq!(autosave.flush_all().await, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let clock = Arc::new(ManualClock::new());
        let autosave = saver(Arc::new(BrokenStore), clock.clone());
        let key = AttemptKey::new("learner", "exam");

        autosave.request(&key, snapshot_with("q1", 0));
        clock.advance(Duration::from_secs(1));
        assert_eq!(autosave.flush_due().await, 0);
        assert_eq!(autosave.pending_count(), 0);
        assert!(!autosave.save_now(&key, AttemptSnapshot::default()).await);

        let restored = restore_snapshot(&BrokenStore, &key).await;
        assert_eq!(restored, AttemptSnapshot::default());
    }

    #[tokio::test]
    async fn corrupt_or_missing_records_restore_empty() {
        let store = MemoryStore::new();
        let key = AttemptKey::new("learner", "exam");
        assert_eq!(restore_snapshot(&store, &key).await, AttemptSnapshot::default());

        store
            .save(&key.storage_key(), json!({"answers": {"q1": {"single_choice": "not a number"}}}))
            .await
            .unwrap();
        assert_eq!(restore_snapshot(&store, &key).await, AttemptSnapshot::default());
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("exam-attempts-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(&dir);
        let key = AttemptKey::new("learner/1", "exam");

        assert!(store.load(&key.storage_key()).await.unwrap().is_none());
        store
            .save(&key.storage_key(), serde_json::to_value(snapshot_with("q9", 3)).unwrap())
            .await
            .unwrap();
        let restored = restore_snapshot(&store, &key).await;
        assert_eq!(restored.answers.get("q9"), Some(&Response::SingleChoice(3)));

        tokio::fs::write(store.path_for(&key.storage_key()), "{ not json").await.unwrap();
        assert!(matches!(store.load(&key.storage_key()).await, Err(StoreError::Corrupt(_))));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
