pub mod answers;
pub mod config;
pub mod error;
pub mod flatten;
pub mod handlers;
pub mod models;
pub mod persistence;
pub mod routes;
pub mod scoring;
pub mod session;
pub mod source;
pub mod state;

use std::sync::Arc;

/// Picks the attempt store and exam source the configuration asks for.
pub fn build_state(config: config::Config) -> anyhow::Result<state::AppState> {
    let store: Arc<dyn persistence::AttemptStore> = match &config.attempt_state_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            tracing::info!("attempt snapshots stored under {}", dir.display());
            Arc::new(persistence::FileStore::new(dir.clone()))
        }
        None => {
            tracing::warn!("ATTEMPT_STATE_DIR not set, attempt snapshots kept in memory only");
            Arc::new(persistence::MemoryStore::new())
        }
    };
    let exam_source: Arc<dyn source::ExamSource> = match &config.exam_dir {
        Some(dir) => Arc::new(source::DirectoryExamSource::new(dir.clone())),
        None => Arc::new(source::NoExamSource),
    };
    Ok(state::AppState::new(config, store, exam_source))
}
