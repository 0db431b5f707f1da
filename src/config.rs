use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// File-backed attempt snapshots live here; in-memory when unset.
    pub attempt_state_dir: Option<PathBuf>,
    pub exam_dir: Option<PathBuf>,
    pub autosave_debounce: Duration,
    pub autosave_tick: Duration,
    /// Live attempts untouched for this long are saved and dropped from memory.
    pub attempt_idle_ttl: Duration,
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            attempt_state_dir: None,
            exam_dir: None,
            autosave_debounce: Duration::from_millis(400),
            autosave_tick: Duration::from_millis(100),
            attempt_idle_ttl: Duration::from_secs(30 * 60),
            cors_origins: vec!["http://localhost:5173".to_string()],
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_non_empty(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

impl Config {
    /// Reads the process environment after loading `.env`, falling back to defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        Self {
            host: env_non_empty("BACKEND_HOST").unwrap_or(defaults.host),
            port: env_non_empty("BACKEND_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            attempt_state_dir: env_non_empty("ATTEMPT_STATE_DIR").map(PathBuf::from),
            exam_dir: env_non_empty("EXAM_DIR").map(PathBuf::from),
            autosave_debounce: env_millis("AUTOSAVE_DEBOUNCE_MS").unwrap_or(defaults.autosave_debounce),
            autosave_tick: env_millis("AUTOSAVE_TICK_MS")
                .filter(|tick| !tick.is_zero())
                .unwrap_or(defaults.autosave_tick),
            attempt_idle_ttl: env_non_empty("ATTEMPT_IDLE_TTL_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.attempt_idle_ttl),
            cors_origins: env_non_empty("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|origin| origin.trim().to_string())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
        }
    }
}
