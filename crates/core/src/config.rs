use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

// ── Top-level config ──────────────────────────────────────────

/// Process-level settings: where state lives and where definitions come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub paths: PathsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `VISTA_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("VISTA_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        Self {
            paths: PathsConfig::from_env_profiled(&p),
            profile: p,
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  state_dir:      {}", self.paths.state_dir.display());
        tracing::info!("  work_dir:       {}", self.paths.work_dir.display());
        tracing::info!("  views_file:     {}", self.paths.views_file.display());
        tracing::info!(
            "  scheduler_file: {}",
            self.paths
                .scheduler_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(defaults)".into())
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::for_profile("")
    }
}

// ── Paths ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding persisted view state and digests.
    pub state_dir: PathBuf,
    /// Base directory for relative paths used by local drivers.
    pub work_dir: PathBuf,
    /// TOML file with view definitions.
    pub views_file: PathBuf,
    /// Optional TOML file with scheduler settings.
    pub scheduler_file: Option<PathBuf>,
}

impl PathsConfig {
    pub fn from_env_profiled(p: &str) -> Self {
        Self {
            state_dir: PathBuf::from(profiled_env_or(p, "VISTA_STATE_DIR", "data/state")),
            work_dir: PathBuf::from(profiled_env_or(p, "VISTA_WORK_DIR", ".")),
            views_file: PathBuf::from(profiled_env_or(p, "VISTA_VIEWS_FILE", "config/views.toml")),
            scheduler_file: profiled_env_opt(p, "VISTA_SCHEDULER_FILE").map(PathBuf::from),
        }
    }
}
