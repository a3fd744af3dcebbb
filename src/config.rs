//! Runtime settings: a JSON file under the data directory plus a couple of
//! environment overrides.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::collaborators::CollaboratorOp;
use crate::db::WritePolicy;
use crate::retrieval::RetrievalConfig;

pub const DATA_DIR_ENV: &str = "FRAMECHAT_DATA_DIR";
pub const DEBUG_ENV: &str = "FRAMECHAT_DEBUG";

const SETTINGS_FILE: &str = "settings.json";
const DATABASE_FILE: &str = "framechat.sqlite3";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_frames: usize,
    pub caption_batch_size: usize,
    pub detection_batch_size: usize,
    pub max_concurrent_videos: usize,

    pub extract_timeout_secs: u64,
    pub caption_timeout_secs: u64,
    pub transcribe_timeout_secs: u64,
    pub detect_timeout_secs: u64,
    pub completion_timeout_secs: u64,

    pub write_attempts: u32,
    pub write_backoff_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_frames: 100,
            caption_batch_size: 8,
            detection_batch_size: 8,
            max_concurrent_videos: 2,
            extract_timeout_secs: 120,
            caption_timeout_secs: 60,
            transcribe_timeout_secs: 300,
            detect_timeout_secs: 60,
            completion_timeout_secs: 30,
            write_attempts: 3,
            write_backoff_ms: 25,
        }
    }
}

impl PipelineSettings {
    pub fn timeout_for(&self, op: CollaboratorOp) -> Duration {
        let secs = match op {
            CollaboratorOp::ExtractFrames => self.extract_timeout_secs,
            CollaboratorOp::Caption => self.caption_timeout_secs,
            CollaboratorOp::Transcribe => self.transcribe_timeout_secs,
            CollaboratorOp::DetectObjects => self.detect_timeout_secs,
            CollaboratorOp::Complete => self.completion_timeout_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            max_attempts: self.write_attempts.max(1),
            backoff_ms: self.write_backoff_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    /// Turns of memory fed back into the prompt
    pub history_limit: usize,
    /// Character budget for the evidence section of the prompt
    pub max_context_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            history_limit: 10,
            max_context_chars: 4000,
            temperature: 0.3,
            max_tokens: 512,
            system_prompt: "You answer questions about a single video. Use only the evidence \
                provided, cite timestamps as m:ss, and say plainly when the evidence does not \
                cover the question."
                .into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub debug: bool,
    pub pipeline: PipelineSettings,
    pub retrieval: RetrievalConfig,
    pub conversation: ConversationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("framechat-data"),
            debug: false,
            pipeline: PipelineSettings::default(),
            retrieval: RetrievalConfig::default(),
            conversation: ConversationSettings::default(),
        }
    }
}

impl Settings {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn log_level(&self) -> log::LevelFilter {
        if self.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }

    /// Apply `FRAMECHAT_DATA_DIR` and `FRAMECHAT_DEBUG` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Debug mode turns on debug logging
    /// and makes store writes fail fast with no backoff.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|dir| !dir.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup(DEBUG_ENV) {
            if matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                self.debug = true;
                self.pipeline.write_attempts = 1;
                self.pipeline.write_backoff_ms = 0;
            }
        }
        self
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    /// Load `<data_dir>/settings.json`, where the data dir comes from the
    /// environment or the default.
    pub fn open_default() -> Result<Self> {
        let data_dir = Settings::default().with_env_overrides().data_dir;
        Self::new(data_dir.join(SETTINGS_FILE))
    }

    /// Load settings from `path`. A missing or unreadable file yields the
    /// defaults; environment overrides are applied on top either way.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed settings at {}: {err}", path.display());
                Settings::default()
            })
        } else {
            Settings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data.with_env_overrides()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Settings {
        self.read().clone()
    }

    pub fn update(&self, apply: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut guard = self.write();
        let mut next = guard.clone();
        apply(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: Settings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings at {}", self.path.display()))?;
        *self.write() = data.with_env_overrides();
        Ok(())
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized)
            .with_context(|| format!("Failed to write settings to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults_per_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"pipeline": {"max_frames": 40}}"#).unwrap();

        let store = SettingsStore::new(path).unwrap();
        let settings = store.settings();
        assert_eq!(settings.pipeline.max_frames, 40);
        assert_eq!(settings.pipeline.caption_batch_size, 8);
        assert_eq!(settings.conversation.history_limit, 10);
    }

    #[test]
    fn update_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        store
            .update(|settings| settings.retrieval.default_top_k = 3)
            .unwrap();

        let reopened: Settings = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reopened.retrieval.default_top_k, 3);
    }

    #[test]
    fn debug_override_disables_write_backoff() {
        let settings = Settings::default().with_overrides(|key| match key {
            DEBUG_ENV => Some("true".into()),
            DATA_DIR_ENV => Some("/srv/framechat".into()),
            _ => None,
        });
        assert!(settings.debug);
        assert_eq!(settings.data_dir, PathBuf::from("/srv/framechat"));
        assert_eq!(settings.pipeline.write_policy(), WritePolicy { max_attempts: 1, backoff_ms: 0 });
        assert_eq!(settings.log_level(), log::LevelFilter::Debug);
    }
}
