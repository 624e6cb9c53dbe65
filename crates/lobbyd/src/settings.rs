//! Operator settings, persisted as TOML.
//!
//! Sources are read when an adapter starts; changes only take effect for
//! adapters launched afterwards.

use lobby_core::TieBreak;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to persist settings: {0}")]
    Persist(#[source] std::io::Error),
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Where frames come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CameraSource {
    /// Frames arrive only from interactive sessions.
    Push,
    /// Local camera 0.
    #[default]
    Default,
    Device { device_index: u32 },
    Network { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    pub threshold: f32,
    pub tie_break: TieBreak,
    pub cooldown_secs: u64,
    pub canonical_width: u32,
    pub canonical_height: u32,
    pub draw_boxes: bool,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            tie_break: TieBreak::LastWins,
            cooldown_secs: 10,
            canonical_width: 640,
            canonical_height: 480,
            draw_boxes: true,
        }
    }
}

impl RecognitionSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Theming pushed to display screens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Seconds a recognition stays on screen.
    pub timer: u32,
    pub background_color: String,
    pub font_color: String,
    pub use_background_image: bool,
    pub background_image: Option<String>,
    pub font_family: String,
    pub font_size: String,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            timer: 5,
            background_color: "#FFE8D4".into(),
            font_color: "#032F5C".into(),
            use_background_image: false,
            background_image: None,
            font_family: "Inter".into(),
            font_size: "medium".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Bound of every stream's output queue.
    pub queue_capacity: usize,
    pub jpeg_quality: u8,
    /// Pause after a failed frame read.
    pub read_retry_ms: u64,
    /// How long a pulled-stream consumer waits for the next frame.
    pub frame_wait_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            jpeg_quality: 80,
            read_retry_ms: 100,
            frame_wait_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Relaunch the background worker when the daemon starts in the Active state.
    pub resume_on_boot: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            resume_on_boot: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraSource,
    pub recognition: RecognitionSettings,
    pub display: DisplaySettings,
    pub stream: StreamSettings,
    pub supervisor: SupervisorSettings,
    pub detection: DetectionSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let r = &self.recognition;
        if !(-1.0..=1.0).contains(&r.threshold) {
            return Err(SettingsError::Invalid(format!(
                "recognition.threshold must be within [-1, 1], got {}",
                r.threshold
            )));
        }
        if r.canonical_width == 0 || r.canonical_height == 0 {
            return Err(SettingsError::Invalid("canonical resolution must be non-zero".into()));
        }
        if self.stream.queue_capacity == 0 {
            return Err(SettingsError::Invalid("stream.queue_capacity must be at least 1".into()));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(SettingsError::Invalid("stream.jpeg_quality must be within 1..=100".into()));
        }
        if let CameraSource::Network { url } = &self.camera {
            if url.trim().is_empty() {
                return Err(SettingsError::Invalid("camera.url must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Settings held in memory and mirrored to disk on every change.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let settings = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<Settings>(&text).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no settings file; using defaults");
                Settings::default()
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        settings.validate()?;

        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(settings),
        })
    }

    pub fn get(&self) -> Settings {
        self.current.read().clone()
    }

    /// Apply `change`, persist, then make it current.
    ///
    /// On any failure the previous settings stay in effect.
    pub fn update<F>(&self, change: F) -> Result<Settings, SettingsError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut current = self.current.write();
        let mut next = current.clone();
        change(&mut next);
        next.validate()?;

        let text = toml::to_string_pretty(&next)?;
        write_atomic(&self.path, text.as_bytes()).map_err(SettingsError::Persist)?;

        *current = next.clone();
        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(next)
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
}
