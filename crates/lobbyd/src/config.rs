use std::path::PathBuf;

/// Process configuration, loaded from environment variables.
///
/// Everything an operator may change at runtime lives in the persisted
/// [`crate::settings::Settings`] instead.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite directory database.
    pub db_path: PathBuf,
    /// Path to the persisted TOML settings.
    pub settings_path: PathBuf,
    /// Path to the persisted activation state.
    pub state_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Font used for overlay labels; boxes are drawn without text when unset.
    pub font_path: Option<PathBuf>,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `LOBBY_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = data_dir();

        Self {
            db_path: env_path("LOBBY_DB_PATH").unwrap_or_else(|| data_dir.join("lobby.db")),
            settings_path: env_path("LOBBY_SETTINGS_PATH")
                .unwrap_or_else(|| data_dir.join("settings.toml")),
            state_path: env_path("LOBBY_STATE_PATH")
                .unwrap_or_else(|| data_dir.join("activation.json")),
            model_dir: env_path("LOBBY_MODEL_DIR").unwrap_or_else(|| data_dir.join("models")),
            font_path: env_path("LOBBY_FONT_PATH"),
            system_bus: env_bool("LOBBY_SYSTEM_BUS", false),
        }
    }
}

/// `$XDG_DATA_HOME/lobby`, falling back to `~/.local/share/lobby`.
fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("lobby")
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
        .unwrap_or(default)
}
