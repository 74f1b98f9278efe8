use std::path::PathBuf;

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");

/// Expand a leading `~` (and `$VAR` references) in a user-supplied path.
pub fn expand_tilde(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

pub fn asset_dir() -> PathBuf {
    let path = if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("dev", "taskboard", "taskboard")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".taskboard"))
    };

    if !path.exists()
        && let Err(e) = std::fs::create_dir_all(&path)
    {
        tracing::warn!(path = ?path, error = %e, "Failed to create asset directory");
    }

    path
    // macOS → ~/Library/Application Support/dev.taskboard.taskboard
    // Linux → ~/.local/share/taskboard   (respects XDG_DATA_HOME)
    // Windows → %APPDATA%\taskboard\taskboard
}

/// Get the database file path.
///
/// Respects the `TASKBOARD_DATABASE_PATH` environment variable for custom
/// locations. Supports tilde expansion (e.g., `~/taskboard/db.sqlite`).
///
/// Default: `{asset_dir}/db.sqlite`
pub fn database_path() -> PathBuf {
    if let Ok(path) = std::env::var("TASKBOARD_DATABASE_PATH") {
        return expand_tilde(&path);
    }
    asset_dir().join("db.sqlite")
}

/// Get the log directory path.
///
/// Respects `TASKBOARD_LOG_DIR`. Default: `{asset_dir}/logs`
pub fn log_dir() -> PathBuf {
    if let Ok(path) = std::env::var("TASKBOARD_LOG_DIR") {
        return expand_tilde(&path);
    }
    asset_dir().join("logs")
}
