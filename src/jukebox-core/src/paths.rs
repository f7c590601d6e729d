//! Where the supervisor keeps its files.
//!
//! ```text
//! <config_dir>/config.toml      core settings and plugin table
//! <config_dir>/eventmap.toml    user rules layered over the built-in map
//! <log_dir>/jukebox.log.<date>  rolling log files
//! ```
//!
//! `--user-dir` puts all of it below one directory, which is how the box is
//! usually set up (a writable partition on the SD card).

use crate::{APP_AUTHOR, APP_NAME, APP_QUALIFIER};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_FILE: &str = "config.toml";
const LOG_SUBDIR: &str = "logs";

#[derive(Debug, Clone)]
pub struct AppDirs {
    config_dir: PathBuf,
    log_dir: PathBuf,
}

impl AppDirs {
    /// Platform defaults, e.g. `~/.config/jukebox` and
    /// `~/.local/share/jukebox/logs` on Linux.
    pub fn discover() -> Result<Self, DirsError> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_AUTHOR, APP_NAME)
            .ok_or(DirsError::MissingProjectDirs)?;
        Ok(Self {
            config_dir: dirs.config_dir().to_path_buf(),
            log_dir: dirs.data_dir().join(LOG_SUBDIR),
        })
    }

    /// Keep config, event map and logs below one user directory.
    pub fn with_user_dir(user_dir: impl Into<PathBuf>) -> Self {
        let root = user_dir.into();
        Self {
            log_dir: root.join(LOG_SUBDIR),
            config_dir: root,
        }
    }

    pub fn ensure_exists(&self) -> Result<(), DirsError> {
        for dir in [&self.config_dir, &self.log_dir] {
            std::fs::create_dir_all(dir).map_err(|source| DirsError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Resolve the configured event map file; relative paths are taken from
    /// the config directory.
    pub fn eventmap_file(&self, user_file: &Path) -> PathBuf {
        if user_file.is_absolute() {
            user_file.to_path_buf()
        } else {
            self.config_dir.join(user_file)
        }
    }
}

#[derive(Debug, Error)]
pub enum DirsError {
    #[error("unable to determine project directories for the jukebox")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}
