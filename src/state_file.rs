//! JSON snapshot of issued keys for single-instance deployments.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::ApiKey;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyStateFile {
    #[serde(default)]
    pub keys: Vec<ApiKey>,
}

#[derive(Debug, Error)]
pub enum KeyStateFileError {
    #[error("read state file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse state file failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("write state file failed: {0}")]
    Write(std::io::Error),
}

impl KeyStateFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyStateFileError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes via a temp file and rename where possible so a crash mid-save
    /// cannot leave a truncated snapshot behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), KeyStateFileError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(KeyStateFileError::Write)?;
            }
        }

        let payload = serde_json::to_vec_pretty(self).map_err(KeyStateFileError::Parse)?;
        let tmp_path = path.with_extension("tmp");
        if fs::write(&tmp_path, &payload).is_ok() && fs::rename(&tmp_path, path).is_ok() {
            return Ok(());
        }

        let _ = fs::remove_file(&tmp_path);
        fs::write(path, payload).map_err(KeyStateFileError::Write)
    }
}
