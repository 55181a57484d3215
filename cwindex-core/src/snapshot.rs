//! On-disk snapshot of indexed state and cached computations.

use chrono::Utc;
use cwindex_incremental::StoreSnapshot;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SNAPSHOT_VERSION: &str = "1";
const SNAPSHOT_FILENAME: &str = "state.json";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: &'a str,
    generated_at: String,
    chain_id: &'a str,
    state: &'a StoreSnapshot,
}

#[derive(Deserialize)]
struct SnapshotFile {
    version: String,
    #[allow(dead_code)]
    generated_at: String,
    chain_id: String,
    state: StoreSnapshot,
}

pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_FILENAME)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write the snapshot through a temporary file so a crash never leaves a
/// half-written state file behind.
pub fn save(
    data_dir: &Path,
    chain_id: &str,
    state: &StoreSnapshot,
) -> Result<PathBuf, SnapshotError> {
    fs::create_dir_all(data_dir).map_err(io_error(data_dir))?;

    let payload = SnapshotRef {
        version: SNAPSHOT_VERSION,
        generated_at: Utc::now().to_rfc3339(),
        chain_id,
        state,
    };
    let json = serde_json::to_vec(&payload)?;

    let path = snapshot_path(data_dir);
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_error(&tmp))?;
    fs::rename(&tmp, &path).map_err(io_error(&path))?;

    tracing::debug!(path = %path.display(), "snapshot written");
    Ok(path)
}

/// Load the snapshot if present and compatible.
pub fn load(data_dir: &Path, chain_id: &str) -> Result<Option<StoreSnapshot>, SnapshotError> {
    let path = snapshot_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }

    let data = fs::read(&path).map_err(io_error(&path))?;
    match serde_json::from_slice::<SnapshotFile>(&data) {
        Ok(file) if file.version != SNAPSHOT_VERSION => {
            tracing::warn!(
                "Ignoring snapshot {:?} with version {} (expected {})",
                path,
                file.version,
                SNAPSHOT_VERSION
            );
            Ok(None)
        }
        Ok(file) if file.chain_id != chain_id => {
            tracing::warn!(
                "Ignoring snapshot {:?} for chain {} (configured for {})",
                path,
                file.chain_id,
                chain_id
            );
            Ok(None)
        }
        Ok(file) => Ok(Some(file.state)),
        Err(err) => {
            tracing::warn!("Failed to parse snapshot {:?}: {}", path, err);
            Ok(None)
        }
    }
}
