//! Durable state of the governance sync loop, kept in a single JSON file that
//! is rewritten whole on every save.

use crate::config::SyncStateConfig;
use crate::types::FinalizeRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SyncStateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Releases in a terminal state, keyed by release id
    #[serde(default)]
    pub finalized_states: BTreeMap<String, FinalizeRecord>,
    #[serde(default)]
    pub pending_states: BTreeMap<String, FinalizeRecord>,
    #[serde(default)]
    pub finalize_cursor: Option<String>,
    #[serde(default)]
    pub last_applied_version: Option<u64>,
}

impl SyncState {
    /// Folds a finalize feed entry into the state. Returns true when the
    /// release became finalized with this call.
    pub fn record(&mut self, record: FinalizeRecord, max_finalized: usize, max_pending: usize) -> bool {
        let release_id = record.release_id.clone();
        let newly_finalized = if record.status.is_terminal() {
            self.pending_states.remove(&release_id);
            self.finalized_states.insert(release_id, record).is_none()
        } else {
            if !self.finalized_states.contains_key(&release_id) {
                self.pending_states.insert(release_id, record);
            }
            false
        };

        self.enforce_caps(max_finalized, max_pending);
        newly_finalized
    }

    pub fn enforce_caps(&mut self, max_finalized: usize, max_pending: usize) {
        evict_oldest(&mut self.finalized_states, max_finalized);
        evict_oldest(&mut self.pending_states, max_pending);
    }
}

/// Drops the least recently updated entries, ties broken by release id.
fn evict_oldest(states: &mut BTreeMap<String, FinalizeRecord>, max: usize) {
    if states.len() <= max {
        return;
    }

    let mut by_age: Vec<(u64, String)> = states
        .values()
        .map(|r| (r.updated_at_epoch_ms, r.release_id.clone()))
        .collect();
    by_age.sort();

    let excess = states.len() - max;
    for (_, release_id) in by_age.into_iter().take(excess) {
        states.remove(&release_id);
    }
}

pub struct SyncStateStore {
    path: PathBuf,
    max_finalized: usize,
    max_pending: usize,
}

impl SyncStateStore {
    pub fn new(config: &SyncStateConfig) -> Self {
        SyncStateStore {
            path: config.path.clone(),
            max_finalized: config.max_finalized,
            max_pending: config.max_pending,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_finalized(&self) -> usize {
        self.max_finalized
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// `None` if nothing was saved yet. A file that does not parse is treated
    /// the same way.
    pub fn load(&self) -> Result<Option<SyncState>, SyncStateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Ignoring corrupt sync state file"
                );
                Ok(None)
            }
        }
    }

    pub fn save(&self, state: &SyncState) -> Result<(), SyncStateError> {
        let mut state = state.clone();
        state.enforce_caps(self.max_finalized, self.max_pending);

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(format!(".tmp-{:08x}", rand::random::<u32>()));
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec_pretty(&state)?)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
