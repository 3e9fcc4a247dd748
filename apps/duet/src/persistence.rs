//! Local snapshot store: the latest session state per code plus a short list
//! of recently played sessions.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use duet_proto::{GameMode, Intensity, Role, Scores, SessionState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Snapshots older than this are not restored.
pub const SNAPSHOT_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;
pub const MAX_RECENT_SESSIONS: usize = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub game_code: String,
    pub host_name: String,
    pub guest_name: String,
    pub my_role: Role,
    pub my_name: String,
    pub scores: Scores,
    pub intensity: Intensity,
    pub game_mode: GameMode,
    pub timestamp: u64,
}

impl SavedSession {
    pub fn from_state(state: &SessionState, role: Role, name: &str) -> Self {
        Self {
            game_code: state.game_code.clone(),
            host_name: state.host_name.clone(),
            guest_name: state.guest_name.clone(),
            my_role: role,
            my_name: name.to_string(),
            scores: state.scores,
            intensity: state.intensity_level,
            game_mode: state.game_mode,
            timestamp: duet_proto::now_millis(),
        }
    }
}

pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot for `code`, stale or not.
    fn load(&self, code: &str) -> Result<Option<SessionState>, StoreError>;
    fn save(&self, state: &SessionState) -> Result<(), StoreError>;
    /// Recently played sessions, newest first.
    fn recent(&self) -> Result<Vec<SavedSession>, StoreError>;
    fn remember(&self, session: SavedSession) -> Result<(), StoreError>;
}

/// Loads the snapshot for `code` if it was updated within the last day.
pub fn fresh_snapshot(
    store: &dyn SnapshotStore,
    code: &str,
    now: u64,
) -> Result<Option<SessionState>, StoreError> {
    let Some(state) = store.load(code)? else {
        return Ok(None);
    };
    if now.saturating_sub(state.last_updated) > SNAPSHOT_MAX_AGE_MS {
        debug!(target = "duet::store", code, last_updated = state.last_updated, "snapshot too old; ignoring");
        return Ok(None);
    }
    Ok(Some(state))
}

/// Puts `session` at the front, dropping older entries for the same code.
pub fn merge_recent(mut list: Vec<SavedSession>, session: SavedSession) -> Vec<SavedSession> {
    list.retain(|entry| !entry.game_code.eq_ignore_ascii_case(&session.game_code));
    list.insert(0, session);
    list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    list.truncate(MAX_RECENT_SESSIONS);
    list
}

/// JSON files under a data directory: `games/<code>.json` and
/// `sessions.json`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.duet`, or `None` when no home directory can be determined.
    pub fn default_dir() -> Option<PathBuf> {
        BaseDirs::new().map(|base| base.home_dir().join(".duet"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn game_path(&self, code: &str) -> PathBuf {
        let file: String = code
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect::<String>()
            .to_ascii_lowercase();
        self.root.join("games").join(format!("{file}.json"))
    }

    fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_vec_pretty(value)?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serialized)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read(path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, code: &str) -> Result<Option<SessionState>, StoreError> {
        Self::read_json(&self.game_path(code))
    }

    fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        Self::write_json(&self.game_path(&state.game_code), state)
    }

    fn recent(&self) -> Result<Vec<SavedSession>, StoreError> {
        match Self::read_json::<Vec<SavedSession>>(&self.sessions_path()) {
            Ok(list) => Ok(list.unwrap_or_default()),
            Err(StoreError::Json(err)) => {
                warn!(target = "duet::store", error = %err, "recent sessions file unreadable; starting fresh");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn remember(&self, session: SavedSession) -> Result<(), StoreError> {
        let list = merge_recent(self.recent()?, session);
        Self::write_json(&self.sessions_path(), &list)
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    games: Mutex<HashMap<String, SessionState>>,
    sessions: Mutex<Vec<SavedSession>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, code: &str) -> Result<Option<SessionState>, StoreError> {
        Ok(self.games.lock().get(&code.to_ascii_lowercase()).cloned())
    }

    fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        self.games
            .lock()
            .insert(state.game_code.to_ascii_lowercase(), state.clone());
        Ok(())
    }

    fn recent(&self) -> Result<Vec<SavedSession>, StoreError> {
        Ok(self.sessions.lock().clone())
    }

    fn remember(&self, session: SavedSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        let merged = merge_recent(std::mem::take(&mut *sessions), session);
        *sessions = merged;
        Ok(())
    }
}
