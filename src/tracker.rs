//! Best-effort per-project session history in `<cwd>/.multiterm/sessions.json`.
//!
//! Failures are logged and swallowed: the history is informational and must
//! never stand in the way of spawning or reaping a session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::project::MARKER_DIR;

/// Oldest entries beyond this are discarded on write.
pub const MAX_TRACKED: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackedStatus {
    Running,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub status: TrackedStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredList {
    Wrapped { sessions: Vec<TrackedSession> },
    Bare(Vec<TrackedSession>),
}

#[derive(Serialize)]
struct StoredListRef<'a> {
    sessions: &'a [TrackedSession],
}

/// One lock per history file. Creation and reaping run on blocking threads,
/// so every read-modify-write of a file happens under its lock.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock_for(cwd: &Path) -> Arc<Mutex<()>> {
    FILE_LOCKS
        .lock()
        .entry(file_for(cwd))
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn file_for(cwd: &Path) -> PathBuf {
    cwd.join(MARKER_DIR).join("sessions.json")
}

fn read_list(cwd: &Path) -> Vec<TrackedSession> {
    let path = file_for(cwd);
    if !path.exists() {
        return Vec::new();
    }
    let parsed = std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str::<StoredList>(&text).map_err(|e| e.to_string()));
    match parsed {
        Ok(StoredList::Wrapped { sessions }) | Ok(StoredList::Bare(sessions)) => sessions,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read session history");
            Vec::new()
        }
    }
}

fn write_list(cwd: &Path, list: &[TrackedSession]) {
    let path = file_for(cwd);
    let keep = &list[list.len().saturating_sub(MAX_TRACKED)..];
    let result = (|| -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&StoredListRef { sessions: keep })?;
        // Readers never see a partial file: write beside it, then rename over.
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, text)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    })();
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to write session history");
    }
}

/// Record a newly spawned session as running, replacing any entry with the same id.
pub fn record_start(
    id: &str,
    pid: Option<u32>,
    command: &[String],
    cwd: &Path,
    created_at: DateTime<Utc>,
) {
    let lock = lock_for(cwd);
    let _guard = lock.lock();
    let mut list = read_list(cwd);
    let entry = TrackedSession {
        id: id.to_string(),
        pid,
        command: command.to_vec(),
        cwd: cwd.to_path_buf(),
        status: TrackedStatus::Running,
        created_at,
        exited_at: None,
        exit_code: None,
    };
    match list.iter_mut().find(|s| s.id == id) {
        Some(existing) => *existing = entry,
        None => list.push(entry),
    }
    write_list(cwd, &list);
    tracing::debug!(session = %id, ?pid, "recorded session start");
}

/// Mark a tracked session as exited. Unknown ids are ignored.
pub fn record_exit(cwd: &Path, id: &str, exit_code: Option<i32>) {
    let lock = lock_for(cwd);
    let _guard = lock.lock();
    let mut list = read_list(cwd);
    let Some(entry) = list.iter_mut().find(|s| s.id == id) else {
        return;
    };
    entry.status = TrackedStatus::Exited;
    entry.exit_code = exit_code;
    entry.exited_at = Some(Utc::now());
    write_list(cwd, &list);
}

/// Every tracked session across the given project directories.
pub fn list_tracked(cwds: &[PathBuf]) -> Vec<TrackedSession> {
    cwds.iter()
        .flat_map(|cwd| {
            let lock = lock_for(cwd);
            let _guard = lock.lock();
            read_list(cwd)
        })
        .collect()
}
