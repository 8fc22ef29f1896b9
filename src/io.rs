use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::HistoryError;
use crate::store::player::{PlayerSnapshot, SkillTables};
use crate::store::StoreSnapshot;

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    pub start_time: u64,
    pub end_time: u64,
    pub duration_ms: u64,
    pub user_count: usize,
    pub enemy_count: usize,
    pub total_damage: u64,
    pub total_healing: u64,
    pub total_dps: f64,
    pub boss_id: Option<u64>,
    pub boss_name: Option<String>,
}

#[derive(Serialize)]
struct UserFile<'a> {
    uid: u64,
    user: &'a PlayerSnapshot,
    skills: Option<&'a SkillTables>,
}

/// Persists immutable per-session snapshots under a root directory.
#[derive(Debug, Clone)]
pub struct HistoryWriter {
    root: PathBuf,
}

impl HistoryWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `<root>/<ended_at>/` with summary.json, allUserData.json,
    /// users/<uid>.json and fight.log. Everything is written into a hidden
    /// staging directory first and published with one rename.
    pub fn save(
        &self,
        snapshot: &StoreSnapshot,
        ended_at: u64,
        boss: Option<(u64, &str)>,
    ) -> Result<PathBuf, HistoryError> {
        let target = self.root.join(ended_at.to_string());
        if target.exists() {
            return Err(HistoryError::AlreadyExists(target));
        }
        let staging = self.root.join(format!(".{}.partial", ended_at));
        if staging.exists() {
            // Leftover from an interrupted save
            let _ = fs::remove_dir_all(&staging);
        }

        let users_dir = staging.join("users");
        fs::create_dir_all(&users_dir).map_err(|source| HistoryError::CreateDir { path: users_dir.clone(), source })?;

        let result = self.write_contents(&staging, &users_dir, snapshot, ended_at, boss);
        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        fs::rename(&staging, &target).map_err(|source| {
            let _ = fs::remove_dir_all(&staging);
            HistoryError::Rename { from: staging.clone(), to: target.clone(), source }
        })?;
        log::info!("Saved session history to {}", target.display());
        Ok(target)
    }

    fn write_contents(
        &self,
        staging: &Path,
        users_dir: &Path,
        snapshot: &StoreSnapshot,
        ended_at: u64,
        boss: Option<(u64, &str)>,
    ) -> Result<(), HistoryError> {
        write_json(&staging.join("summary.json"), "summary", &summarize(snapshot, ended_at, boss))?;
        write_json(&staging.join("allUserData.json"), "allUserData", &snapshot.users)?;

        for (uid, user) in &snapshot.users {
            let file = UserFile { uid: *uid, user, skills: snapshot.skills.get(uid) };
            write_json(&users_dir.join(format!("{}.json", uid)), "user", &file)?;
        }

        let log_path = staging.join("fight.log");
        let mut out = fs::File::create(&log_path)
            .map_err(|source| HistoryError::WriteFile { path: log_path.clone(), source })?;
        for line in &snapshot.log {
            writeln!(out, "{}", line).map_err(|source| HistoryError::WriteFile { path: log_path.clone(), source })?;
        }
        out.sync_all().map_err(|source| HistoryError::WriteFile { path: log_path, source })?;
        Ok(())
    }
}

pub fn summarize(snapshot: &StoreSnapshot, ended_at: u64, boss: Option<(u64, &str)>) -> HistorySummary {
    let total_damage: u64 = snapshot.users.values().map(|u| u.total_damage.total).sum();
    let total_healing: u64 = snapshot.users.values().map(|u| u.total_healing.total).sum();
    let duration_ms = if snapshot.start_time == 0 { 0 } else { ended_at.saturating_sub(snapshot.start_time) };
    let total_dps = if duration_ms == 0 { 0.0 } else { total_damage as f64 * 1000.0 / duration_ms as f64 };

    HistorySummary {
        start_time: snapshot.start_time,
        end_time: ended_at,
        duration_ms,
        user_count: snapshot.users.len(),
        enemy_count: snapshot.enemies.len(),
        total_damage,
        total_healing,
        total_dps,
        boss_id: boss.map(|(id, _)| id),
        boss_name: boss.map(|(_, name)| name.to_string()),
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, what: &'static str, value: &T) -> Result<(), HistoryError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| HistoryError::Serialize { what, source })?;
    fs::write(path, json).map_err(|source| HistoryError::WriteFile { path: path.to_path_buf(), source })
}

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}
