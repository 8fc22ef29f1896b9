use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::protocol::types::RecordKind;

/// Opcode values for each record shape the decoder understands. Every entry is
/// optional: an unset entry means that record kind is never decoded.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct OpcodeTable {
    pub damage: Option<u16>,
    pub healing: Option<u16>,
    pub entity_info: Option<u16>,
    pub entity_gone: Option<u16>,
    pub session_boundary: Option<u16>,
}

impl OpcodeTable {
    pub fn is_empty(&self) -> bool {
        self.damage.is_none()
            && self.healing.is_none()
            && self.entity_info.is_none()
            && self.entity_gone.is_none()
            && self.session_boundary.is_none()
    }

    /// Configured opcodes with the record each one carries.
    pub fn entries(&self) -> impl Iterator<Item = (u16, RecordKind)> {
        [
            (self.damage, RecordKind::Damage),
            (self.healing, RecordKind::Healing),
            (self.entity_info, RecordKind::EntityInfo),
            (self.entity_gone, RecordKind::EntityGone),
            (self.session_boundary, RecordKind::SessionBoundary),
        ]
        .into_iter()
        .filter_map(|(opcode, kind)| opcode.map(|opcode| (opcode, kind)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// "auto" or a capture device name.
    pub device: String,
    pub server_ports: Vec<u16>,
    pub probe_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub queue_capacity: usize,
    pub max_message_len: u32,
    pub stall_timeout_ms: u64,
    pub max_pending_bytes: usize,
    pub server_switch_threshold: u32,
    pub dps_window_ms: u64,
    pub tick_interval_ms: u64,
    pub grace_period_ms: u64,
    pub boss_ids: Vec<u64>,
    pub opcodes: OpcodeTable,
    /// Skill id (as a decimal string key) to display name.
    pub skill_names: HashMap<String, String>,
    pub local_player_uid: Option<u64>,
    pub history_dir: PathBuf,
    pub auto_save_history: bool,
    pub fight_log_capacity: usize,
    pub log_level: String,
    /// Anything in the file that is not a named field above.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            server_ports: vec![5003],
            probe_timeout_ms: 3000,
            read_timeout_ms: 100,
            queue_capacity: 4096,
            max_message_len: 0x0F_FFFF,
            stall_timeout_ms: 5000,
            max_pending_bytes: 4 * 1024 * 1024,
            server_switch_threshold: 5,
            dps_window_ms: 1000,
            tick_interval_ms: 100,
            grace_period_ms: 5000,
            boss_ids: Vec::new(),
            opcodes: OpcodeTable::default(),
            skill_names: HashMap::new(),
            local_player_uid: None,
            history_dir: PathBuf::from("history"),
            auto_save_history: false,
            fight_log_capacity: 200_000,
            log_level: "info".to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
            }
            Ok(())
        }

        if self.device.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "device", reason: "use \"auto\" or a device name".into() });
        }
        if self.server_ports.is_empty() {
            return Err(ConfigError::Invalid { field: "server_ports", reason: "at least one port is required".into() });
        }
        nonzero("probe_timeout_ms", self.probe_timeout_ms)?;
        nonzero("read_timeout_ms", self.read_timeout_ms)?;
        nonzero("queue_capacity", self.queue_capacity as u64)?;
        nonzero("stall_timeout_ms", self.stall_timeout_ms)?;
        nonzero("max_pending_bytes", self.max_pending_bytes as u64)?;
        nonzero("server_switch_threshold", self.server_switch_threshold as u64)?;
        nonzero("dps_window_ms", self.dps_window_ms)?;
        nonzero("tick_interval_ms", self.tick_interval_ms)?;
        nonzero("fight_log_capacity", self.fight_log_capacity as u64)?;
        if self.max_message_len < 2 {
            let reason = "must leave room for an opcode".to_string();
            return Err(ConfigError::Invalid { field: "max_message_len", reason });
        }
        Ok(())
    }
}

// Resolution order: explicit path, then $RESONANCE_METER_CONFIG, then ./config.json
pub fn get_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os("RESONANCE_METER_CONFIG") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from("config.json"),
    }
}

pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        // Create default if missing
        let default_config = AppConfig::default();
        save_config(path, &default_config)?;
        log::info!("Wrote default config to {}", path.display());
        return Ok(default_config);
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    let config: AppConfig =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;

    if !config.extra.is_empty() {
        let keys: Vec<&str> = config.extra.keys().map(String::as_str).collect();
        log::warn!("Ignoring unrecognised config fields in {}: {:?}", path.display(), keys);
    }
    if config.opcodes.is_empty() {
        log::warn!("Opcode table is empty; framed messages will be skipped as unknown");
    }

    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Write { path: dir.to_path_buf(), source })?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
    fs::write(path, json).map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("resonance-meter-config-{}-{}-{}", tag, std::process::id(), nanos))
    }

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period_ms, 5000);
        assert!(config.opcodes.is_empty());
    }

    #[test]
    fn unknown_fields_are_bucketed_not_merged() {
        let json = r#"{ "device": "eth0", "boss_ids": [42], "theme": "dark", "dps_window_ms": 2000, "skill_names": { "1701": "Slash" } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.device, "eth0");
        assert_eq!(config.boss_ids, vec![42]);
        assert_eq!(config.dps_window_ms, 2000);
        assert_eq!(config.extra.get("theme"), Some(&serde_json::json!("dark")));
        assert_eq!(config.extra.len(), 1);
        assert_eq!(config.skill_names.get("1701").map(String::as_str), Some("Slash"));
        // Unspecified fields keep their defaults
        assert_eq!(config.server_ports, vec![5003]);
    }

    #[test]
    fn opcode_table_parses_partial_entries() {
        let json = r#"{ "opcodes": { "damage": 17, "entity_info": 18 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.opcodes.damage, Some(17));
        assert_eq!(config.opcodes.entity_info, Some(18));
        assert_eq!(config.opcodes.healing, None);
    }

    #[test]
    fn validate_rejects_zero_window() {
        let config = AppConfig { dps_window_ms: 0, ..AppConfig::default() };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "dps_window_ms", .. }));
    }

    #[test]
    fn load_creates_default_then_round_trips_saved_values() {
        let dir = scratch_dir("load");
        let path = dir.join("config.json");

        let created = load_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, AppConfig::default());

        let mut changed = created;
        changed.boss_ids = vec![1001, 1002];
        changed.local_player_uid = Some(7);
        save_config(&path, &changed).unwrap();

        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded.boss_ids, vec![1001, 1002]);
        assert_eq!(reloaded.local_player_uid, Some(7));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reports_invalid_json() {
        let dir = scratch_dir("bad");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
        let _ = fs::remove_dir_all(dir);
    }
}
