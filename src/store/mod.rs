//! In-memory aggregation of combat events.
//!
//! One writer (the dispatcher) applies each event under a single write lock,
//! so readers only ever see whole events.

pub mod enemy;
pub mod player;
pub mod skill;
pub mod stats;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Local, TimeZone};
use indexmap::IndexMap;

use crate::config::AppConfig;
use crate::protocol::types::{EntityKind, Event, TimedEvent};
use enemy::{BossSighting, Enemy, EnemySnapshot};
use player::{Player, PlayerSnapshot, SkillTables};
use skill::SkillSnapshot;

#[derive(Debug, Default)]
struct StoreInner {
    players: IndexMap<u64, Player>,
    enemies: IndexMap<u64, Enemy>,
    start_time: u64,
    local_player_uid: Option<u64>,
    log: VecDeque<String>,
}

/// Everything a history snapshot needs, taken under one read lock.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub start_time: u64,
    pub users: IndexMap<u64, PlayerSnapshot>,
    pub skills: IndexMap<u64, SkillTables>,
    pub enemies: IndexMap<u64, EnemySnapshot>,
    pub log: Vec<String>,
}

pub struct DataStore {
    inner: RwLock<StoreInner>,
    skill_names: HashMap<u32, String>,
    boss_ids: HashSet<u64>,
    window_ms: u64,
    log_capacity: usize,
}

impl DataStore {
    pub fn new(config: &AppConfig) -> Self {
        let mut skill_names = HashMap::new();
        for (key, name) in &config.skill_names {
            match key.trim().parse::<u32>() {
                Ok(id) => {
                    skill_names.insert(id, name.clone());
                }
                Err(_) => log::warn!("Ignoring skill name with non-numeric id {:?}", key),
            }
        }

        let inner = StoreInner { local_player_uid: config.local_player_uid, ..Default::default() };
        Self {
            inner: RwLock::new(inner),
            skill_names,
            boss_ids: config.boss_ids.iter().copied().collect(),
            window_ms: config.dps_window_ms,
            log_capacity: config.fight_log_capacity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn display_name(&self, skill_id: u32) -> String {
        self.skill_names.get(&skill_id).cloned().unwrap_or_else(|| skill_id.to_string())
    }

    // --- WRITE PATH ---

    /// Applies one decoded event atomically with respect to readers.
    pub fn apply(&self, timed: &TimedEvent) {
        let ts = timed.ts_ms;
        let window = self.window_ms;
        let mut inner = self.write();
        if inner.start_time == 0 {
            inner.start_time = ts;
        }

        let line = match &timed.event {
            Event::DamageDealt(hit) => {
                match (hit.source_kind, hit.target_kind) {
                    (_, EntityKind::Player) => {
                        player_entry(&mut inner.players, hit.target_uid).add_taken_damage(hit.amount, hit.fatal);
                    }
                    (EntityKind::Player, EntityKind::Enemy) => {
                        player_entry(&mut inner.players, hit.source_uid).add_damage(hit, ts, window);
                        self.enemy_entry(&mut inner.enemies, hit.target_uid)
                            .take_damage(hit.amount, hit.hp_lessen, hit.fatal);
                    }
                    (EntityKind::Enemy, EntityKind::Enemy) => {
                        self.enemy_entry(&mut inner.enemies, hit.target_uid)
                            .take_damage(hit.amount, hit.hp_lessen, hit.fatal);
                    }
                }
                Some(format!(
                    "DMG src={} tgt={} skill={} amount={} hpLessen={} element={} crit={} lucky={} fatal={}",
                    hit.source_uid,
                    hit.target_uid,
                    self.display_name(hit.skill_id),
                    hit.amount,
                    hit.hp_lessen,
                    hit.element,
                    hit.critical,
                    hit.lucky,
                    hit.fatal
                ))
            }
            Event::HealingDone(heal) => {
                player_entry(&mut inner.players, heal.source_uid).add_healing(heal, ts, window);
                Some(format!(
                    "HEAL src={} tgt={} skill={} amount={} element={} crit={} lucky={}",
                    heal.source_uid,
                    heal.target_uid,
                    self.display_name(heal.skill_id),
                    heal.amount,
                    heal.element,
                    heal.critical,
                    heal.lucky
                ))
            }
            Event::EntityInfo(info) => {
                match info.kind {
                    EntityKind::Player => player_entry(&mut inner.players, info.uid).apply_info(info),
                    EntityKind::Enemy => self.enemy_entry(&mut inner.enemies, info.uid).apply_info(info),
                }
                Some(format!(
                    "INFO uid={} kind={:?} type={} name={:?} profession={:?} hp={}/{} boss={}",
                    info.uid, info.kind, info.type_id, info.name, info.profession, info.hp, info.max_hp, info.is_boss
                ))
            }
            Event::EntityGone { uid } => {
                inner.enemies.shift_remove(uid).map(|enemy| format!("GONE id={} name={:?}", uid, enemy.name))
            }
            Event::SessionBoundary { new_start_time } => {
                inner.start_time = *new_start_time;
                log::info!("Session boundary, start time now {}", new_start_time);
                None
            }
        };

        if let Some(line) = line {
            if inner.log.len() >= self.log_capacity {
                inner.log.pop_front();
            }
            inner.log.push_back(format!("[{}] {}", format_ts(ts), line));
        }
    }

    fn enemy_entry<'a>(&self, enemies: &'a mut IndexMap<u64, Enemy>, id: u64) -> &'a mut Enemy {
        let is_boss = self.boss_ids.contains(&id);
        enemies.entry(id).or_insert_with(|| Enemy::new(id, is_boss))
    }

    /// Advances every realtime window to `now_ms`.
    pub fn refresh_realtime(&self, now_ms: u64) {
        let mut inner = self.write();
        for player in inner.players.values_mut() {
            player.refresh(now_ms, self.window_ms);
        }
    }

    /// Identity-only mutation; numeric fields are untouched.
    pub fn set_name(&self, uid: u64, name: &str) {
        let mut inner = self.write();
        player_entry(&mut inner.players, uid).name = name.to_string();
    }

    pub fn reset_statistics(&self) {
        let mut inner = self.write();
        for player in inner.players.values_mut() {
            player.reset_statistics();
        }
        for enemy in inner.enemies.values_mut() {
            enemy.reset_statistics();
        }
        inner.log.clear();
        log::info!("Statistics reset ({} players, {} enemies kept)", inner.players.len(), inner.enemies.len());
    }

    pub fn clear_all(&self) {
        let mut inner = self.write();
        inner.players.clear();
        inner.enemies.clear();
        inner.log.clear();
        inner.start_time = 0;
        log::info!("All records cleared");
    }

    pub fn set_local_player_uid(&self, uid: Option<u64>) {
        self.write().local_player_uid = uid;
    }

    pub fn set_start_time(&self, ts_ms: u64) {
        self.write().start_time = ts_ms;
    }

    // --- READ PATH ---

    pub fn start_time(&self) -> u64 {
        self.read().start_time
    }

    pub fn local_player_uid(&self) -> Option<u64> {
        self.read().local_player_uid
    }

    pub fn get_all_users_data(&self) -> IndexMap<u64, PlayerSnapshot> {
        self.read().players.iter().map(|(&uid, p)| (uid, p.snapshot())).collect()
    }

    /// The local player's entry alone, or an empty map when it is unknown.
    pub fn get_solo_user_data(&self) -> IndexMap<u64, PlayerSnapshot> {
        let inner = self.read();
        inner
            .local_player_uid
            .and_then(|uid| inner.players.get(&uid))
            .map(|p| (p.uid, p.snapshot()))
            .into_iter()
            .collect()
    }

    pub fn get_all_enemies_data(&self) -> IndexMap<u64, EnemySnapshot> {
        self.read().enemies.iter().map(|(&id, e)| (id, e.snapshot())).collect()
    }

    pub fn get_user_skill_data(&self, uid: u64) -> Option<BTreeMap<u32, SkillSnapshot>> {
        let inner = self.read();
        let player = inner.players.get(&uid)?;
        Some(player.merged_skills(|id| self.display_name(id)))
    }

    pub fn get_user_skill_breakdown(&self, uid: u64) -> Option<SkillTables> {
        let inner = self.read();
        let player = inner.players.get(&uid)?;
        Some(player.skill_tables(|id| self.display_name(id)))
    }

    /// Bosses currently present in the enemy table.
    pub fn boss_sightings(&self) -> Vec<BossSighting> {
        self.read().enemies.values().filter(|e| e.is_boss).map(Enemy::sighting).collect()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.read();
        StoreSnapshot {
            start_time: inner.start_time,
            users: inner.players.iter().map(|(&uid, p)| (uid, p.snapshot())).collect(),
            skills: inner.players.iter().map(|(&uid, p)| (uid, p.skill_tables(|id| self.display_name(id)))).collect(),
            enemies: inner.enemies.iter().map(|(&id, e)| (id, e.snapshot())).collect(),
            log: inner.log.iter().cloned().collect(),
        }
    }
}

fn player_entry(players: &mut IndexMap<u64, Player>, uid: u64) -> &mut Player {
    players.entry(uid).or_insert_with(|| Player::new(uid))
}

fn format_ts(ts_ms: u64) -> String {
    match Local.timestamp_millis_opt(ts_ms as i64).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => ts_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{DamageDealt, EntityInfo, HealingDone};

    const BOSS: u64 = 9001;

    fn store() -> DataStore {
        let mut config = AppConfig { boss_ids: vec![BOSS], local_player_uid: Some(100), ..AppConfig::default() };
        config.skill_names.insert("7".to_string(), "Piercing Shot".to_string());
        config.skill_names.insert("not-a-number".to_string(), "ignored".to_string());
        DataStore::new(&config)
    }

    fn damage(source: u64, target: u64, skill: u32, amount: u64, critical: bool) -> Event {
        Event::DamageDealt(DamageDealt {
            source_uid: source,
            target_uid: target,
            skill_id: skill,
            amount,
            hp_lessen: amount / 2,
            element: 1,
            critical,
            lucky: false,
            source_kind: EntityKind::Player,
            target_kind: EntityKind::Enemy,
            fatal: false,
        })
    }

    fn info(uid: u64, kind: EntityKind, name: &str) -> Event {
        Event::EntityInfo(EntityInfo {
            uid,
            kind,
            type_id: 0,
            name: name.to_string(),
            profession: if kind == EntityKind::Player { "Stormblade".to_string() } else { String::new() },
            hp: 1000,
            max_hp: 1000,
            fight_point: 5000,
            is_boss: uid == BOSS,
        })
    }

    fn apply(store: &DataStore, ts: u64, event: Event) {
        store.apply(&TimedEvent::new(ts, event));
    }

    #[test]
    fn skill_data_matches_crit_and_normal_hits() {
        let store = store();
        apply(&store, 1_000, damage(100, 5, 7, 500, true));
        apply(&store, 1_200, damage(100, 5, 7, 300, false));

        let skills = store.get_user_skill_data(100).unwrap();
        let skill = &skills[&7];
        assert_eq!(skill.total_damage, 800);
        assert_eq!(skill.total_count, 2);
        assert_eq!(skill.crit_count, 1);
        assert_eq!(skill.damage_breakdown.critical, 500);
        assert_eq!(skill.damage_breakdown.normal, 300);
        assert_eq!(skill.damage_breakdown.lucky, 0);
        assert_eq!(skill.damage_breakdown.crit_lucky, 0);
        assert_eq!(skill.display_name, "Piercing Shot");

        assert!(store.get_user_skill_data(4242).is_none());
    }

    #[test]
    fn damage_is_attributed_by_direction() {
        let store = store();
        apply(&store, 0, damage(100, 5, 1, 400, false));

        let mut incoming = DamageDealt {
            source_uid: 5,
            target_uid: 100,
            skill_id: 2,
            amount: 120,
            hp_lessen: 120,
            element: 0,
            critical: false,
            lucky: false,
            source_kind: EntityKind::Enemy,
            target_kind: EntityKind::Player,
            fatal: false,
        };
        apply(&store, 10, Event::DamageDealt(incoming.clone()));
        incoming.fatal = true;
        apply(&store, 20, Event::DamageDealt(incoming));

        let users = store.get_all_users_data();
        let me = &users[&100];
        assert_eq!(me.total_damage.total, 400);
        assert_eq!(me.total_damage.hp_lessen, 200);
        assert_eq!(me.taken_damage, 240);
        assert_eq!(me.dead_count, 1);
        assert!(!users.contains_key(&5));

        let enemies = store.get_all_enemies_data();
        assert_eq!(enemies[&5].stats.total, 400);
        assert_eq!(enemies[&5].stats.count, 1);
    }

    #[test]
    fn healing_is_credited_to_the_healer() {
        let store = store();
        let heal = HealingDone {
            source_uid: 200,
            target_uid: 100,
            skill_id: 30,
            amount: 75,
            element: 0,
            critical: true,
            lucky: true,
        };
        apply(&store, 0, Event::HealingDone(heal));

        let users = store.get_all_users_data();
        assert_eq!(users[&200].total_healing.crit_lucky, 75);
        assert_eq!(users[&200].healing_count.total, 1);
        assert!(!users.contains_key(&100));
    }

    #[test]
    fn reset_statistics_keeps_identities() {
        let store = store();
        apply(&store, 0, info(100, EntityKind::Player, "Aki"));
        apply(&store, 10, info(BOSS, EntityKind::Enemy, "Golem"));
        apply(&store, 20, damage(100, BOSS, 7, 900, true));
        let start = store.start_time();

        store.reset_statistics();

        let users = store.get_all_users_data();
        let aki = &users[&100];
        assert_eq!(aki.name, "Aki");
        assert_eq!(aki.profession, "Stormblade");
        assert_eq!(aki.total_damage.total, 0);
        assert_eq!(aki.total_count.total, 0);
        assert_eq!(aki.realtime_dps_max, 0.0);
        assert_eq!((aki.hp, aki.max_hp, aki.fight_point), (0, 0, 0));

        let enemies = store.get_all_enemies_data();
        assert_eq!(enemies[&BOSS].name, "Golem");
        assert!(enemies[&BOSS].is_boss);
        assert_eq!(enemies[&BOSS].stats.total, 0);

        assert!(store.get_user_skill_data(100).unwrap().is_empty());
        assert!(store.snapshot().log.is_empty());
        assert_eq!(store.start_time(), start);
    }

    #[test]
    fn clear_all_drops_every_record() {
        let store = store();
        apply(&store, 5, info(100, EntityKind::Player, "Aki"));
        apply(&store, 6, damage(100, 5, 1, 10, false));

        store.clear_all();

        assert!(store.get_all_users_data().is_empty());
        assert!(store.get_all_enemies_data().is_empty());
        assert!(store.get_user_skill_data(100).is_none());
        assert_eq!(store.start_time(), 0);
    }

    #[test]
    fn set_name_only_touches_identity() {
        let store = store();
        apply(&store, 0, damage(100, 5, 1, 640, false));
        store.set_name(100, "Renamed");

        let me = &store.get_all_users_data()[&100];
        assert_eq!(me.name, "Renamed");
        assert_eq!(me.total_damage.total, 640);
    }

    #[test]
    fn solo_view_follows_local_uid() {
        let store = store();
        apply(&store, 0, damage(100, 5, 1, 1, false));
        apply(&store, 0, damage(101, 5, 1, 1, false));

        assert_eq!(store.get_solo_user_data().keys().copied().collect::<Vec<_>>(), vec![100]);
        store.set_local_player_uid(Some(999));
        assert!(store.get_solo_user_data().is_empty());
    }

    #[test]
    fn boss_sightings_track_presence() {
        let store = store();
        apply(&store, 0, damage(100, BOSS, 1, 50, false));
        apply(&store, 0, damage(100, 6, 1, 50, false));

        let sightings = store.boss_sightings();
        assert_eq!(sightings.len(), 1);
        assert_eq!(sightings[0].id, BOSS);
        assert_eq!(sightings[0].total, 50);

        apply(&store, 10, Event::EntityGone { uid: BOSS });
        assert!(store.boss_sightings().is_empty());
        // Players are never removed by a despawn
        apply(&store, 11, Event::EntityGone { uid: 100 });
        assert!(store.get_all_users_data().contains_key(&100));
    }

    #[test]
    fn session_boundary_moves_start_time_without_clearing() {
        let store = store();
        apply(&store, 1_000, damage(100, 5, 1, 10, false));
        assert_eq!(store.start_time(), 1_000);

        apply(&store, 2_000, Event::SessionBoundary { new_start_time: 2_000 });
        assert_eq!(store.start_time(), 2_000);
        assert_eq!(store.get_all_users_data()[&100].total_damage.total, 10);
    }

    #[test]
    fn fight_log_is_bounded() {
        let config = AppConfig { fight_log_capacity: 3, ..AppConfig::default() };
        let store = DataStore::new(&config);
        for i in 0..5 {
            apply(&store, i, damage(100, 5, i as u32, 1, false));
        }

        let log = store.snapshot().log;
        assert_eq!(log.len(), 3);
        assert!(log[0].contains("skill=2"));
        assert!(log[2].contains("skill=4"));
    }

    #[test]
    fn realtime_refresh_decays_dps() {
        let store = store();
        apply(&store, 10_000, damage(100, 5, 1, 2000, false));
        assert_eq!(store.get_all_users_data()[&100].realtime_dps, 2000.0);

        store.refresh_realtime(12_000);
        let me = &store.get_all_users_data()[&100];
        assert_eq!(me.realtime_dps, 0.0);
        assert_eq!(me.realtime_dps_max, 2000.0);
    }
}
