use std::collections::BTreeMap;

use serde::Serialize;

use super::skill::{SkillKind, SkillSnapshot, SkillStats};
use super::stats::{CountBreakdown, HitCategory, StatisticSet, ValueBreakdown};
use crate::protocol::types::{DamageDealt, EntityInfo, HealingDone};

#[derive(Debug, Clone, Default)]
pub struct Player {
    pub uid: u64,
    pub name: String,
    pub profession: String,
    pub fight_point: u32,
    pub hp: u64,
    pub max_hp: u64,
    pub taken_damage: u64,
    pub dead_count: u32,
    damage: StatisticSet,
    healing: StatisticSet,
    damage_skills: BTreeMap<u32, SkillStats>,
    healing_skills: BTreeMap<u32, SkillStats>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub uid: u64,
    pub name: String,
    pub profession: String,
    #[serde(rename = "fightPoint")]
    pub fight_point: u32,
    pub hp: u64,
    pub max_hp: u64,
    pub total_damage: ValueBreakdown,
    pub total_count: CountBreakdown,
    pub realtime_dps: f64,
    pub realtime_dps_max: f64,
    pub total_dps: f64,
    pub total_healing: ValueBreakdown,
    pub healing_count: CountBreakdown,
    pub realtime_hps: f64,
    pub realtime_hps_max: f64,
    pub total_hps: f64,
    pub taken_damage: u64,
    pub dead_count: u32,
}

/// Both skill maps of one player.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct SkillTables {
    pub damage: BTreeMap<u32, SkillSnapshot>,
    pub healing: BTreeMap<u32, SkillSnapshot>,
}

impl Player {
    pub fn new(uid: u64) -> Self {
        Self { uid, ..Default::default() }
    }

    pub fn add_damage(&mut self, hit: &DamageDealt, ts_ms: u64, window_ms: u64) {
        let category = HitCategory::classify(hit.critical, hit.lucky);
        self.damage.record(hit.amount, category, hit.hp_lessen, ts_ms, window_ms);
        self.damage_skills
            .entry(hit.skill_id)
            .or_insert_with(|| SkillStats::new(SkillKind::Damage, hit.element))
            .record(hit.amount, category, hit.element);
    }

    pub fn add_healing(&mut self, heal: &HealingDone, ts_ms: u64, window_ms: u64) {
        let category = HitCategory::classify(heal.critical, heal.lucky);
        self.healing.record(heal.amount, category, 0, ts_ms, window_ms);
        self.healing_skills
            .entry(heal.skill_id)
            .or_insert_with(|| SkillStats::new(SkillKind::Healing, heal.element))
            .record(heal.amount, category, heal.element);
    }

    pub fn add_taken_damage(&mut self, amount: u64, fatal: bool) {
        self.taken_damage = self.taken_damage.saturating_add(amount);
        if fatal {
            self.dead_count += 1;
        }
    }

    pub fn apply_info(&mut self, info: &EntityInfo) {
        if !info.name.is_empty() {
            self.name = info.name.clone();
        }
        if !info.profession.is_empty() {
            self.profession = info.profession.clone();
        }
        self.fight_point = info.fight_point;
        self.hp = info.hp;
        self.max_hp = info.max_hp;
    }

    pub fn refresh(&mut self, now_ms: u64, window_ms: u64) {
        self.damage.refresh(now_ms, window_ms);
        self.healing.refresh(now_ms, window_ms);
    }

    /// Zeroes every numeric field. Identity (uid, name, profession) survives.
    pub fn reset_statistics(&mut self) {
        self.fight_point = 0;
        self.hp = 0;
        self.max_hp = 0;
        self.taken_damage = 0;
        self.dead_count = 0;
        self.damage.reset();
        self.healing.reset();
        self.damage_skills.clear();
        self.healing_skills.clear();
    }

    pub fn damage_total(&self) -> u64 {
        self.damage.values().total
    }

    pub fn healing_total(&self) -> u64 {
        self.healing.values().total
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            uid: self.uid,
            name: self.name.clone(),
            profession: self.profession.clone(),
            fight_point: self.fight_point,
            hp: self.hp,
            max_hp: self.max_hp,
            total_damage: self.damage.values(),
            total_count: self.damage.counts(),
            realtime_dps: self.damage.realtime(),
            realtime_dps_max: self.damage.realtime_max(),
            total_dps: self.damage.total_rate(),
            total_healing: self.healing.values(),
            healing_count: self.healing.counts(),
            realtime_hps: self.healing.realtime(),
            realtime_hps_max: self.healing.realtime_max(),
            total_hps: self.healing.total_rate(),
            taken_damage: self.taken_damage,
            dead_count: self.dead_count,
        }
    }

    pub fn skill_tables(&self, display_name: impl Fn(u32) -> String) -> SkillTables {
        SkillTables {
            damage: self.damage_skills.iter().map(|(&id, s)| (id, s.snapshot(display_name(id)))).collect(),
            healing: self.healing_skills.iter().map(|(&id, s)| (id, s.snapshot(display_name(id)))).collect(),
        }
    }

    /// Damage skills keyed by id, with healing skills added under ids that no
    /// damage skill uses.
    pub fn merged_skills(&self, display_name: impl Fn(u32) -> String) -> BTreeMap<u32, SkillSnapshot> {
        let SkillTables { mut damage, healing } = self.skill_tables(display_name);
        for (id, snapshot) in healing {
            damage.entry(id).or_insert(snapshot);
        }
        damage
    }
}
