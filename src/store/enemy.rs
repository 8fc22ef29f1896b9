use serde::Serialize;

use crate::protocol::types::EntityInfo;

#[derive(Debug, Clone, Default)]
pub struct Enemy {
    pub id: u64,
    pub name: String,
    pub type_id: u32,
    pub is_boss: bool,
    pub hp: u64,
    pub max_hp: u64,
    pub total: u64,
    pub count: u64,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnemyStats {
    pub total: u64,
    pub count: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnemySnapshot {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub type_id: u32,
    pub is_boss: bool,
    pub hp: u64,
    #[serde(rename = "max_hp")]
    pub max_hp: u64,
    pub stats: EnemyStats,
}

/// A boss currently present in the enemy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BossSighting {
    pub id: u64,
    pub name: String,
    pub total: u64,
}

impl Enemy {
    pub fn new(id: u64, is_boss: bool) -> Self {
        Self { id, is_boss, ..Default::default() }
    }

    pub fn apply_info(&mut self, info: &EntityInfo) {
        if !info.name.is_empty() {
            self.name = info.name.clone();
        }
        self.type_id = info.type_id;
        self.is_boss = info.is_boss;
        self.hp = info.hp;
        self.max_hp = info.max_hp;
    }

    pub fn take_damage(&mut self, amount: u64, hp_lessen: u64, fatal: bool) {
        self.total = self.total.saturating_add(amount);
        self.count += 1;
        self.hp = if fatal { 0 } else { self.hp.saturating_sub(hp_lessen) };
    }

    pub fn reset_statistics(&mut self) {
        self.hp = 0;
        self.max_hp = 0;
        self.total = 0;
        self.count = 0;
    }

    pub fn snapshot(&self) -> EnemySnapshot {
        EnemySnapshot {
            id: self.id,
            name: self.name.clone(),
            type_id: self.type_id,
            is_boss: self.is_boss,
            hp: self.hp,
            max_hp: self.max_hp,
            stats: EnemyStats { total: self.total, count: self.count },
        }
    }

    pub fn sighting(&self) -> BossSighting {
        let name = if self.name.is_empty() { self.id.to_string() } else { self.name.clone() };
        BossSighting { id: self.id, name, total: self.total }
    }
}
