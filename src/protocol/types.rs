use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Player,
    Enemy,
}

/// The record shapes the decoder knows how to parse. Which opcode carries which
/// shape comes from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Damage,
    Healing,
    EntityInfo,
    EntityGone,
    SessionBoundary,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DamageDealt {
    pub source_uid: u64,
    pub target_uid: u64,
    pub skill_id: u32,
    pub amount: u64,
    pub hp_lessen: u64,
    pub element: u8,
    pub critical: bool,
    pub lucky: bool,
    pub source_kind: EntityKind,
    pub target_kind: EntityKind,
    pub fatal: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealingDone {
    pub source_uid: u64,
    pub target_uid: u64,
    pub skill_id: u32,
    pub amount: u64,
    pub element: u8,
    pub critical: bool,
    pub lucky: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityInfo {
    pub uid: u64,
    pub kind: EntityKind,
    pub type_id: u32,
    pub name: String,
    pub profession: String,
    pub hp: u64,
    pub max_hp: u64,
    pub fight_point: u32,
    pub is_boss: bool,
}

/// A fully validated decoded record. Nothing partially typed crosses this
/// boundary.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    DamageDealt(DamageDealt),
    HealingDone(HealingDone),
    EntityInfo(EntityInfo),
    EntityGone { uid: u64 },
    SessionBoundary { new_start_time: u64 },
}

/// An event stamped with the capture time (epoch ms) of the segment that
/// completed its message.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedEvent {
    pub ts_ms: u64,
    pub event: Event,
}

impl TimedEvent {
    pub fn new(ts_ms: u64, event: Event) -> Self {
        Self { ts_ms, event }
    }
}
