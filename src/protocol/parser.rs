use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::config::OpcodeTable;
use crate::error::{DecodeError, EncodeError};
use crate::protocol::types::{DamageDealt, EntityInfo, EntityKind, Event, HealingDone, RecordKind};

/// Width of the little-endian payload length that prefixes every message.
pub const LENGTH_PREFIX: usize = 4;
/// Width of the little-endian opcode that starts every payload.
pub const OPCODE_LEN: usize = 2;

// Damage flag bits
pub const FLAG_CRITICAL: u8 = 0x01;
pub const FLAG_LUCKY: u8 = 0x02;
pub const FLAG_SOURCE_ENEMY: u8 = 0x04;
pub const FLAG_TARGET_PLAYER: u8 = 0x08;
pub const FLAG_FATAL: u8 = 0x10;

const KIND_PLAYER: u8 = 0;
const KIND_ENEMY: u8 = 1;

/// Opcode-dispatched record decoder.
#[derive(Debug, Clone)]
pub struct Decoder {
    table: HashMap<u16, RecordKind>,
    boss_ids: HashSet<u64>,
}

impl Decoder {
    pub fn new(opcodes: &OpcodeTable, boss_ids: &[u64]) -> Self {
        let mut table = HashMap::new();
        for (opcode, kind) in opcodes.entries() {
            if let Some(previous) = table.insert(opcode, kind) {
                log::warn!(
                    "Opcode {:#06x} mapped twice ({:?} and {:?}); keeping {:?}",
                    opcode,
                    previous,
                    kind,
                    kind
                );
            }
        }

        Self { table, boss_ids: boss_ids.iter().copied().collect() }
    }

    pub fn kind_of(&self, opcode: u16) -> Option<RecordKind> {
        self.table.get(&opcode).copied()
    }

    /// Decodes one framed payload (opcode + body).
    ///
    /// `Ok(None)` means the opcode is not in the table: the message is consumed
    /// whole and skipped. `Err` means the record failed its consistency checks
    /// and must be dropped.
    pub fn decode(&self, payload: &[u8]) -> Result<Option<Event>, DecodeError> {
        if payload.len() < OPCODE_LEN {
            return Err(DecodeError::MissingOpcode(payload.len()));
        }
        let opcode = u16::from_le_bytes([payload[0], payload[1]]);
        let Some(kind) = self.kind_of(opcode) else {
            log::trace!("Skipping unknown opcode {:#06x} ({} bytes)", opcode, payload.len());
            return Ok(None);
        };

        let mut reader = RecordReader::new(opcode, &payload[OPCODE_LEN..]);
        let event = match kind {
            RecordKind::Damage => Event::DamageDealt(parse_damage(&mut reader)?),
            RecordKind::Healing => Event::HealingDone(parse_healing(&mut reader)?),
            RecordKind::EntityInfo => {
                let mut info = parse_entity_info(&mut reader)?;
                info.is_boss = info.kind == EntityKind::Enemy && self.is_boss(info.uid, info.type_id);
                Event::EntityInfo(info)
            }
            RecordKind::EntityGone => Event::EntityGone { uid: reader.u64()? },
            RecordKind::SessionBoundary => Event::SessionBoundary { new_start_time: reader.u64()? },
        };
        reader.finish()?;

        Ok(Some(event))
    }

    fn is_boss(&self, uid: u64, type_id: u32) -> bool {
        self.boss_ids.contains(&uid) || (type_id != 0 && self.boss_ids.contains(&(type_id as u64)))
    }
}

// --- RECORD SHAPES ---

/// Payload length (opcode included) a record can be framed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSize {
    Exact(u32),
    AtLeast(u32),
}

impl RecordSize {
    pub fn admits(self, len: u32) -> bool {
        match self {
            RecordSize::Exact(size) => len == size,
            RecordSize::AtLeast(size) => len >= size,
        }
    }
}

/// Payload size of each record kind, matching the readers below.
pub fn record_size(kind: RecordKind) -> RecordSize {
    let opcode = OPCODE_LEN as u32;
    match kind {
        // source, target, skill, amount, hp_lessen, element, flags
        RecordKind::Damage => RecordSize::Exact(opcode + 8 + 8 + 4 + 8 + 8 + 1 + 1),
        // source, target, skill, amount, element, flags
        RecordKind::Healing => RecordSize::Exact(opcode + 8 + 8 + 4 + 8 + 1 + 1),
        // fixed part, then two u16-prefixed strings
        RecordKind::EntityInfo => RecordSize::AtLeast(opcode + 8 + 1 + 4 + 8 + 8 + 4 + 2 + 2),
        RecordKind::EntityGone | RecordKind::SessionBoundary => RecordSize::Exact(opcode + 8),
    }
}

fn parse_damage(reader: &mut RecordReader<'_>) -> Result<DamageDealt, DecodeError> {
    let source_uid = reader.u64()?;
    let target_uid = reader.u64()?;
    let skill_id = reader.u32()?;
    let amount = reader.u64()?;
    let hp_lessen = reader.u64()?;
    let element = reader.u8()?;
    let flags = reader.u8()?;

    Ok(DamageDealt {
        source_uid,
        target_uid,
        skill_id,
        amount,
        hp_lessen,
        element,
        critical: flags & FLAG_CRITICAL != 0,
        lucky: flags & FLAG_LUCKY != 0,
        source_kind: if flags & FLAG_SOURCE_ENEMY != 0 { EntityKind::Enemy } else { EntityKind::Player },
        target_kind: if flags & FLAG_TARGET_PLAYER != 0 { EntityKind::Player } else { EntityKind::Enemy },
        fatal: flags & FLAG_FATAL != 0,
    })
}

fn parse_healing(reader: &mut RecordReader<'_>) -> Result<HealingDone, DecodeError> {
    let source_uid = reader.u64()?;
    let target_uid = reader.u64()?;
    let skill_id = reader.u32()?;
    let amount = reader.u64()?;
    let element = reader.u8()?;
    let flags = reader.u8()?;

    Ok(HealingDone {
        source_uid,
        target_uid,
        skill_id,
        amount,
        element,
        critical: flags & FLAG_CRITICAL != 0,
        lucky: flags & FLAG_LUCKY != 0,
    })
}

fn parse_entity_info(reader: &mut RecordReader<'_>) -> Result<EntityInfo, DecodeError> {
    let uid = reader.u64()?;
    let kind = match reader.u8()? {
        KIND_PLAYER => EntityKind::Player,
        KIND_ENEMY => EntityKind::Enemy,
        other => return Err(DecodeError::InvalidEntityKind { opcode: reader.opcode, kind: other }),
    };
    let type_id = reader.u32()?;
    let hp = reader.u64()?;
    let max_hp = reader.u64()?;
    let fight_point = reader.u32()?;
    let name = reader.string()?;
    let profession = reader.string()?;

    Ok(EntityInfo { uid, kind, type_id, name, profession, hp, max_hp, fight_point, is_boss: false })
}

/// Bounds-checked little-endian reads over one record body.
struct RecordReader<'a> {
    opcode: u16,
    cursor: Cursor<&'a [u8]>,
}

impl<'a> RecordReader<'a> {
    fn new(opcode: u16, body: &'a [u8]) -> Self {
        Self { opcode, cursor: Cursor::new(body) }
    }

    fn truncated(&self, offset: u64, needed: usize) -> DecodeError {
        DecodeError::Truncated { opcode: self.opcode, offset: offset as usize, needed }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let at = self.cursor.position();
        self.cursor.read_u8().map_err(|_| self.truncated(at, 1))
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let at = self.cursor.position();
        self.cursor.read_u16::<LittleEndian>().map_err(|_| self.truncated(at, 2))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let at = self.cursor.position();
        self.cursor.read_u32::<LittleEndian>().map_err(|_| self.truncated(at, 4))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let at = self.cursor.position();
        self.cursor.read_u64::<LittleEndian>().map_err(|_| self.truncated(at, 8))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let start = self.cursor.position() as usize;
        let body: &'a [u8] = *self.cursor.get_ref();
        let Some(bytes) = body.get(start..start + len) else {
            return Err(self.truncated(start as u64, len));
        };
        self.cursor.set_position((start + len) as u64);
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { opcode: self.opcode })
    }

    fn finish(self) -> Result<(), DecodeError> {
        let remaining = self.cursor.get_ref().len() - self.cursor.position() as usize;
        if remaining > 0 {
            return Err(DecodeError::TrailingBytes { opcode: self.opcode, remaining });
        }
        Ok(())
    }
}

// --- ENCODING (fixtures, replay) ---

/// Serialises an event as a payload (opcode + body) in the same layout
/// `Decoder::decode` reads. Fails only when a string does not fit its u16
/// length prefix.
pub fn encode_payload(opcode: u16, event: &Event) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&opcode.to_le_bytes());
    match event {
        Event::DamageDealt(d) => {
            let mut flags = 0u8;
            if d.critical {
                flags |= FLAG_CRITICAL;
            }
            if d.lucky {
                flags |= FLAG_LUCKY;
            }
            if d.source_kind == EntityKind::Enemy {
                flags |= FLAG_SOURCE_ENEMY;
            }
            if d.target_kind == EntityKind::Player {
                flags |= FLAG_TARGET_PLAYER;
            }
            if d.fatal {
                flags |= FLAG_FATAL;
            }
            out.extend_from_slice(&d.source_uid.to_le_bytes());
            out.extend_from_slice(&d.target_uid.to_le_bytes());
            out.extend_from_slice(&d.skill_id.to_le_bytes());
            out.extend_from_slice(&d.amount.to_le_bytes());
            out.extend_from_slice(&d.hp_lessen.to_le_bytes());
            out.push(d.element);
            out.push(flags);
        }
        Event::HealingDone(h) => {
            let mut flags = 0u8;
            if h.critical {
                flags |= FLAG_CRITICAL;
            }
            if h.lucky {
                flags |= FLAG_LUCKY;
            }
            out.extend_from_slice(&h.source_uid.to_le_bytes());
            out.extend_from_slice(&h.target_uid.to_le_bytes());
            out.extend_from_slice(&h.skill_id.to_le_bytes());
            out.extend_from_slice(&h.amount.to_le_bytes());
            out.push(h.element);
            out.push(flags);
        }
        Event::EntityInfo(info) => {
            out.extend_from_slice(&info.uid.to_le_bytes());
            out.push(match info.kind {
                EntityKind::Player => KIND_PLAYER,
                EntityKind::Enemy => KIND_ENEMY,
            });
            out.extend_from_slice(&info.type_id.to_le_bytes());
            out.extend_from_slice(&info.hp.to_le_bytes());
            out.extend_from_slice(&info.max_hp.to_le_bytes());
            out.extend_from_slice(&info.fight_point.to_le_bytes());
            write_string(&mut out, "name", &info.name)?;
            write_string(&mut out, "profession", &info.profession)?;
        }
        Event::EntityGone { uid } => out.extend_from_slice(&uid.to_le_bytes()),
        Event::SessionBoundary { new_start_time } => out.extend_from_slice(&new_start_time.to_le_bytes()),
    }
    Ok(out)
}

/// Prefixes a payload with its little-endian length.
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn write_string(out: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), EncodeError> {
    let len = u16::try_from(value.len()).map_err(|_| EncodeError::StringTooLong { field, len: value.len() })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}
