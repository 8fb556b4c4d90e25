//! Temporary stats
//!
//! Buffs and debuffs applied to a user for a while (or permanently until
//! reset). Changes go through a [`ModifyTemporaryStatContext`], which records
//! what was reset and what was set so the client can be told in one reset
//! packet and one set packet.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::net::buffer::PacketBuffer;
use crate::protocol::opcodes::SendOperation;
use crate::protocol::packets::OutPacket;

/// Number of 32-bit words in the stat mask
const MASK_WORDS: usize = 4;

/// Temporary stat kinds, valued by their bit in the stat mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TemporaryStatType {
    Pad = 0,
    Pdd = 1,
    Mad = 2,
    Mdd = 3,
    Acc = 4,
    Eva = 5,
    Craft = 6,
    Speed = 7,
    Jump = 8,
    MagicGuard = 9,
    DarkSight = 10,
    Booster = 11,
    PowerGuard = 12,
    MaxHp = 13,
    MaxMp = 14,
    Invincible = 15,
    SoulArrow = 16,
    Stun = 17,
    Poison = 18,
    Seal = 19,
    Darkness = 20,
    ComboCounter = 21,
    WeaponCharge = 22,
    HolySymbol = 24,
    MesoUp = 25,
    ShadowPartner = 26,
}

impl TemporaryStatType {
    /// Bit position in the stat mask
    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// When a temporary stat ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatExpiry {
    /// Lasts until explicitly reset
    Permanent,
    /// Lasts until the given instant
    Until(DateTime<Utc>),
}

/// A single applied temporary stat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryStatEntry {
    pub kind: TemporaryStatType,
    /// Skill or item that applied the stat
    pub template_id: i32,
    pub option: i16,
    pub expiry: StatExpiry,
}

impl TemporaryStatEntry {
    /// Whether the entry has run out at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            StatExpiry::Permanent => false,
            StatExpiry::Until(at) => at <= now,
        }
    }

    /// Remaining duration in milliseconds (0 for permanent entries)
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i32 {
        match self.expiry {
            StatExpiry::Permanent => 0,
            StatExpiry::Until(at) => (at - now)
                .num_milliseconds()
                .clamp(0, i32::MAX as i64) as i32,
        }
    }
}

/// Temporary stats currently applied to a user
#[derive(Debug, Clone, Default)]
pub struct TemporaryStat {
    entries: BTreeMap<TemporaryStatType, TemporaryStatEntry>,
}

impl TemporaryStat {
    /// Create an empty stat set
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an applied entry
    pub fn get(&self, kind: TemporaryStatType) -> Option<&TemporaryStatEntry> {
        self.entries.get(&kind)
    }

    /// Number of applied entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is applied
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Kinds that have run out at `now`
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<TemporaryStatType> {
        self.entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.kind)
            .collect()
    }

    /// Whether anything has run out at `now`
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.entries.values().any(|e| e.is_expired(now))
    }
}

/// Batch of temporary stat changes.
///
/// Every `set` first resets the same kind, so a refreshed buff is reported as
/// a reset followed by a set.
#[derive(Debug)]
pub struct ModifyTemporaryStatContext<'a> {
    stats: &'a mut TemporaryStat,
    resets: Vec<TemporaryStatEntry>,
    sets: Vec<TemporaryStatEntry>,
}

impl<'a> ModifyTemporaryStatContext<'a> {
    /// Start a batch against `stats`
    pub fn new(stats: &'a mut TemporaryStat) -> Self {
        Self {
            stats,
            resets: Vec::new(),
            sets: Vec::new(),
        }
    }

    /// Apply a stat until it is reset
    pub fn set(&mut self, kind: TemporaryStatType, template_id: i32, option: i16) {
        self.apply(TemporaryStatEntry {
            kind,
            template_id,
            option,
            expiry: StatExpiry::Permanent,
        });
    }

    /// Apply a stat until `expiry`
    pub fn set_until(
        &mut self,
        kind: TemporaryStatType,
        template_id: i32,
        option: i16,
        expiry: DateTime<Utc>,
    ) {
        self.apply(TemporaryStatEntry {
            kind,
            template_id,
            option,
            expiry: StatExpiry::Until(expiry),
        });
    }

    fn apply(&mut self, entry: TemporaryStatEntry) {
        self.reset(entry.kind);
        self.sets.retain(|e| e.kind != entry.kind);
        self.sets.push(entry.clone());
        self.stats.entries.insert(entry.kind, entry);
    }

    /// Remove a stat if it is applied
    pub fn reset(&mut self, kind: TemporaryStatType) {
        if let Some(previous) = self.stats.entries.remove(&kind) {
            self.resets.push(previous);
        }
    }

    /// Entries removed by this batch
    pub fn resets(&self) -> &[TemporaryStatEntry] {
        &self.resets
    }

    /// Entries applied by this batch
    pub fn sets(&self) -> &[TemporaryStatEntry] {
        &self.sets
    }

    /// Build the reset and set packets for this batch (either may be absent)
    pub fn into_packets(self, now: DateTime<Utc>) -> (Option<OutPacket>, Option<OutPacket>) {
        let reset = (!self.resets.is_empty()).then(|| {
            let mut p = OutPacket::builder(SendOperation::TemporaryStatReset);
            encode_mask(&mut p, &self.resets);
            p.write_u8(0);
            p.build()
        });

        let set = (!self.sets.is_empty()).then(|| {
            let mut sets = self.sets;
            sets.sort_by_key(|e| e.kind);

            let mut p = OutPacket::builder(SendOperation::TemporaryStatSet);
            encode_mask(&mut p, &sets);
            for entry in &sets {
                p.write_i16(entry.option)
                    .write_i32(entry.template_id)
                    .write_i32(entry.remaining_ms(now));
            }
            // Delay and movement-affecting flag
            p.write_i16(0).write_u8(0);
            p.build()
        });

        (reset, set)
    }
}

/// Write the stat mask, most significant word first
fn encode_mask(buffer: &mut PacketBuffer, entries: &[TemporaryStatEntry]) {
    let mut words = [0u32; MASK_WORDS];
    for entry in entries {
        let bit = entry.kind.bit() as usize;
        words[bit / 32] |= 1 << (bit % 32);
    }
    for word in words.iter().rev() {
        buffer.write_u32(*word);
    }
}
