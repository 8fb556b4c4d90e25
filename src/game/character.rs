//! Character profiles
//!
//! The persistent part of a user: identity, appearance, stats and location.
//! Profiles are kept in a [`CharacterStore`]; the field engine reads a
//! profile when a user migrates in and writes it back on disconnect.

use std::collections::BTreeMap;
use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::net::buffer::PacketBuffer;

/// Fixed width of the name field in the stat blob
const NAME_LENGTH: usize = 13;

/// Default buddy list capacity
const BUDDY_CAPACITY: u8 = 20;

/// Default slots per inventory tab
const INVENTORY_SLOTS: u8 = 24;

/// A character profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub gender: u8,
    #[serde(default)]
    pub skin: u8,
    #[serde(default = "default_face")]
    pub face: i32,
    #[serde(default = "default_hair")]
    pub hair: i32,
    #[serde(default = "default_level")]
    pub level: u8,
    #[serde(default)]
    pub job: i16,
    #[serde(default = "default_base_stat")]
    pub str: i16,
    #[serde(default = "default_base_stat")]
    pub dex: i16,
    #[serde(default = "default_base_stat")]
    pub int: i16,
    #[serde(default = "default_base_stat")]
    pub luk: i16,
    #[serde(default = "default_pool")]
    pub hp: i32,
    #[serde(default = "default_pool")]
    pub max_hp: i32,
    #[serde(default = "default_pool")]
    pub mp: i32,
    #[serde(default = "default_pool")]
    pub max_mp: i32,
    #[serde(default)]
    pub ap: i16,
    #[serde(default)]
    pub sp: i16,
    #[serde(default)]
    pub exp: i32,
    #[serde(default)]
    pub fame: i16,
    #[serde(default)]
    pub money: i32,
    /// Field the character is in (or returns to)
    pub field_id: i32,
    /// Last portal used; the spawn point on the next enter
    #[serde(default)]
    pub field_portal: u8,
    /// Equipped items by body slot
    #[serde(default)]
    pub equipped: BTreeMap<u8, i32>,
}

fn default_face() -> i32 {
    20000
}

fn default_hair() -> i32 {
    30000
}

fn default_level() -> u8 {
    1
}

fn default_base_stat() -> i16 {
    4
}

fn default_pool() -> i32 {
    50
}

impl Character {
    /// Create a level 1 character standing in `field_id`
    pub fn new(id: i32, name: impl Into<String>, field_id: i32) -> Self {
        Self {
            id,
            name: name.into(),
            gender: 0,
            skin: 0,
            face: default_face(),
            hair: default_hair(),
            level: default_level(),
            job: 0,
            str: default_base_stat(),
            dex: default_base_stat(),
            int: default_base_stat(),
            luk: default_base_stat(),
            hp: default_pool(),
            max_hp: default_pool(),
            mp: default_pool(),
            max_mp: default_pool(),
            ap: 0,
            sp: 0,
            exp: 0,
            fame: 0,
            money: 0,
            field_id,
            field_portal: 0,
            equipped: BTreeMap::new(),
        }
    }

    /// Encode the stat blob
    pub fn encode_stats(&self, p: &mut PacketBuffer) {
        p.write_i32(self.id);

        let mut name = [0u8; NAME_LENGTH];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(NAME_LENGTH - 1);
        name[..len].copy_from_slice(&bytes[..len]);
        p.write_bytes(&name);

        p.write_u8(self.gender)
            .write_u8(self.skin)
            .write_i32(self.face)
            .write_i32(self.hair);

        // Pet locker serials
        for _ in 0..3 {
            p.write_i64(0);
        }

        p.write_u8(self.level)
            .write_i16(self.job)
            .write_i16(self.str)
            .write_i16(self.dex)
            .write_i16(self.int)
            .write_i16(self.luk)
            .write_i32(self.hp)
            .write_i32(self.max_hp)
            .write_i32(self.mp)
            .write_i32(self.max_mp)
            .write_i16(self.ap)
            .write_i16(self.sp)
            .write_i32(self.exp)
            .write_i16(self.fame)
            .write_i32(0) // temp exp
            .write_i32(self.field_id)
            .write_u8(self.field_portal)
            .write_i32(0) // play time
            .write_i16(0); // sub job
    }

    /// Encode the appearance blob
    pub fn encode_look(&self, p: &mut PacketBuffer) {
        p.write_u8(self.gender)
            .write_u8(self.skin)
            .write_i32(self.face)
            .write_bool(false)
            .write_i32(self.hair);

        for (slot, item) in &self.equipped {
            p.write_u8(*slot).write_i32(*item);
        }
        p.write_u8(0xFF);
        // Cash-covered slots
        p.write_u8(0xFF);

        p.write_i32(0); // cash weapon
        for _ in 0..3 {
            p.write_i32(0); // pets
        }
    }

    /// Encode the full character data blob sent on first field entry
    pub fn encode_data(&self, p: &mut PacketBuffer) {
        p.write_i64(-1) // all sections present
            .write_u8(0)
            .write_u8(0);

        self.encode_stats(p);

        p.write_u8(BUDDY_CAPACITY)
            .write_bool(false)
            .write_i32(self.money);

        // Slot limits for the five inventory tabs, then an empty tab each
        for _ in 0..5 {
            p.write_u8(INVENTORY_SLOTS);
        }
        p.write_i64(0);
        for _ in 0..3 {
            p.write_i16(0); // equip tabs
        }
        for _ in 0..4 {
            p.write_u8(0); // bundle tabs
        }

        // Skills, cooldowns, quests, minigames, rings, teleport rocks
        p.write_i16(0).write_i16(0);
        p.write_i16(0).write_i16(0);
        p.write_i16(0);
        p.write_i16(0).write_i16(0).write_i16(0).write_i16(0);
        for _ in 0..15 {
            p.write_i32(999_999_999);
        }
        p.write_i16(0).write_i16(0).write_i16(0);
    }
}

/// Concurrent in-memory store of character profiles
#[derive(Debug, Default)]
pub struct CharacterStore {
    characters: DashMap<i32, Character>,
}

impl CharacterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load characters from a JSON array
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let characters: Vec<Character> = serde_json::from_str(&content)?;

        let store = Self::new();
        for character in characters {
            store.save(character);
        }

        info!(path = %path.display(), count = store.len(), "Loaded characters");
        Ok(store)
    }

    /// Get a copy of a character profile
    pub fn get(&self, id: i32) -> Option<Character> {
        self.characters.get(&id).map(|c| c.clone())
    }

    /// Store a character profile, replacing any previous version
    pub fn save(&self, character: Character) {
        debug!(character_id = character.id, field_id = character.field_id, "Saving character");
        self.characters.insert(character.id, character);
    }

    /// Number of stored characters
    pub fn len(&self) -> usize {
        self.characters.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }
}
