//! Static template data
//!
//! Immutable data describing fields and the life that populates them:
//! - Field templates (portals, footholds, life and reactor spawns)
//! - NPC, mob and reactor templates
//!
//! Templates are loaded once at startup and shared behind `Arc`s. They are
//! never mutated after loading.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TemplateError};

/// Portal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalKind {
    /// Spawn point; users placed here need no foothold resolution
    Spawn,
    Invisible,
    Visible,
    Collision,
    Changeable,
    Hidden,
    Script,
}

/// A portal inside a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portal {
    pub id: u8,
    pub name: String,
    pub kind: PortalKind,
    pub x: i32,
    pub y: i32,
    /// Target field id (999999999 when the portal leads nowhere)
    #[serde(default = "default_target_field")]
    pub target_field: i32,
    /// Name of the portal to arrive at in the target field
    #[serde(default)]
    pub target_portal: String,
}

fn default_target_field() -> i32 {
    999_999_999
}

/// A walkable line segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Foothold {
    pub id: i16,
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Foothold {
    /// Whether this segment spans `x`
    pub fn spans(&self, x: i32) -> bool {
        self.x1 <= x && self.x2 >= x
    }

    /// Whether the segment runs left to right (walls and reversed segments don't)
    pub fn is_forward(&self) -> bool {
        self.x1 < self.x2
    }
}

/// Kind of life placed by a spawn entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifeKind {
    Npc,
    Monster,
}

/// Static NPC or monster placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeSpawn {
    pub kind: LifeKind,
    pub template_id: i32,
    pub x: i16,
    pub y: i16,
    /// Initial move action (facing)
    #[serde(default)]
    pub move_action: u8,
    #[serde(default)]
    pub foothold: i16,
    /// NPC patrol range
    #[serde(default)]
    pub rx0: i16,
    #[serde(default)]
    pub rx1: i16,
}

/// Static reactor placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactorSpawn {
    pub template_id: i32,
    pub x: i16,
    pub y: i16,
    #[serde(default)]
    pub flip: bool,
    #[serde(default)]
    pub name: String,
}

/// Field (zone) template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTemplate {
    pub id: i32,
    #[serde(default)]
    pub portals: Vec<Portal>,
    #[serde(default)]
    pub footholds: Vec<Foothold>,
    #[serde(default)]
    pub life: Vec<LifeSpawn>,
    #[serde(default)]
    pub reactors: Vec<ReactorSpawn>,
}

impl FieldTemplate {
    /// Find the portal a user arrives at.
    ///
    /// Prefers the portal with id `preferred`, falling back to the first
    /// spawn-kind portal.
    pub fn spawn_portal(&self, preferred: u8) -> Option<&Portal> {
        self.portals
            .iter()
            .find(|p| p.id == preferred)
            .or_else(|| self.portals.iter().find(|p| p.kind == PortalKind::Spawn))
    }

    /// Find a portal by name
    pub fn portal_by_name(&self, name: &str) -> Option<&Portal> {
        self.portals.iter().find(|p| p.name == name)
    }

    /// Find the first forward foothold spanning `x`
    pub fn foothold_below(&self, x: i32) -> Option<&Foothold> {
        self.footholds
            .iter()
            .filter(|f| f.spans(x))
            .find(|f| f.is_forward())
    }
}

/// NPC template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcTemplate {
    pub id: i32,
    #[serde(default)]
    pub name: String,
}

/// Mob template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MobTemplate {
    pub id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_level")]
    pub level: i16,
    #[serde(default)]
    pub max_hp: i32,
    #[serde(default)]
    pub max_mp: i32,
}

fn default_level() -> i16 {
    1
}

/// Reactor template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactorTemplate {
    pub id: i32,
    /// Number of hit states before the reactor wraps around
    #[serde(default = "default_state_count")]
    pub state_count: u8,
}

fn default_state_count() -> u8 {
    1
}

/// On-disk layout of the template file
#[derive(Debug, Default, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    fields: Vec<FieldTemplate>,
    #[serde(default)]
    npcs: Vec<NpcTemplate>,
    #[serde(default)]
    mobs: Vec<MobTemplate>,
    #[serde(default)]
    reactors: Vec<ReactorTemplate>,
}

/// Store of all loaded templates
#[derive(Debug, Default)]
pub struct TemplateStore {
    fields: HashMap<i32, Arc<FieldTemplate>>,
    npcs: HashMap<i32, Arc<NpcTemplate>>,
    mobs: HashMap<i32, Arc<MobTemplate>>,
    reactors: HashMap<i32, Arc<ReactorTemplate>>,
}

impl TemplateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load templates from a JSON file
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let store = Self::from_json_str(&content)?;

        info!(
            path = %path.display(),
            fields = store.fields.len(),
            npcs = store.npcs.len(),
            mobs = store.mobs.len(),
            reactors = store.reactors.len(),
            "Loaded templates"
        );

        Ok(store)
    }

    /// Parse templates from a JSON document
    pub fn from_json_str(content: &str) -> Result<Self> {
        let file: TemplateFile = serde_json::from_str(content)?;
        let mut store = Self::new();

        for field in file.fields {
            store.insert_field(field);
        }
        for npc in file.npcs {
            store.insert_npc(npc);
        }
        for mob in file.mobs {
            store.insert_mob(mob);
        }
        for reactor in file.reactors {
            store.insert_reactor(reactor);
        }

        Ok(store)
    }

    /// Add a field template
    pub fn insert_field(&mut self, template: FieldTemplate) {
        self.fields.insert(template.id, Arc::new(template));
    }

    /// Add an NPC template
    pub fn insert_npc(&mut self, template: NpcTemplate) {
        self.npcs.insert(template.id, Arc::new(template));
    }

    /// Add a mob template
    pub fn insert_mob(&mut self, template: MobTemplate) {
        self.mobs.insert(template.id, Arc::new(template));
    }

    /// Add a reactor template
    pub fn insert_reactor(&mut self, template: ReactorTemplate) {
        self.reactors.insert(template.id, Arc::new(template));
    }

    /// Get a field template
    pub fn field(&self, id: i32) -> std::result::Result<Arc<FieldTemplate>, TemplateError> {
        self.fields
            .get(&id)
            .cloned()
            .ok_or(TemplateError::FieldNotFound(id))
    }

    /// Get an NPC template
    pub fn npc(&self, id: i32) -> std::result::Result<Arc<NpcTemplate>, TemplateError> {
        self.npcs
            .get(&id)
            .cloned()
            .ok_or(TemplateError::NpcNotFound(id))
    }

    /// Get a mob template
    pub fn mob(&self, id: i32) -> std::result::Result<Arc<MobTemplate>, TemplateError> {
        self.mobs
            .get(&id)
            .cloned()
            .ok_or(TemplateError::MobNotFound(id))
    }

    /// Get a reactor template
    pub fn reactor(&self, id: i32) -> std::result::Result<Arc<ReactorTemplate>, TemplateError> {
        self.reactors
            .get(&id)
            .cloned()
            .ok_or(TemplateError::ReactorNotFound(id))
    }

    /// Number of field templates
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}
