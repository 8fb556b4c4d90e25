//! Application state module
//!
//! Contains the shared state used across all server connections.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::game::character::CharacterStore;
use crate::game::field::FieldManager;
use crate::game::template::TemplateStore;
use crate::game::world::{GameWorld, WorldSettings};
use crate::net::session::SessionManager;

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Session manager for tracking connected clients
    pub session_manager: SessionManager,
    /// Static field, NPC, mob and reactor data
    pub templates: Arc<TemplateStore>,
    /// Character profiles
    pub characters: Arc<CharacterStore>,
    /// Field factory
    pub fields: Arc<FieldManager>,
    /// Tick driver
    pub world: Arc<GameWorld>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create the application state, loading data files from `config.data_path`
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let templates_path = config.templates_path();
        let templates = if templates_path.exists() {
            TemplateStore::load_json(&templates_path)?
        } else {
            warn!(
                path = %templates_path.display(),
                "Template file not found, no fields will be available"
            );
            TemplateStore::new()
        };

        let characters_path = config.characters_path();
        let characters = if characters_path.exists() {
            CharacterStore::load_json(&characters_path)?
        } else {
            warn!(
                path = %characters_path.display(),
                "Character file not found, starting with no characters"
            );
            CharacterStore::new()
        };

        Ok(Self::with_stores(config, shutdown_tx, templates, characters))
    }

    /// Create the application state over already-loaded stores
    pub fn with_stores(
        config: ServerConfig,
        shutdown_tx: broadcast::Sender<()>,
        templates: TemplateStore,
        characters: CharacterStore,
    ) -> Self {
        let templates = Arc::new(templates);
        let fields = FieldManager::new(templates.clone());
        let world = Arc::new(GameWorld::new(
            Self::create_world_settings(&config),
            fields.clone(),
        ));

        info!(
            field_templates = templates.field_count(),
            characters = characters.len(),
            "Application state ready"
        );

        Self {
            session_manager: SessionManager::with_limit(config.max_connections_per_ip),
            config,
            templates,
            characters: Arc::new(characters),
            fields,
            world,
            shutdown_tx,
        }
    }

    /// Create world settings from server config
    fn create_world_settings(config: &ServerConfig) -> WorldSettings {
        WorldSettings {
            world_id: config.world_id,
            channel_id: config.channel_id,
            name: config.server_name.clone(),
            dev_mode: config.dev_mode,
            tick_rate_ms: config.tick_rate_ms,
        }
    }
}
