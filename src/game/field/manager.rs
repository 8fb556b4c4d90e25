//! Field factory
//!
//! Creates fields on first request, seeds them with their static life and
//! reactors, and caches them for the lifetime of the server.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::info;

use super::life::{FieldMob, FieldNpc};
use super::object::FieldObject;
use super::reactor::FieldReactor;
use super::Field;
use crate::error::Result;
use crate::game::template::{LifeKind, TemplateStore};

/// Lazily creates and caches one field per map id
pub struct FieldManager {
    templates: Arc<TemplateStore>,
    fields: Mutex<HashMap<i32, Arc<Field>>>,
    this: Weak<FieldManager>,
}

impl FieldManager {
    pub fn new(templates: Arc<TemplateStore>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            templates,
            fields: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    /// Get the field for `id`, creating and seeding it on first use
    pub async fn get(&self, id: i32) -> Result<Arc<Field>> {
        let mut fields = self.fields.lock().await;
        if let Some(field) = fields.get(&id) {
            return Ok(field.clone());
        }

        let template = self.templates.field(id)?;
        let field = Field::new(id, template.clone(), self.this.clone());

        for spawn in &template.life {
            let object = match spawn.kind {
                LifeKind::Npc => {
                    let template = self.templates.npc(spawn.template_id)?;
                    FieldObject::Npc(FieldNpc::from_spawn(template, spawn))
                }
                LifeKind::Monster => {
                    let template = self.templates.mob(spawn.template_id)?;
                    FieldObject::Mob(FieldMob::from_spawn(template, spawn))
                }
            };
            field.enter(object).await?;
        }

        for spawn in &template.reactors {
            let template = self.templates.reactor(spawn.template_id)?;
            let reactor = FieldReactor::from_spawn(template, spawn);
            field.enter(FieldObject::Reactor(reactor)).await?;
        }

        info!(
            field_id = id,
            objects = field.member_count(),
            "Field created"
        );

        fields.insert(id, field.clone());
        Ok(field)
    }

    /// Fields created so far
    pub async fn loaded(&self) -> Vec<Arc<Field>> {
        self.fields.lock().await.values().cloned().collect()
    }

    /// Number of fields created so far
    pub async fn count(&self) -> usize {
        self.fields.lock().await.len()
    }

    /// Update every loaded field concurrently
    pub async fn update_all(&self, now: DateTime<Utc>) {
        let fields = self.loaded().await;
        join_all(fields.iter().map(|f| f.update(now))).await;
    }
}

impl std::fmt::Debug for FieldManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldManager")
            .field("templates", &self.templates.field_count())
            .finish()
    }
}
