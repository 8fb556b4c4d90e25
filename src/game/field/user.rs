//! Field users
//!
//! A user is a connected character standing in a field. Its object id is
//! always its character id. Besides the shared field object state it owns
//! the connection session, the character profile and the temporary stats.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::object::{FieldObject, ObjectBase, ObjectId, Placement};
use super::{Dispatch, Field};
use crate::error::{GameError, Result};
use crate::game::character::Character;
use crate::game::stats::{ModifyTemporaryStatContext, TemporaryStat};
use crate::net::buffer::PacketBuffer;
use crate::net::session::Session;
use crate::protocol::movement::MovePath;
use crate::protocol::opcodes::{RecvOperation, SendOperation};
use crate::protocol::packets::OutPacket;

/// A character placed in a field
#[derive(Debug)]
pub struct FieldUser {
    pub(crate) base: ObjectBase,
    /// Connection this user talks through
    pub session: Arc<Session>,
    character: RwLock<Character>,
    temporary_stat: Mutex<TemporaryStat>,
}

impl FieldUser {
    /// Create a user for `character` on `session`
    pub fn new(session: Arc<Session>, character: Character) -> Arc<Self> {
        let base = ObjectBase::new(Placement {
            id: character.id,
            ..Placement::default()
        });

        Arc::new(Self {
            base,
            session,
            character: RwLock::new(character),
            temporary_stat: Mutex::new(TemporaryStat::new()),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.base.id()
    }

    /// Current placement
    pub fn placement(&self) -> Placement {
        self.base.placement()
    }

    /// The field this user is in
    pub fn field(&self) -> Option<Arc<Field>> {
        self.base.field()
    }

    /// Copy of the character profile
    pub fn character(&self) -> Character {
        self.character.read().clone()
    }

    /// Read from the character profile
    pub fn with_character<R>(&self, f: impl FnOnce(&Character) -> R) -> R {
        f(&self.character.read())
    }

    /// Mutate the character profile
    pub fn update_character(&self, f: impl FnOnce(&mut Character)) {
        f(&mut self.character.write());
    }

    /// Copy of the applied temporary stats
    pub fn temporary_stat(&self) -> TemporaryStat {
        self.temporary_stat.lock().clone()
    }

    /// Send a packet to this user
    pub async fn send(&self, packet: &OutPacket) -> Result<()> {
        self.session.send(packet).await
    }

    /// Apply a batch of temporary stat changes and report them to the client
    pub async fn modify_temporary_stats<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ModifyTemporaryStatContext<'_>),
    {
        let (reset, set) = {
            let mut stats = self.temporary_stat.lock();
            let mut ctx = ModifyTemporaryStatContext::new(&mut stats);
            f(&mut ctx);
            ctx.into_packets(Utc::now())
        };

        if let Some(reset) = reset {
            self.send(&reset).await?;
        }
        if let Some(set) = set {
            self.send(&set).await?;
        }
        Ok(())
    }

    /// Reset temporary stats that ran out
    pub async fn update(self: &Arc<Self>, now: DateTime<Utc>) {
        let expired = self.temporary_stat.lock().expired(now);
        if expired.is_empty() {
            return;
        }

        let result = self
            .modify_temporary_stats(|ctx| {
                for kind in expired {
                    ctx.reset(kind);
                }
            })
            .await;

        if let Err(e) = result {
            debug!(user_id = self.id(), error = %e, "Failed to report expired stats");
        }
    }

    /// Handle a user-scoped operation
    pub async fn handle(
        self: &Arc<Self>,
        field: &Arc<Field>,
        operation: RecvOperation,
        packet: &mut PacketBuffer,
    ) -> Result<Dispatch> {
        match operation {
            RecvOperation::UserTransferFieldRequest => self.on_transfer_field(field, packet).await?,
            RecvOperation::UserMove => self.on_move(field, packet).await?,
            RecvOperation::UserChat => self.on_chat(field, packet).await?,
            RecvOperation::UserEmotion => self.on_emotion(field, packet).await?,
            RecvOperation::UserCharacterInfoRequest => {
                self.on_character_info_request(field, packet).await?
            }
            _ => return Ok(Dispatch::Unhandled),
        }
        Ok(Dispatch::Handled)
    }

    async fn on_transfer_field(self: &Arc<Self>, field: &Arc<Field>, packet: &mut PacketBuffer) -> Result<()> {
        packet.read_u8()?;
        packet.read_i32()?;
        let name = packet.read_string()?;

        let portal = field
            .template()
            .portal_by_name(&name)
            .cloned()
            .ok_or_else(|| GameError::PortalNotFound {
                field_id: field.id(),
                name,
            })?;

        let target = field.manager()?.get(portal.target_field).await?;
        let arrival = target
            .template()
            .portal_by_name(&portal.target_portal)
            .map(|p| p.id)
            .ok_or_else(|| GameError::PortalNotFound {
                field_id: target.id(),
                name: portal.target_portal.clone(),
            })?;

        debug!(
            user_id = self.id(),
            from = field.id(),
            to = target.id(),
            portal = %portal.name,
            "Transferring user"
        );

        // The target resolves the spawn point from the character's portal
        let previous = self.with_character(|c| c.field_portal);
        self.update_character(|c| c.field_portal = arrival);
        if let Err(e) = target.enter(FieldObject::User(self.clone())).await {
            self.update_character(|c| c.field_portal = previous);
            return Err(e);
        }
        Ok(())
    }

    async fn on_move(&self, field: &Field, packet: &mut PacketBuffer) -> Result<()> {
        packet.read_i64()?;
        packet.read_u8()?;
        packet.read_i64()?;
        packet.read_i32()?;
        packet.read_i32()?;
        packet.read_i32()?;

        let path = MovePath::decode(packet)?;

        let mut p = OutPacket::builder(SendOperation::UserMove);
        p.write_i32(self.id());
        path.encode(&mut p);

        self.base.update_placement(|placement| placement.apply_path(&path));
        field.broadcast_except(self.id(), &p.build()).await;
        Ok(())
    }

    async fn on_chat(&self, field: &Field, packet: &mut PacketBuffer) -> Result<()> {
        packet.read_i32()?;
        let message = packet.read_string()?;
        let only_balloon = packet.read_bool()?;

        let mut p = OutPacket::builder(SendOperation::UserChat);
        p.write_i32(self.id())
            .write_bool(false)
            .write_string(&message)
            .write_bool(only_balloon);

        field.broadcast(&p.build()).await;
        Ok(())
    }

    async fn on_emotion(&self, field: &Field, packet: &mut PacketBuffer) -> Result<()> {
        let emotion = packet.read_i32()?;
        let duration = packet.read_i32()?;
        let by_item_option = packet.read_bool()?;

        let mut p = OutPacket::builder(SendOperation::UserEmotion);
        p.write_i32(self.id())
            .write_i32(emotion)
            .write_i32(duration)
            .write_bool(by_item_option);

        field.broadcast_except(self.id(), &p.build()).await;
        Ok(())
    }

    async fn on_character_info_request(&self, field: &Field, packet: &mut PacketBuffer) -> Result<()> {
        packet.read_i32()?;
        let target_id = packet.read_i32()?;

        let Some(target) = field.lookup_user(target_id) else {
            return Ok(());
        };
        let (level, job, fame) = target.with_character(|c| (c.level, c.job, c.fame));

        let mut p = OutPacket::builder(SendOperation::CharacterInfo);
        p.write_i32(self.id())
            .write_u8(level)
            .write_i16(job)
            .write_i16(fame)
            .write_u8(0)
            .write_string("") // community
            .write_string("") // alliance
            .write_u8(0)
            .write_u8(0)
            .write_u8(0) // taming mob
            .write_u8(0) // wish list
            .write_i32(0) // medal
            .write_i16(0)
            .write_i32(0); // chair

        self.send(&p.build()).await
    }

    /// Set-Field packet for the user's current field
    pub fn set_field_packet(&self) -> OutPacket {
        let character = self.character.read();
        let instantiated = self.session.is_instantiated();

        let mut p = OutPacket::builder(SendOperation::SetField);
        p.write_i16(0) // client option
            .write_i32(0)
            .write_i32(0)
            .write_bool(true)
            .write_bool(!instantiated)
            .write_i16(0);

        if !instantiated {
            for seed in self.session.seeds() {
                p.write_u32(seed);
            }

            character.encode_data(&mut p);

            for _ in 0..4 {
                p.write_i32(0);
            }
        } else {
            p.write_u8(0)
                .write_i32(character.field_id)
                .write_u8(character.field_portal)
                .write_i32(character.hp)
                .write_bool(false);
        }

        p.write_i64(0);
        p.build()
    }

    /// User-Enter-Field packet
    pub fn enter_packet(&self) -> OutPacket {
        let character = self.character.read();
        let placement = self.base.placement();

        let mut p = OutPacket::builder(SendOperation::UserEnterField);
        p.write_i32(placement.id)
            .write_u8(character.level)
            .write_string(&character.name);

        // Guild
        p.write_string("")
            .write_i16(0)
            .write_u8(0)
            .write_i16(0)
            .write_u8(0);

        p.write_i64(0)
            .write_i64(0)
            .write_u8(0)
            .write_u8(0)
            .write_i16(character.job);
        character.encode_look(&mut p);

        for _ in 0..6 {
            p.write_i32(0);
        }

        p.write_i16(placement.position.x)
            .write_i16(placement.position.y)
            .write_u8(placement.move_action)
            .write_i16(placement.foothold)
            .write_u8(0)
            .write_u8(0);

        for _ in 0..3 {
            p.write_i32(0);
        }
        for _ in 0..7 {
            p.write_u8(0);
        }
        p.write_i32(0);

        p.build()
    }

    /// User-Leave-Field packet
    pub fn leave_packet(&self) -> OutPacket {
        let mut p = OutPacket::builder(SendOperation::UserLeaveField);
        p.write_i32(self.id());
        p.build()
    }
}

/// Log a failed send to a user without failing the caller
pub(crate) fn log_send_failure(user: &FieldUser, result: Result<()>) {
    if let Err(e) = result {
        warn!(user_id = user.id(), error = %e, "Failed to send packet to user");
    }
}
