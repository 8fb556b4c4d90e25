//! Mobs and NPCs
//!
//! Both are template-backed and simulated by one controlling user at a time.
//! Movement reports are only accepted from the current controller.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::object::{ControlledObject, ObjectBase, ObjectId, Placement, Point};
use super::user::FieldUser;
use super::{Dispatch, Field};
use crate::error::Result;
use crate::game::template::{LifeSpawn, MobTemplate, NpcTemplate};
use crate::net::buffer::PacketBuffer;
use crate::protocol::movement::MovePath;
use crate::protocol::opcodes::{RecvOperation, SendOperation};
use crate::protocol::packets::OutPacket;

/// Summon type for life placed by a field's spawn list
const SUMMON_REGEN: i8 = -2;

/// A monster
#[derive(Debug)]
pub struct FieldMob {
    pub(crate) base: ObjectBase,
    pub template: Arc<MobTemplate>,
    /// Foothold the mob was spawned on
    pub home_foothold: i16,
    controller: RwLock<Option<ObjectId>>,
}

impl FieldMob {
    pub fn new(template: Arc<MobTemplate>, placement: Placement) -> Arc<Self> {
        Arc::new(Self {
            base: ObjectBase::new(placement),
            template,
            home_foothold: placement.foothold,
            controller: RwLock::new(None),
        })
    }

    /// Mob placed by a field spawn entry
    pub fn from_spawn(template: Arc<MobTemplate>, spawn: &LifeSpawn) -> Arc<Self> {
        Self::new(
            template,
            Placement::at(Point::new(spawn.x, spawn.y), spawn.move_action, spawn.foothold),
        )
    }

    pub fn id(&self) -> ObjectId {
        self.base.id()
    }

    pub fn placement(&self) -> Placement {
        self.base.placement()
    }

    /// Handle a mob-scoped operation from `user`
    pub async fn handle(
        &self,
        field: &Field,
        user: &Arc<FieldUser>,
        operation: RecvOperation,
        packet: &mut PacketBuffer,
    ) -> Result<Dispatch> {
        match operation {
            RecvOperation::MobMove => {
                if self.controller() != Some(user.id()) {
                    debug!(
                        mob_id = self.id(),
                        user_id = user.id(),
                        "Ignoring mob move from non-controller"
                    );
                    return Ok(Dispatch::Handled);
                }
                self.on_move(field, user, packet).await?;
                Ok(Dispatch::Handled)
            }
            _ => Ok(Dispatch::Unhandled),
        }
    }

    async fn on_move(&self, field: &Field, user: &FieldUser, packet: &mut PacketBuffer) -> Result<()> {
        let ctrl_sn = packet.read_i16()?;
        let flags = packet.read_u8()?;
        let next_attack_possible = flags & 0x0F != 0;
        let action = packet.read_u8()?;
        let target_info = packet.read_i32()?;

        let mut multi_target = Vec::new();
        for _ in 0..packet.read_i32()?.max(0) {
            multi_target.push(Point::new(packet.read_i16()?, packet.read_i16()?));
        }
        let mut rand_time = Vec::new();
        for _ in 0..packet.read_i32()?.max(0) {
            rand_time.push(packet.read_i32()?);
        }

        let path = MovePath::decode(packet)?;
        self.base.update_placement(|p| p.apply_path(&path));

        let mut ack = OutPacket::builder(SendOperation::MobCtrlAck);
        ack.write_i32(self.id())
            .write_i16(ctrl_sn)
            .write_bool(next_attack_possible)
            .write_i16(self.template.max_mp.clamp(0, i16::MAX as i32) as i16)
            .write_u8(0)
            .write_u8(0);
        user.send(&ack.build()).await?;

        let mut p = OutPacket::builder(SendOperation::MobMove);
        p.write_i32(self.id())
            .write_bool(next_attack_possible)
            .write_u8(flags)
            .write_u8(action)
            .write_i32(target_info)
            .write_i32(multi_target.len() as i32);
        for point in &multi_target {
            p.write_i16(point.x).write_i16(point.y);
        }
        p.write_i32(rand_time.len() as i32);
        for time in &rand_time {
            p.write_i32(*time);
        }
        path.encode(&mut p);

        field.broadcast_except(user.id(), &p.build()).await;
        Ok(())
    }

    fn encode_init(&self, p: &mut PacketBuffer) {
        let placement = self.base.placement();
        p.write_i32(self.template.id)
            .write_u32(0) // temporary stat mask
            .write_u32(0)
            .write_u32(0)
            .write_u32(0)
            .write_i16(placement.position.x)
            .write_i16(placement.position.y)
            .write_u8(placement.move_action)
            .write_i16(placement.foothold)
            .write_i16(self.home_foothold)
            .write_i8(SUMMON_REGEN)
            .write_i8(-1) // team
            .write_i32(0);
    }

    /// Mob-Enter-Field packet
    pub fn enter_packet(&self) -> OutPacket {
        let mut p = OutPacket::builder(SendOperation::MobEnterField);
        p.write_i32(self.id()).write_u8(1);
        self.encode_init(&mut p);
        p.build()
    }

    /// Mob-Leave-Field packet
    pub fn leave_packet(&self) -> OutPacket {
        let mut p = OutPacket::builder(SendOperation::MobLeaveField);
        p.write_i32(self.id()).write_u8(1);
        p.build()
    }
}

impl ControlledObject for FieldMob {
    fn controller(&self) -> Option<ObjectId> {
        *self.controller.read()
    }

    fn set_controller(&self, controller: Option<ObjectId>) {
        *self.controller.write() = controller;
    }

    fn change_controller_packet(&self, controlling: bool) -> OutPacket {
        let mut p = OutPacket::builder(SendOperation::MobChangeController);
        p.write_bool(controlling).write_i32(self.id());
        if controlling {
            p.write_u8(1);
            self.encode_init(&mut p);
        }
        p.build()
    }
}

/// A non-player character
#[derive(Debug)]
pub struct FieldNpc {
    pub(crate) base: ObjectBase,
    pub template: Arc<NpcTemplate>,
    /// Patrol range
    pub rx0: i16,
    pub rx1: i16,
    controller: RwLock<Option<ObjectId>>,
}

impl FieldNpc {
    pub fn new(template: Arc<NpcTemplate>, placement: Placement, rx0: i16, rx1: i16) -> Arc<Self> {
        Arc::new(Self {
            base: ObjectBase::new(placement),
            template,
            rx0,
            rx1,
            controller: RwLock::new(None),
        })
    }

    /// NPC placed by a field spawn entry
    pub fn from_spawn(template: Arc<NpcTemplate>, spawn: &LifeSpawn) -> Arc<Self> {
        Self::new(
            template,
            Placement::at(Point::new(spawn.x, spawn.y), spawn.move_action, spawn.foothold),
            spawn.rx0,
            spawn.rx1,
        )
    }

    pub fn id(&self) -> ObjectId {
        self.base.id()
    }

    pub fn placement(&self) -> Placement {
        self.base.placement()
    }

    /// Handle an NPC-scoped operation from `user`
    pub async fn handle(
        &self,
        field: &Field,
        user: &Arc<FieldUser>,
        operation: RecvOperation,
        packet: &mut PacketBuffer,
    ) -> Result<Dispatch> {
        if operation != RecvOperation::NpcMove {
            return Ok(Dispatch::Unhandled);
        }
        if self.controller() != Some(user.id()) {
            debug!(npc_id = self.id(), user_id = user.id(), "Ignoring NPC move from non-controller");
            return Ok(Dispatch::Handled);
        }

        let action1 = packet.read_u8()?;
        let action2 = packet.read_u8()?;
        let path = if packet.has_remaining() {
            Some(MovePath::decode(packet)?)
        } else {
            None
        };

        let mut p = OutPacket::builder(SendOperation::NpcMove);
        p.write_i32(self.id()).write_u8(action1).write_u8(action2);
        if let Some(path) = &path {
            path.encode(&mut p);
            self.base.update_placement(|placement| placement.apply_path(path));
        }

        field.broadcast(&p.build()).await;
        Ok(Dispatch::Handled)
    }

    fn encode_init(&self, p: &mut PacketBuffer) {
        let placement = self.base.placement();
        p.write_i32(self.template.id)
            .write_i16(placement.position.x)
            .write_i16(placement.position.y)
            .write_bool(placement.move_action & 1 == 0)
            .write_i16(placement.foothold)
            .write_i16(self.rx0)
            .write_i16(self.rx1)
            .write_bool(true);
    }

    /// Npc-Enter-Field packet
    pub fn enter_packet(&self) -> OutPacket {
        let mut p = OutPacket::builder(SendOperation::NpcEnterField);
        p.write_i32(self.id());
        self.encode_init(&mut p);
        p.build()
    }

    /// Npc-Leave-Field packet
    pub fn leave_packet(&self) -> OutPacket {
        let mut p = OutPacket::builder(SendOperation::NpcLeaveField);
        p.write_i32(self.id());
        p.build()
    }
}

impl ControlledObject for FieldNpc {
    fn controller(&self) -> Option<ObjectId> {
        *self.controller.read()
    }

    fn set_controller(&self, controller: Option<ObjectId>) {
        *self.controller.write() = controller;
    }

    fn change_controller_packet(&self, controlling: bool) -> OutPacket {
        let mut p = OutPacket::builder(SendOperation::NpcChangeController);
        p.write_bool(controlling).write_i32(self.id());
        if controlling {
            self.encode_init(&mut p);
        }
        p.build()
    }
}
