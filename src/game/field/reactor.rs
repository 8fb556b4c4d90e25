//! Reactors
//!
//! Interactive map objects (boxes, levers, plants) that cycle through hit
//! states when struck.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::object::{ObjectBase, ObjectId, Placement, Point};
use super::user::FieldUser;
use super::{Dispatch, Field};
use crate::error::Result;
use crate::game::template::{ReactorSpawn, ReactorTemplate};
use crate::net::buffer::PacketBuffer;
use crate::protocol::opcodes::{RecvOperation, SendOperation};
use crate::protocol::packets::OutPacket;

#[derive(Debug)]
pub struct FieldReactor {
    pub(crate) base: ObjectBase,
    pub template: Arc<ReactorTemplate>,
    pub flip: bool,
    pub name: String,
    state: AtomicU8,
}

impl FieldReactor {
    pub fn new(template: Arc<ReactorTemplate>, position: Point, flip: bool, name: String) -> Arc<Self> {
        Arc::new(Self {
            base: ObjectBase::new(Placement::at(position, 0, 0)),
            template,
            flip,
            name,
            state: AtomicU8::new(0),
        })
    }

    /// Reactor placed by a field spawn entry
    pub fn from_spawn(template: Arc<ReactorTemplate>, spawn: &ReactorSpawn) -> Arc<Self> {
        Self::new(
            template,
            Point::new(spawn.x, spawn.y),
            spawn.flip,
            spawn.name.clone(),
        )
    }

    pub fn id(&self) -> ObjectId {
        self.base.id()
    }

    /// Current hit state
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    /// Move to the next hit state, wrapping at the template's state count
    pub fn advance(&self) -> u8 {
        let count = self.template.state_count.max(1);
        let previous = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| Some((s + 1) % count))
            .unwrap_or_else(|s| s);
        (previous + 1) % count
    }

    /// Handle a reactor-scoped operation from `user`
    pub async fn handle(
        &self,
        field: &Field,
        user: &Arc<FieldUser>,
        operation: RecvOperation,
        packet: &mut PacketBuffer,
    ) -> Result<Dispatch> {
        match operation {
            RecvOperation::ReactorHit => {
                let option = packet.read_i32()?;
                let delay = packet.read_i16()?;
                let skill_id = packet.read_i32()?;

                let state = self.advance();
                debug!(
                    reactor_id = self.id(),
                    user_id = user.id(),
                    option,
                    skill_id,
                    state,
                    "Reactor hit"
                );

                field.broadcast(&self.change_state_packet(state, delay)).await;
                Ok(Dispatch::Handled)
            }
            RecvOperation::ReactorTouch => {
                debug!(reactor_id = self.id(), user_id = user.id(), "Reactor touched");
                Ok(Dispatch::Handled)
            }
            _ => Ok(Dispatch::Unhandled),
        }
    }

    /// Reactor-Change-State packet
    pub fn change_state_packet(&self, state: u8, delay: i16) -> OutPacket {
        let position = self.base.placement().position;
        let mut p = OutPacket::builder(SendOperation::ReactorChangeState);
        p.write_i32(self.id())
            .write_u8(state)
            .write_i16(position.x)
            .write_i16(position.y)
            .write_i16(delay)
            .write_u8(0)
            .write_u8(0);
        p.build()
    }

    /// Reactor-Enter-Field packet
    pub fn enter_packet(&self) -> OutPacket {
        let position = self.base.placement().position;
        let mut p = OutPacket::builder(SendOperation::ReactorEnterField);
        p.write_i32(self.id())
            .write_i32(self.template.id)
            .write_u8(self.state())
            .write_i16(position.x)
            .write_i16(position.y)
            .write_bool(self.flip)
            .write_string(&self.name);
        p.build()
    }

    /// Reactor-Leave-Field packet
    pub fn leave_packet(&self) -> OutPacket {
        let position = self.base.placement().position;
        let mut p = OutPacket::builder(SendOperation::ReactorLeaveField);
        p.write_i32(self.id())
            .write_u8(self.state())
            .write_i16(position.x)
            .write_i16(position.y);
        p.build()
    }
}
