//! Dropped items and money
//!
//! Drops are ephemeral: they leave the field when picked up or when they
//! expire. Pickup is first-claimer-wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::object::{FieldObject, ObjectBase, ObjectId, Placement, Point};
use crate::protocol::opcodes::SendOperation;
use crate::protocol::packets::OutPacket;

/// What a drop contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropContent {
    Money(i32),
    Item(i32),
}

/// How a drop disappears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropLeave {
    /// Timed out
    Expired,
    /// Picked up by a user
    PickedUp { by: ObjectId },
}

impl DropLeave {
    fn code(self) -> u8 {
        match self {
            DropLeave::Expired => 0,
            DropLeave::PickedUp { .. } => 2,
        }
    }
}

#[derive(Debug)]
pub struct FieldDrop {
    pub(crate) base: ObjectBase,
    pub content: DropContent,
    /// Character allowed to pick this up first (0 = anyone)
    pub owner_id: ObjectId,
    /// Object that dropped this
    pub source_id: ObjectId,
    pub expire: DateTime<Utc>,
    claimed: AtomicBool,
}

impl FieldDrop {
    pub fn new(
        content: DropContent,
        position: Point,
        owner_id: ObjectId,
        source_id: ObjectId,
        expire: DateTime<Utc>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: ObjectBase::new(Placement::at(position, 0, 0)),
            content,
            owner_id,
            source_id,
            expire,
            claimed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.base.id()
    }

    /// Claim the drop; only the first caller gets `true`
    pub fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire <= now
    }

    /// Leave the field once expired
    pub async fn update(self: &Arc<Self>, now: DateTime<Utc>) {
        if !self.is_expired(now) || !self.claim() {
            return;
        }
        let Some(field) = self.base.field() else {
            return;
        };

        debug!(drop_id = self.id(), field_id = field.id(), "Drop expired");
        let packet = self.leave_packet_for(DropLeave::Expired);
        field
            .leave_with(
                &FieldObject::Drop(self.clone()),
                Some(Box::new(move |_: &FieldObject| packet)),
            )
            .await;
    }

    /// Drop-Enter-Field packet
    pub fn enter_packet(&self) -> OutPacket {
        let position = self.base.placement().position;
        let (is_money, info) = match self.content {
            DropContent::Money(amount) => (true, amount),
            DropContent::Item(item_id) => (false, item_id),
        };

        let mut p = OutPacket::builder(SendOperation::DropEnterField);
        p.write_u8(1) // enter type: create
            .write_i32(self.id())
            .write_bool(is_money)
            .write_i32(info)
            .write_i32(self.owner_id)
            .write_u8(0) // own type
            .write_i16(position.x)
            .write_i16(position.y)
            .write_i32(self.source_id);
        if !is_money {
            p.write_filetime(self.expire);
        }
        p.write_bool(false).write_u8(0);
        p.build()
    }

    /// Drop-Leave-Field packet for an expired drop
    pub fn leave_packet(&self) -> OutPacket {
        self.leave_packet_for(DropLeave::Expired)
    }

    /// Drop-Leave-Field packet for a specific leave reason
    pub fn leave_packet_for(&self, leave: DropLeave) -> OutPacket {
        let mut p = OutPacket::builder(SendOperation::DropLeaveField);
        p.write_u8(leave.code()).write_i32(self.id());
        if let DropLeave::PickedUp { by } = leave {
            p.write_i32(by);
        }
        p.build()
    }
}
