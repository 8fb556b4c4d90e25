//! Field object model
//!
//! Everything placed in a field shares an id, a position, a move action, a
//! foothold and a weak back-reference to the field it is in. The variants
//! themselves live in sibling modules; [`FieldObject`] is the handle the
//! field stores and passes around.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::drop::FieldDrop;
use super::life::{FieldMob, FieldNpc};
use super::reactor::FieldReactor;
use super::user::FieldUser;
use super::Field;
use crate::protocol::movement::MovePath;
use crate::protocol::packets::OutPacket;

/// Field-local object identifier (a character id for users)
pub type ObjectId = i32;

/// A map coordinate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i16,
    pub y: i16,
}

impl Point {
    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }
}

/// Identity and placement shared by all field objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    /// Object id (0 = unassigned)
    pub id: ObjectId,
    pub position: Point,
    pub move_action: u8,
    pub foothold: i16,
}

impl Placement {
    /// Placement at a position, not yet given an id
    pub fn at(position: Point, move_action: u8, foothold: i16) -> Self {
        Self {
            id: 0,
            position,
            move_action,
            foothold,
        }
    }

    /// Move to where a path ends
    pub fn apply_path(&mut self, path: &MovePath) {
        self.position = path.last_position();
        if let Some(action) = path.last_move_action() {
            self.move_action = action;
        }
        if let Some(foothold) = path.last_foothold() {
            self.foothold = foothold;
        }
    }
}

/// State common to every object variant
#[derive(Debug, Default)]
pub struct ObjectBase {
    placement: RwLock<Placement>,
    field: RwLock<Weak<Field>>,
}

impl ObjectBase {
    pub fn new(placement: Placement) -> Self {
        Self {
            placement: RwLock::new(placement),
            field: RwLock::new(Weak::new()),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.placement.read().id
    }

    pub fn set_id(&self, id: ObjectId) {
        self.placement.write().id = id;
    }

    /// Copy of the current placement
    pub fn placement(&self) -> Placement {
        *self.placement.read()
    }

    /// Mutate the placement in place
    pub fn update_placement(&self, f: impl FnOnce(&mut Placement)) {
        f(&mut self.placement.write());
    }

    /// The field this object is in, if it is still alive
    pub fn field(&self) -> Option<Arc<Field>> {
        self.field.read().upgrade()
    }

    pub fn set_field(&self, field: &Arc<Field>) {
        *self.field.write() = Arc::downgrade(field);
    }

    /// Clear the back-reference if it still points at `field`
    pub fn clear_field(&self, field: &Field) {
        let mut current = self.field.write();
        if std::ptr::eq(current.as_ptr(), field) {
            *current = Weak::new();
        }
    }
}

/// Discriminant of [`FieldObject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    User,
    Mob,
    Npc,
    Reactor,
    Drop,
}

/// Objects that a user simulates on behalf of the field
pub trait ControlledObject: Send + Sync {
    /// The controlling user, if any
    fn controller(&self) -> Option<ObjectId>;

    /// Record a new controller
    fn set_controller(&self, controller: Option<ObjectId>);

    /// Packet telling a user it gained or lost control of this object
    fn change_controller_packet(&self, controlling: bool) -> OutPacket;
}

/// Handle to an object placed in a field
#[derive(Debug, Clone)]
pub enum FieldObject {
    User(Arc<FieldUser>),
    Mob(Arc<FieldMob>),
    Npc(Arc<FieldNpc>),
    Reactor(Arc<FieldReactor>),
    Drop(Arc<FieldDrop>),
}

impl FieldObject {
    /// Shared object state
    pub fn base(&self) -> &ObjectBase {
        match self {
            FieldObject::User(o) => &o.base,
            FieldObject::Mob(o) => &o.base,
            FieldObject::Npc(o) => &o.base,
            FieldObject::Reactor(o) => &o.base,
            FieldObject::Drop(o) => &o.base,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.base().id()
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            FieldObject::User(_) => ObjectKind::User,
            FieldObject::Mob(_) => ObjectKind::Mob,
            FieldObject::Npc(_) => ObjectKind::Npc,
            FieldObject::Reactor(_) => ObjectKind::Reactor,
            FieldObject::Drop(_) => ObjectKind::Drop,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, FieldObject::User(_))
    }

    pub fn field(&self) -> Option<Arc<Field>> {
        self.base().field()
    }

    /// Packet shown to observers when this object appears
    pub fn enter_packet(&self) -> OutPacket {
        match self {
            FieldObject::User(o) => o.enter_packet(),
            FieldObject::Mob(o) => o.enter_packet(),
            FieldObject::Npc(o) => o.enter_packet(),
            FieldObject::Reactor(o) => o.enter_packet(),
            FieldObject::Drop(o) => o.enter_packet(),
        }
    }

    /// Packet shown to observers when this object disappears
    pub fn leave_packet(&self) -> OutPacket {
        match self {
            FieldObject::User(o) => o.leave_packet(),
            FieldObject::Mob(o) => o.leave_packet(),
            FieldObject::Npc(o) => o.leave_packet(),
            FieldObject::Reactor(o) => o.leave_packet(),
            FieldObject::Drop(o) => o.leave_packet(),
        }
    }

    pub fn as_user(&self) -> Option<&Arc<FieldUser>> {
        match self {
            FieldObject::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn as_drop(&self) -> Option<&Arc<FieldDrop>> {
        match self {
            FieldObject::Drop(drop) => Some(drop),
            _ => None,
        }
    }

    /// Controller view for mobs and NPCs
    pub fn as_controlled(&self) -> Option<&dyn ControlledObject> {
        match self {
            FieldObject::Mob(mob) => Some(mob.as_ref()),
            FieldObject::Npc(npc) => Some(npc.as_ref()),
            _ => None,
        }
    }

    /// Whether both handles point at the same object
    pub fn same_as(&self, other: &FieldObject) -> bool {
        match (self, other) {
            (FieldObject::User(a), FieldObject::User(b)) => Arc::ptr_eq(a, b),
            (FieldObject::Mob(a), FieldObject::Mob(b)) => Arc::ptr_eq(a, b),
            (FieldObject::Npc(a), FieldObject::Npc(b)) => Arc::ptr_eq(a, b),
            (FieldObject::Reactor(a), FieldObject::Reactor(b)) => Arc::ptr_eq(a, b),
            (FieldObject::Drop(a), FieldObject::Drop(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Advance time-based behavior
    pub async fn update(&self, now: DateTime<Utc>) {
        match self {
            FieldObject::User(user) => user.update(now).await,
            FieldObject::Drop(drop) => drop.update(now).await,
            _ => {}
        }
    }
}

impl From<Arc<FieldUser>> for FieldObject {
    fn from(user: Arc<FieldUser>) -> Self {
        FieldObject::User(user)
    }
}

impl From<Arc<FieldMob>> for FieldObject {
    fn from(mob: Arc<FieldMob>) -> Self {
        FieldObject::Mob(mob)
    }
}

impl From<Arc<FieldNpc>> for FieldObject {
    fn from(npc: Arc<FieldNpc>) -> Self {
        FieldObject::Npc(npc)
    }
}

impl From<Arc<FieldReactor>> for FieldObject {
    fn from(reactor: Arc<FieldReactor>) -> Self {
        FieldObject::Reactor(reactor)
    }
}

impl From<Arc<FieldDrop>> for FieldObject {
    fn from(drop: Arc<FieldDrop>) -> Self {
        FieldObject::Drop(drop)
    }
}
