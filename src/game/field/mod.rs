//! Field module
//!
//! A field is one running instance of a map. It owns the live objects inside
//! it and is responsible for:
//! - Entry/exit choreography (set-field, enter/leave broadcasts, snapshots)
//! - Field-local object id assignment
//! - Routing inbound operations to the object they target
//! - Broadcasting packets to the users present
//! - Electing a controlling user for every mob and NPC
//!
//! All membership changes for a field are serialized by one async mutex.
//! Reads (lookups, broadcast snapshots) only take the member list's read lock
//! and never hold it across an await point.

pub mod drop;
pub mod life;
pub mod manager;
pub mod object;
pub mod reactor;
pub mod user;

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::error::{GameError, Result};
use crate::game::template::{FieldTemplate, PortalKind};
use crate::net::buffer::PacketBuffer;
use crate::protocol::opcodes::RecvOperation;
use crate::protocol::packets::OutPacket;

pub use drop::{DropContent, DropLeave, FieldDrop};
pub use life::{FieldMob, FieldNpc};
pub use manager::FieldManager;
pub use object::{ControlledObject, FieldObject, ObjectBase, ObjectId, ObjectKind, Placement, Point};
pub use reactor::FieldReactor;
pub use user::FieldUser;

/// Builds a custom enter or leave packet for an object
pub type PacketSupplier = Box<dyn FnOnce(&FieldObject) -> OutPacket + Send>;

/// Outcome of routing an inbound operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Consumed (including no-ops on vanished targets)
    Handled,
    /// Nothing handles this operation
    Unhandled,
}

/// Aggregate result of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Users a send was attempted to
    pub recipients: usize,
    /// Sends that failed
    pub failed: usize,
}

/// Field-local object id counter.
///
/// Ids start after 1, wrap from `i32::MAX` back to 1 and never yield 0 or a
/// negative value.
#[derive(Debug, Clone)]
pub struct ObjectIdCounter {
    current: ObjectId,
}

impl ObjectIdCounter {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter whose next id follows `current`
    pub fn starting_at(current: ObjectId) -> Self {
        Self { current }
    }

    /// Step to the next candidate id
    pub fn advance(&mut self) -> ObjectId {
        self.current = self.current.wrapping_add(1);
        if self.current <= 0 {
            self.current = 1;
        }
        self.current
    }

    /// Next id for which `in_use` is false
    pub fn next_free(&mut self, in_use: impl Fn(ObjectId) -> bool) -> ObjectId {
        loop {
            let id = self.advance();
            if !in_use(id) {
                return id;
            }
        }
    }
}

impl Default for ObjectIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Where an entering user is placed
#[derive(Debug, Clone, Copy)]
struct Arrival {
    position: Point,
    foothold: Option<i16>,
}

/// How an inbound operation is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Leading object id, forwarded to the live object of this kind
    Object(ObjectKind),
    DropPickUp,
    /// The requesting user's own handler
    User,
}

impl Route {
    fn of(operation: RecvOperation) -> Self {
        match operation {
            RecvOperation::MobMove => Route::Object(ObjectKind::Mob),
            RecvOperation::NpcMove => Route::Object(ObjectKind::Npc),
            RecvOperation::ReactorHit | RecvOperation::ReactorTouch => {
                Route::Object(ObjectKind::Reactor)
            }
            RecvOperation::DropPickUpRequest => Route::DropPickUp,
            _ => Route::User,
        }
    }
}

/// A running map instance
pub struct Field {
    id: i32,
    template: Arc<FieldTemplate>,
    members: RwLock<Vec<FieldObject>>,
    /// Serializes enter/leave; guards the id counter
    mutation: Mutex<ObjectIdCounter>,
    manager: Weak<FieldManager>,
}

impl Field {
    /// Create an empty field
    pub fn new(id: i32, template: Arc<FieldTemplate>, manager: Weak<FieldManager>) -> Arc<Self> {
        Arc::new(Self {
            id,
            template,
            members: RwLock::new(Vec::new()),
            mutation: Mutex::new(ObjectIdCounter::new()),
            manager,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn template(&self) -> &Arc<FieldTemplate> {
        &self.template
    }

    /// The factory this field belongs to
    pub fn manager(&self) -> Result<Arc<FieldManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| GameError::FieldManagerGone.into())
    }

    /// Snapshot of all members
    pub fn members(&self) -> Vec<FieldObject> {
        self.members.read().clone()
    }

    /// Snapshot of the users present
    pub fn users(&self) -> Vec<Arc<FieldUser>> {
        self.members
            .read()
            .iter()
            .filter_map(|m| m.as_user().cloned())
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn contains(&self, object: &FieldObject) -> bool {
        self.members.read().iter().any(|m| m.same_as(object))
    }

    /// Find a non-user object by id
    pub fn lookup_object(&self, id: ObjectId) -> Option<FieldObject> {
        self.members
            .read()
            .iter()
            .find(|m| !m.is_user() && m.id() == id)
            .cloned()
    }

    /// Find a user by id
    pub fn lookup_user(&self, id: ObjectId) -> Option<Arc<FieldUser>> {
        self.members
            .read()
            .iter()
            .filter_map(FieldObject::as_user)
            .find(|u| u.id() == id)
            .cloned()
    }

    /// Find an object of a specific kind by id
    pub fn lookup(&self, kind: ObjectKind, id: ObjectId) -> Option<FieldObject> {
        self.members
            .read()
            .iter()
            .find(|m| m.kind() == kind && m.id() == id)
            .cloned()
    }

    /// Place an object in this field
    pub async fn enter(self: &Arc<Self>, object: FieldObject) -> Result<()> {
        self.enter_with(object, None).await
    }

    /// Place an object in this field, announcing it with a custom packet
    pub async fn enter_with(
        self: &Arc<Self>,
        object: FieldObject,
        enter_packet: Option<PacketSupplier>,
    ) -> Result<()> {
        let arrival = match &object {
            FieldObject::User(user) => Some(self.resolve_arrival(user)?),
            _ => None,
        };

        if let Some(current) = object.field() {
            current.leave(&object).await;
        }

        let mut counter = self.mutation.lock().await;
        object.base().set_field(self);

        match (&object, arrival) {
            (FieldObject::User(user), Some(arrival)) => {
                user.base.update_placement(|p| {
                    p.position = arrival.position;
                    if let Some(foothold) = arrival.foothold {
                        p.foothold = foothold;
                    }
                });
                let character_id = user.with_character(|c| c.id);
                user.base.set_id(character_id);
                user.update_character(|c| c.field_id = self.id);

                user::log_send_failure(user, user.send(&user.set_field_packet()).await);

                let packet = match enter_packet {
                    Some(supplier) => supplier(&object),
                    None => object.enter_packet(),
                };
                self.broadcast_except(user.id(), &packet).await;

                user.session.set_instantiated();

                let snapshot: Vec<OutPacket> = self
                    .members
                    .read()
                    .iter()
                    .filter(|m| !m.same_as(&object))
                    .map(FieldObject::enter_packet)
                    .collect();
                for packet in &snapshot {
                    user::log_send_failure(user, user.send(packet).await);
                }

                info!(field_id = self.id, user_id = user.id(), "User entered field");
            }
            _ => {
                let id = {
                    let members = self.members.read();
                    counter.next_free(|id| members.iter().any(|m| !m.is_user() && m.id() == id))
                };
                object.base().set_id(id);

                let packet = match enter_packet {
                    Some(supplier) => supplier(&object),
                    None => object.enter_packet(),
                };
                self.broadcast(&packet).await;

                debug!(
                    field_id = self.id,
                    object_id = id,
                    kind = ?object.kind(),
                    "Object entered field"
                );
            }
        }

        self.members.write().push(object);
        self.update_controllers().await;
        Ok(())
    }

    /// Resolve where a user appears, before anything is mutated
    fn resolve_arrival(&self, user: &FieldUser) -> Result<Arrival> {
        let preferred = user.with_character(|c| c.field_portal);
        let portal = self
            .template
            .spawn_portal(preferred)
            .ok_or(GameError::NoSpawnPortal { field_id: self.id })?;

        let foothold = if portal.kind == PortalKind::Spawn {
            None
        } else {
            let foothold = self.template.foothold_below(portal.x).ok_or(
                GameError::NoFootholdBelow {
                    field_id: self.id,
                    x: portal.x,
                },
            )?;
            Some(foothold.id)
        };

        Ok(Arrival {
            position: Point::new(portal.x as i16, portal.y as i16),
            foothold,
        })
    }

    /// Remove an object from this field; returns whether it was a member
    pub async fn leave(&self, object: &FieldObject) -> bool {
        self.leave_with(object, None).await
    }

    /// Remove an object, announcing it with a custom packet
    pub async fn leave_with(&self, object: &FieldObject, leave_packet: Option<PacketSupplier>) -> bool {
        let _guard = self.mutation.lock().await;

        if !self.contains(object) {
            return false;
        }

        let packet = match leave_packet {
            Some(supplier) => supplier(object),
            None => object.leave_packet(),
        };
        match object {
            FieldObject::User(user) => {
                self.broadcast_except(user.id(), &packet).await;
            }
            _ => {
                self.broadcast(&packet).await;
            }
        }

        self.members.write().retain(|m| !m.same_as(object));
        object.base().clear_field(self);
        self.update_controllers().await;

        debug!(
            field_id = self.id,
            object_id = object.id(),
            kind = ?object.kind(),
            "Object left field"
        );
        true
    }

    /// Route an inbound operation from `user`
    pub async fn dispatch(
        self: &Arc<Self>,
        user: &Arc<FieldUser>,
        operation: RecvOperation,
        packet: &mut PacketBuffer,
    ) -> Result<Dispatch> {
        match Route::of(operation) {
            Route::Object(kind) => {
                let id = packet.read_i32()?;
                let Some(object) = self.lookup(kind, id) else {
                    trace!(field_id = self.id, object_id = id, ?kind, "Target not found");
                    return Ok(Dispatch::Handled);
                };

                match &object {
                    FieldObject::Mob(mob) => mob.handle(self, user, operation, packet).await,
                    FieldObject::Npc(npc) => npc.handle(self, user, operation, packet).await,
                    FieldObject::Reactor(reactor) => {
                        reactor.handle(self, user, operation, packet).await
                    }
                    _ => Ok(Dispatch::Handled),
                }
            }
            Route::DropPickUp => {
                self.on_drop_pick_up(user, packet).await?;
                Ok(Dispatch::Handled)
            }
            Route::User => user.handle(self, operation, packet).await,
        }
    }

    async fn on_drop_pick_up(&self, user: &FieldUser, packet: &mut PacketBuffer) -> Result<()> {
        packet.read_u8()?;
        packet.read_i32()?;
        packet.read_i16()?;
        packet.read_i16()?;
        let id = packet.read_i32()?;
        packet.read_i32()?;

        let Some(object) = self.lookup(ObjectKind::Drop, id) else {
            return Ok(());
        };
        let Some(item) = object.as_drop().cloned() else {
            return Ok(());
        };
        if !item.claim() {
            return Ok(());
        }

        let by = user.id();
        debug!(field_id = self.id, drop_id = id, user_id = by, "Drop picked up");
        self.leave_with(
            &object,
            Some(Box::new(move |_: &FieldObject| {
                item.leave_packet_for(DropLeave::PickedUp { by })
            })),
        )
        .await;
        Ok(())
    }

    /// Send a packet to every user present
    pub async fn broadcast(&self, packet: &OutPacket) -> BroadcastReport {
        self.send_to(self.users(), packet).await
    }

    /// Send a packet to every user present except `source`
    pub async fn broadcast_except(&self, source: ObjectId, packet: &OutPacket) -> BroadcastReport {
        let users = self.users().into_iter().filter(|u| u.id() != source).collect();
        self.send_to(users, packet).await
    }

    async fn send_to(&self, users: Vec<Arc<FieldUser>>, packet: &OutPacket) -> BroadcastReport {
        let results = join_all(users.iter().map(|u| u.send(packet))).await;
        let report = BroadcastReport {
            recipients: users.len(),
            failed: results.iter().filter(|r| r.is_err()).count(),
        };

        trace!(
            field_id = self.id,
            opcode = packet.opcode(),
            recipients = report.recipients,
            failed = report.failed,
            "Broadcast"
        );
        report
    }

    /// Advance time-based behavior of every member
    pub async fn update(&self, now: DateTime<Utc>) {
        let members = self.members();
        join_all(members.iter().map(|m| m.update(now))).await;
    }

    /// Give every mob and NPC without a present controller a new one
    async fn update_controllers(&self) {
        let (mut users, controlled): (Vec<Arc<FieldUser>>, Vec<FieldObject>) = {
            let members = self.members.read();
            (
                members.iter().filter_map(|m| m.as_user().cloned()).collect(),
                members
                    .iter()
                    .filter(|m| m.as_controlled().is_some())
                    .cloned()
                    .collect(),
            )
        };
        users.shuffle(&mut rand::thread_rng());

        let present: HashSet<ObjectId> = users.iter().map(|u| u.id()).collect();
        let next = users.first();

        for object in &controlled {
            let Some(life) = object.as_controlled() else {
                continue;
            };
            let orphaned = life
                .controller()
                .map_or(true, |id| !present.contains(&id));
            if !orphaned {
                continue;
            }

            life.set_controller(next.map(|u| u.id()));
            if let Some(user) = next {
                trace!(
                    field_id = self.id,
                    object_id = object.id(),
                    controller = user.id(),
                    "Controller assigned"
                );
                user::log_send_failure(user, user.send(&life.change_controller_packet(true)).await);
            }
        }
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("id", &self.id)
            .field("members", &self.member_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::character::Character;
    use crate::game::template::{Foothold, MobTemplate, Portal};
    use crate::net::session::Session;
    use crate::protocol::opcodes::SendOperation;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn template() -> Arc<FieldTemplate> {
        Arc::new(FieldTemplate {
            id: 100000000,
            portals: vec![
                Portal {
                    id: 0,
                    name: "sp".to_string(),
                    kind: PortalKind::Spawn,
                    x: 10,
                    y: 20,
                    target_field: 999_999_999,
                    target_portal: String::new(),
                },
                Portal {
                    id: 4,
                    name: "east00".to_string(),
                    kind: PortalKind::Visible,
                    x: 150,
                    y: 30,
                    target_field: 999_999_999,
                    target_portal: String::new(),
                },
            ],
            footholds: vec![Foothold {
                id: 21,
                x1: 100,
                y1: 30,
                x2: 200,
                y2: 30,
            }],
            ..Default::default()
        })
    }

    fn field() -> Arc<Field> {
        Field::new(100000000, template(), Weak::new())
    }

    fn user(id: i32) -> (Arc<FieldUser>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(Session::with_channel(
            id as u64,
            "127.0.0.1:1".parse().unwrap(),
            tx,
        ));
        (
            FieldUser::new(session, Character::new(id, format!("user{id}"), 100000000)),
            rx,
        )
    }

    fn mob() -> Arc<FieldMob> {
        let template = Arc::new(MobTemplate {
            id: 100100,
            name: String::new(),
            level: 1,
            max_hp: 8,
            max_mp: 0,
        });
        FieldMob::new(template, Placement::default())
    }

    fn opcodes(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u16> {
        let mut ops = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            ops.push(u16::from_le_bytes([bytes[0], bytes[1]]));
        }
        ops
    }

    #[test]
    fn test_counter_starts_after_one() {
        let mut counter = ObjectIdCounter::new();
        assert_eq!(counter.advance(), 2);
        assert_eq!(counter.advance(), 3);
    }

    #[test]
    fn test_counter_wraps_to_one() {
        let mut counter = ObjectIdCounter::starting_at(i32::MAX - 1);
        assert_eq!(counter.advance(), i32::MAX);
        assert_eq!(counter.advance(), 1);
        assert_eq!(counter.advance(), 2);
    }

    #[test]
    fn test_counter_skips_live_ids() {
        let mut counter = ObjectIdCounter::starting_at(i32::MAX);
        let live = [1, 2, 4];
        assert_eq!(counter.next_free(|id| live.contains(&id)), 3);
        assert_eq!(counter.next_free(|id| live.contains(&id)), 5);
    }

    #[test]
    fn test_route_table() {
        assert_eq!(Route::of(RecvOperation::MobMove), Route::Object(ObjectKind::Mob));
        assert_eq!(
            Route::of(RecvOperation::ReactorTouch),
            Route::Object(ObjectKind::Reactor)
        );
        assert_eq!(Route::of(RecvOperation::DropPickUpRequest), Route::DropPickUp);
        assert_eq!(Route::of(RecvOperation::UserChat), Route::User);
        assert_eq!(Route::of(RecvOperation::Unknown(0x999)), Route::User);
    }

    #[tokio::test]
    async fn test_user_enter_sends_set_field_and_snapshot() {
        let field = field();
        let (a, mut rx_a) = user(1);
        let (b, mut rx_b) = user(2);

        field.enter(FieldObject::User(a.clone())).await.unwrap();
        field.enter(FieldObject::Mob(mob())).await.unwrap();
        opcodes(&mut rx_a);

        field.enter(FieldObject::User(b.clone())).await.unwrap();

        assert_eq!(
            opcodes(&mut rx_a),
            vec![SendOperation::UserEnterField.as_u16()]
        );
        let b_ops = opcodes(&mut rx_b);
        assert_eq!(b_ops[0], SendOperation::SetField.as_u16());
        assert!(b_ops.contains(&SendOperation::UserEnterField.as_u16()));
        assert!(b_ops.contains(&SendOperation::MobEnterField.as_u16()));
        assert!(b.session.is_instantiated());
        assert_eq!(b.character().field_id, 100000000);
    }

    #[tokio::test]
    async fn test_spawn_portal_placement() {
        let field = field();
        let (spawned, _rx1) = user(1);
        let (portaled, _rx2) = user(2);
        portaled.update_character(|c| c.field_portal = 4);

        field.enter(FieldObject::User(spawned.clone())).await.unwrap();
        field.enter(FieldObject::User(portaled.clone())).await.unwrap();

        assert_eq!(spawned.placement().position, Point::new(10, 20));
        assert_eq!(spawned.placement().foothold, 0);
        assert_eq!(portaled.placement().position, Point::new(150, 30));
        assert_eq!(portaled.placement().foothold, 21);
    }

    #[tokio::test]
    async fn test_enter_without_spawn_portal_fails_cleanly() {
        let field = Field::new(1, Arc::new(FieldTemplate::default()), Weak::new());
        let (u, _rx) = user(1);

        let err = field.enter(FieldObject::User(u.clone())).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::FieldServerError::Game(GameError::NoSpawnPortal { field_id: 1 })
        ));
        assert_eq!(field.member_count(), 0);
        assert!(u.field().is_none());
    }

    #[tokio::test]
    async fn test_leave_non_member_is_noop() {
        let field = field();
        let (a, mut rx_a) = user(1);
        field.enter(FieldObject::User(a)).await.unwrap();
        opcodes(&mut rx_a);

        let stranger = FieldObject::Mob(mob());
        assert!(!field.leave(&stranger).await);
        assert!(opcodes(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_reenter_same_field_does_not_duplicate() {
        let field = field();
        let (a, _rx) = user(1);

        field.enter(FieldObject::User(a.clone())).await.unwrap();
        field.enter(FieldObject::User(a.clone())).await.unwrap();

        assert_eq!(field.member_count(), 1);
        assert!(field.lookup_user(1).is_some());
    }

    #[tokio::test]
    async fn test_leave_clears_back_reference() {
        let field = field();
        let m = mob();
        let object = FieldObject::Mob(m.clone());

        field.enter(object.clone()).await.unwrap();
        assert!(m.base.field().is_some());

        assert!(field.leave(&object).await);
        assert!(m.base.field().is_none());
        assert!(field.lookup_object(m.id()).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_report() {
        let field = field();
        let (a, rx_a) = user(1);
        let (b, _rx_b) = user(2);
        field.enter(FieldObject::User(a)).await.unwrap();
        field.enter(FieldObject::User(b)).await.unwrap();
        drop(rx_a);

        let packet = OutPacket::builder(SendOperation::UserChat).build();
        let report = field.broadcast(&packet).await;
        assert_eq!(report, BroadcastReport { recipients: 2, failed: 1 });

        let report = field.broadcast_except(2, &packet).await;
        assert_eq!(report.recipients, 1);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_unhandled() {
        let field = field();
        let (a, _rx) = user(1);
        field.enter(FieldObject::User(a.clone())).await.unwrap();

        let mut packet = PacketBuffer::new();
        let outcome = field
            .dispatch(&a, RecvOperation::Unknown(0x4444), &mut packet)
            .await
            .unwrap();
        assert_eq!(outcome, Dispatch::Unhandled);
    }

    #[tokio::test]
    async fn test_missing_target_is_handled_noop() {
        let field = field();
        let (a, mut rx) = user(1);
        field.enter(FieldObject::User(a.clone())).await.unwrap();
        opcodes(&mut rx);

        let mut packet = PacketBuffer::new();
        packet.write_i32(777);
        let outcome = field
            .dispatch(&a, RecvOperation::MobMove, &mut packet)
            .await
            .unwrap();

        assert_eq!(outcome, Dispatch::Handled);
        assert!(opcodes(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_truncated_packet_is_fatal() {
        let field = field();
        let (a, _rx) = user(1);
        field.enter(FieldObject::User(a.clone())).await.unwrap();

        let mut packet = PacketBuffer::from_bytes(&[1, 2]);
        let err = field
            .dispatch(&a, RecvOperation::UserChat, &mut packet)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
