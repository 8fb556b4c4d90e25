//! Integration tests for the field engine
//!
//! These tests drive fields through their public API the way connection
//! handlers do:
//! - Controller assignment as users come and go
//! - Routing of every field operation through `Field::dispatch`
//! - Portal transfers between fields created by the field manager
//! - Drop pickup and expiry
//! - Full connections over an in-memory stream, including idle drops

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::future::join_all;
use pretty_assertions::assert_eq;
use tokio::sync::{broadcast, mpsc};

use field_server::config::ServerConfig;
use field_server::error::{FieldServerError, GameError};
use field_server::game::character::{Character, CharacterStore};
use field_server::game::field::{
    ControlledObject, Dispatch, DropContent, Field, FieldDrop, FieldManager, FieldMob, FieldNpc,
    FieldObject, FieldReactor, FieldUser, Placement, Point,
};
use field_server::game::template::{
    Foothold, FieldTemplate, LifeKind, LifeSpawn, MobTemplate, NpcTemplate, Portal, PortalKind,
    ReactorTemplate, TemplateStore,
};
use field_server::net::buffer::PacketBuffer;
use field_server::net::handler::ConnectionHandler;
use field_server::net::session::Session;
use field_server::net::transport::{write_frame, FrameReader};
use field_server::protocol::movement::{Bounds, MoveAttribute, MoveElement, MoveKind, MovePath};
use field_server::protocol::opcodes::{RecvOperation, SendOperation};
use field_server::protocol::packets::OutPacket;
use field_server::AppState;

const HENESYS: i32 = 100000000;
const LITH_HARBOR: i32 = 104000000;
const ELLINIA: i32 = 101000000;

fn portal(id: u8, name: &str, kind: PortalKind, x: i32, target: Option<(i32, &str)>) -> Portal {
    let (target_field, target_portal) = target.unwrap_or((999_999_999, ""));
    Portal {
        id,
        name: name.to_string(),
        kind,
        x,
        y: 0,
        target_field,
        target_portal: target_portal.to_string(),
    }
}

fn templates() -> TemplateStore {
    let mut store = TemplateStore::new();
    store.insert_field(FieldTemplate {
        id: HENESYS,
        portals: vec![
            portal(0, "sp", PortalKind::Spawn, 0, None),
            portal(1, "east00", PortalKind::Visible, 300, Some((LITH_HARBOR, "west00"))),
            portal(2, "broken", PortalKind::Visible, 300, Some((LITH_HARBOR, "missing"))),
            portal(5, "cliff", PortalKind::Visible, 300, Some((ELLINIA, "ledge"))),
        ],
        footholds: vec![Foothold {
            id: 7,
            x1: 0,
            y1: 0,
            x2: 500,
            y2: 0,
        }],
        life: vec![LifeSpawn {
            kind: LifeKind::Monster,
            template_id: 100100,
            x: 100,
            y: 0,
            move_action: 0,
            foothold: 7,
            rx0: 0,
            rx1: 0,
        }],
        ..Default::default()
    });
    store.insert_field(FieldTemplate {
        id: LITH_HARBOR,
        portals: vec![
            portal(0, "sp", PortalKind::Spawn, 0, None),
            portal(3, "west00", PortalKind::Visible, -100, Some((HENESYS, "east00"))),
        ],
        footholds: vec![Foothold {
            id: 2,
            x1: -200,
            y1: 0,
            x2: 200,
            y2: 0,
        }],
        ..Default::default()
    });
    // Arrival portal floats over nothing
    store.insert_field(FieldTemplate {
        id: ELLINIA,
        portals: vec![
            portal(0, "sp", PortalKind::Spawn, 0, None),
            portal(1, "ledge", PortalKind::Visible, 900, Some((HENESYS, "cliff"))),
        ],
        ..Default::default()
    });
    store.insert_mob(MobTemplate {
        id: 100100,
        name: "Snail".to_string(),
        level: 1,
        max_hp: 8,
        max_mp: 0,
    });
    store
}

fn user(id: i32) -> (Arc<FieldUser>, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(128);
    let address: SocketAddr = "127.0.0.1:7000".parse().unwrap();
    let session = Arc::new(Session::with_channel(id as u64, address, tx));
    let character = Character::new(id, format!("user{id}"), HENESYS);
    (FieldUser::new(session, character), rx)
}

fn snail() -> Arc<FieldMob> {
    let template = Arc::new(MobTemplate {
        id: 100100,
        name: "Snail".to_string(),
        level: 1,
        max_hp: 8,
        max_mp: 0,
    });
    FieldMob::new(template, Placement::at(Point::new(100, 0), 0, 7))
}

fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u16> {
    let mut ops = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        ops.push(u16::from_le_bytes([bytes[0], bytes[1]]));
    }
    ops
}

fn recv_all(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Bytes> {
    let mut packets = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        packets.push(bytes);
    }
    packets
}

/// A walk ending at (55, -3) on foothold 7 with move action 3
fn walk() -> MovePath {
    MovePath {
        start: Point::new(0, 0),
        velocity: Point::new(0, 0),
        elements: vec![MoveElement {
            attribute: MoveAttribute::Normal,
            kind: MoveKind::Normal {
                position: Point::new(55, -3),
                velocity: Point::new(100, 0),
                foothold: 7,
                fall_start: None,
                offset: Point::new(0, 0),
            },
            move_action: 3,
            elapse: 120,
        }],
        key_pad_count: 0,
        key_pad: Vec::new(),
        bounds: Bounds::default(),
    }
}

fn mob_move_request(mob_id: i32) -> PacketBuffer {
    let mut packet = PacketBuffer::new();
    packet
        .write_i32(mob_id)
        .write_i16(12)
        .write_u8(0)
        .write_u8(0)
        .write_i32(0)
        .write_i32(0)
        .write_i32(0);
    walk().encode(&mut packet);
    packet
}

fn npc() -> Arc<FieldNpc> {
    let template = Arc::new(NpcTemplate {
        id: 1012000,
        name: "Athena Pierce".to_string(),
    });
    FieldNpc::new(template, Placement::at(Point::new(0, 0), 0, 7), -50, 50)
}

/// Check that every mob and NPC is controlled by a present user, or by nobody when no user is present
fn assert_controllers_present(field: &Field) {
    let has_users = !field.users().is_empty();
    for member in field.members() {
        let Some(life) = member.as_controlled() else {
            continue;
        };
        match life.controller() {
            Some(id) => assert!(field.lookup_user(id).is_some(), "controller {id} is not present"),
            None => assert!(!has_users, "object {} left uncontrolled", member.id()),
        }
    }
}

fn transfer_request(portal: &str) -> PacketBuffer {
    let mut packet = PacketBuffer::new();
    packet.write_u8(1).write_i32(-1).write_string(portal);
    packet
}

/// A mob entering a field with no users stays uncontrolled
#[tokio::test]
async fn test_mob_in_empty_field_has_no_controller() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let mob = snail();

    field.enter(FieldObject::Mob(mob.clone())).await.unwrap();

    assert_eq!(mob.controller(), None);
}

/// When the controlling user leaves, control passes to a remaining user
#[tokio::test]
async fn test_controller_reassigned_when_controller_leaves() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let mob = snail();
    let (a, _rx_a) = user(1);
    let (b, mut rx_b) = user(2);

    field.enter(FieldObject::Mob(mob.clone())).await.unwrap();
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    assert_eq!(mob.controller(), Some(1));

    field.enter(FieldObject::User(b.clone())).await.unwrap();
    assert_eq!(mob.controller(), Some(1));
    drain(&mut rx_b);

    assert!(field.leave(&FieldObject::User(a.clone())).await);

    assert_eq!(mob.controller(), Some(2));
    let ops = drain(&mut rx_b);
    assert!(ops.contains(&SendOperation::UserLeaveField.as_u16()));
    assert!(ops.contains(&SendOperation::MobChangeController.as_u16()));

    assert!(field.leave(&FieldObject::User(b)).await);
    assert_eq!(mob.controller(), None);
}

/// Every non-user object gets its own id
#[tokio::test]
async fn test_object_ids_are_distinct() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());

    let mobs: Vec<_> = (0..5).map(|_| snail()).collect();
    for mob in &mobs {
        field.enter(FieldObject::Mob(mob.clone())).await.unwrap();
    }

    let mut ids: Vec<_> = mobs.iter().map(|m| m.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    assert!(ids.iter().all(|id| *id > 0));
}

/// Moves and emotions are echoed to everyone but the sender
#[tokio::test]
async fn test_emotion_excludes_sender() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    field.enter(FieldObject::User(b.clone())).await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let mut packet = PacketBuffer::new();
    packet.write_i32(2).write_i32(-1).write_bool(false);
    let outcome = field
        .dispatch(&a, RecvOperation::UserEmotion, &mut packet)
        .await
        .unwrap();

    assert_eq!(outcome, Dispatch::Handled);
    assert!(drain(&mut rx_a).is_empty());
    assert_eq!(drain(&mut rx_b), vec![SendOperation::UserEmotion.as_u16()]);
}

/// The field manager hands out one instance per id, even under concurrent requests
#[tokio::test]
async fn test_field_manager_concurrent_get_returns_same_instance() {
    let manager = FieldManager::new(Arc::new(templates()));

    let fields = join_all((0..8).map(|_| manager.get(HENESYS))).await;
    let first = fields[0].as_ref().unwrap().clone();

    for field in &fields {
        assert!(Arc::ptr_eq(&first, field.as_ref().unwrap()));
    }
    assert_eq!(manager.count().await, 1);
    assert_eq!(first.member_count(), 1);
}

/// A user walking through a portal ends up at the linked portal of the target field
#[tokio::test]
async fn test_transfer_between_fields() {
    let manager = FieldManager::new(Arc::new(templates()));
    let henesys = manager.get(HENESYS).await.unwrap();
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);

    henesys.enter(FieldObject::User(a.clone())).await.unwrap();
    henesys.enter(FieldObject::User(b.clone())).await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let mut packet = transfer_request("east00");
    henesys
        .dispatch(&a, RecvOperation::UserTransferFieldRequest, &mut packet)
        .await
        .unwrap();

    let harbor = manager.get(LITH_HARBOR).await.unwrap();
    assert!(henesys.lookup_user(1).is_none());
    assert!(harbor.lookup_user(1).is_some());
    assert_eq!(a.field().map(|f| f.id()), Some(LITH_HARBOR));
    assert_eq!(a.character().field_id, LITH_HARBOR);
    assert_eq!(a.character().field_portal, 3);
    assert_eq!(a.placement().position, Point::new(-100, 0));
    assert_eq!(a.placement().foothold, 2);

    assert_eq!(drain(&mut rx_a)[0], SendOperation::SetField.as_u16());
    assert!(drain(&mut rx_b).contains(&SendOperation::UserLeaveField.as_u16()));
}

/// Transferring through an unknown portal fails and leaves the user in place
#[tokio::test]
async fn test_transfer_to_missing_portal_keeps_membership() {
    let manager = FieldManager::new(Arc::new(templates()));
    let henesys = manager.get(HENESYS).await.unwrap();
    let (a, _rx_a) = user(1);
    henesys.enter(FieldObject::User(a.clone())).await.unwrap();

    let mut packet = transfer_request("nowhere");
    let err = henesys
        .dispatch(&a, RecvOperation::UserTransferFieldRequest, &mut packet)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FieldServerError::Game(GameError::PortalNotFound { .. })
    ));
    assert!(!err.is_fatal());

    let mut packet = transfer_request("broken");
    assert!(henesys
        .dispatch(&a, RecvOperation::UserTransferFieldRequest, &mut packet)
        .await
        .is_err());

    assert!(henesys.lookup_user(1).is_some());
    assert_eq!(a.field().map(|f| f.id()), Some(HENESYS));
}

/// Only the first pickup of a drop is announced
#[tokio::test]
async fn test_drop_pickup_is_first_claimer_wins() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    field.enter(FieldObject::User(b.clone())).await.unwrap();

    let expire = Utc::now() + chrono::Duration::minutes(3);
    let item = FieldDrop::new(DropContent::Money(50), Point::new(20, 0), 0, 0, expire);
    field.enter(FieldObject::Drop(item.clone())).await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let pickup = |drop_id: i32| {
        let mut packet = PacketBuffer::new();
        packet
            .write_u8(0)
            .write_i32(0)
            .write_i16(20)
            .write_i16(0)
            .write_i32(drop_id)
            .write_i32(0);
        packet
    };

    let mut packet = pickup(item.id());
    field
        .dispatch(&a, RecvOperation::DropPickUpRequest, &mut packet)
        .await
        .unwrap();
    assert_eq!(drain(&mut rx_a), vec![SendOperation::DropLeaveField.as_u16()]);
    assert_eq!(drain(&mut rx_b), vec![SendOperation::DropLeaveField.as_u16()]);
    assert!(field.lookup_object(item.id()).is_none());

    let mut packet = pickup(item.id());
    let outcome = field
        .dispatch(&b, RecvOperation::DropPickUpRequest, &mut packet)
        .await
        .unwrap();
    assert_eq!(outcome, Dispatch::Handled);
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());
}

/// Expired drops leave on the next field update
#[tokio::test]
async fn test_drop_expires_on_update() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let (a, mut rx_a) = user(1);
    field.enter(FieldObject::User(a.clone())).await.unwrap();

    let expire = Utc::now() + chrono::Duration::seconds(30);
    let item = FieldDrop::new(DropContent::Item(2000000), Point::new(0, 0), 0, 0, expire);
    field.enter(FieldObject::Drop(item.clone())).await.unwrap();
    drain(&mut rx_a);

    field.update(Utc::now()).await;
    assert!(field.lookup_object(item.id()).is_some());

    field.update(expire).await;
    assert!(field.lookup_object(item.id()).is_none());
    assert_eq!(drain(&mut rx_a), vec![SendOperation::DropLeaveField.as_u16()]);
}

/// A client migrates in over a byte stream, is placed in its field and is cleaned up on disconnect
#[tokio::test]
async fn test_connection_lifecycle() {
    let characters = CharacterStore::new();
    characters.save(Character::new(7, "Wanderer", HENESYS));
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = Arc::new(AppState::with_stores(
        ServerConfig::default(),
        shutdown_tx,
        templates(),
        characters,
    ));

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let handler = ConnectionHandler::new(state.clone());
    let address: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let connection = tokio::spawn(async move {
        handler
            .handle_connection(server_read, server_write, address)
            .await
    });

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut migrate = PacketBuffer::new();
    migrate
        .write_u16(RecvOperation::MigrateIn.as_u16())
        .write_i32(7);
    write_frame(&mut client_write, migrate.as_bytes()).await.unwrap();

    let mut reader = FrameReader::new(client_read);
    let mut ops = Vec::new();
    // Control of the seeded snail is handed out once the user is a member
    while ops.last() != Some(&SendOperation::MobChangeController.as_u16()) {
        let frame = reader.read_frame().await.unwrap();
        ops.push(u16::from_le_bytes([frame[0], frame[1]]));
    }
    assert_eq!(ops[0], SendOperation::SetField.as_u16());
    assert!(ops.contains(&SendOperation::MobEnterField.as_u16()));

    let field = state.fields.get(HENESYS).await.unwrap();
    assert!(field.lookup_user(7).is_some());
    assert!(state.session_manager.is_online(7));

    drop(client_write);
    drop(reader);

    let result = tokio::time::timeout(Duration::from_secs(5), connection)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(field.lookup_user(7).is_none());
    assert_eq!(state.session_manager.count(), 0);
    assert_eq!(
        state.characters.get(7).map(|c| c.field_id),
        Some(HENESYS)
    );
}

/// The first packet of a connection has to be a migrate-in
#[tokio::test]
async fn test_connection_rejects_other_first_packet() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = Arc::new(AppState::with_stores(
        ServerConfig::default(),
        shutdown_tx,
        templates(),
        CharacterStore::new(),
    ));

    let (client, server) = tokio::io::duplex(1024);
    let (server_read, server_write) = tokio::io::split(server);
    let handler = ConnectionHandler::new(state.clone());
    let address: SocketAddr = "127.0.0.1:9001".parse().unwrap();

    let (_client_read, mut client_write) = tokio::io::split(client);
    let mut chat = PacketBuffer::new();
    chat.write_u16(RecvOperation::UserChat.as_u16()).write_i32(0);
    write_frame(&mut client_write, chat.as_bytes()).await.unwrap();

    let result = handler
        .handle_connection(server_read, server_write, address)
        .await;
    assert!(matches!(result, Err(FieldServerError::Protocol(_))));
    assert_eq!(state.session_manager.count(), 0);
}

/// A transfer that cannot place the user at the far side leaves the character untouched
#[tokio::test]
async fn test_failed_arrival_keeps_character_portal() {
    let manager = FieldManager::new(Arc::new(templates()));
    let henesys = manager.get(HENESYS).await.unwrap();
    let (a, _rx_a) = user(1);
    henesys.enter(FieldObject::User(a.clone())).await.unwrap();
    let portal_before = a.character().field_portal;

    let mut packet = transfer_request("cliff");
    let err = henesys
        .dispatch(&a, RecvOperation::UserTransferFieldRequest, &mut packet)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FieldServerError::Game(GameError::NoFootholdBelow { field_id: ELLINIA, .. })
    ));
    assert_eq!(a.character().field_portal, portal_before);
    assert_eq!(a.character().field_id, HENESYS);
    assert!(henesys.lookup_user(1).is_some());
    assert!(manager.get(ELLINIA).await.unwrap().lookup_user(1).is_none());
}

/// A user's move is echoed with the reported path to everyone else and moves the user
#[tokio::test]
async fn test_user_move_echoes_path_to_others() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    field.enter(FieldObject::User(b.clone())).await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let mut packet = PacketBuffer::new();
    packet
        .write_i64(0)
        .write_u8(0)
        .write_i64(0)
        .write_i32(0)
        .write_i32(0)
        .write_i32(0);
    walk().encode(&mut packet);

    let outcome = field
        .dispatch(&a, RecvOperation::UserMove, &mut packet)
        .await
        .unwrap();
    assert_eq!(outcome, Dispatch::Handled);

    let mut expected = OutPacket::builder(SendOperation::UserMove);
    expected.write_i32(1);
    walk().encode(&mut expected);
    let expected = expected.build();

    assert!(recv_all(&mut rx_a).is_empty());
    let received = recv_all(&mut rx_b);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_ref(), expected.as_bytes());

    let placement = a.placement();
    assert_eq!(placement.position, Point::new(55, -3));
    assert_eq!(placement.move_action, 3);
    assert_eq!(placement.foothold, 7);
}

/// Only the controller moves a mob; it gets an ack while the others see the move
#[tokio::test]
async fn test_mob_move_from_controller_only() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let mob = snail();
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);
    field.enter(FieldObject::Mob(mob.clone())).await.unwrap();
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    field.enter(FieldObject::User(b.clone())).await.unwrap();
    assert_eq!(mob.controller(), Some(1));
    drain(&mut rx_a);
    drain(&mut rx_b);

    let mut packet = mob_move_request(mob.id());
    let outcome = field
        .dispatch(&b, RecvOperation::MobMove, &mut packet)
        .await
        .unwrap();
    assert_eq!(outcome, Dispatch::Handled);
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());
    assert_eq!(mob.placement().position, Point::new(100, 0));

    let mut packet = mob_move_request(mob.id());
    field
        .dispatch(&a, RecvOperation::MobMove, &mut packet)
        .await
        .unwrap();
    assert_eq!(drain(&mut rx_a), vec![SendOperation::MobCtrlAck.as_u16()]);
    assert_eq!(drain(&mut rx_b), vec![SendOperation::MobMove.as_u16()]);
    assert_eq!(mob.placement().position, Point::new(55, -3));
    assert_eq!(mob.placement().foothold, 7);
}

/// NPC moves from the controller reach every user, the controller included
#[tokio::test]
async fn test_npc_move_broadcasts_to_everyone() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let npc = npc();
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);
    field.enter(FieldObject::Npc(npc.clone())).await.unwrap();
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    field.enter(FieldObject::User(b.clone())).await.unwrap();
    assert_eq!(npc.controller(), Some(1));
    drain(&mut rx_a);
    drain(&mut rx_b);

    let npc_move = |id: i32| {
        let mut packet = PacketBuffer::new();
        packet.write_i32(id).write_u8(1).write_u8(0xFF);
        packet
    };

    let mut packet = npc_move(npc.id());
    field
        .dispatch(&b, RecvOperation::NpcMove, &mut packet)
        .await
        .unwrap();
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());

    let mut packet = npc_move(npc.id());
    let outcome = field
        .dispatch(&a, RecvOperation::NpcMove, &mut packet)
        .await
        .unwrap();
    assert_eq!(outcome, Dispatch::Handled);
    assert_eq!(drain(&mut rx_a), vec![SendOperation::NpcMove.as_u16()]);
    assert_eq!(drain(&mut rx_b), vec![SendOperation::NpcMove.as_u16()]);
}

/// Hitting a reactor advances its state and announces it; touching it is silent
#[tokio::test]
async fn test_reactor_hit_changes_state() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let template = Arc::new(ReactorTemplate {
        id: 1002000,
        state_count: 3,
    });
    let reactor = FieldReactor::new(template, Point::new(50, 0), false, String::new());
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);
    field.enter(FieldObject::Reactor(reactor.clone())).await.unwrap();
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    field.enter(FieldObject::User(b.clone())).await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let mut packet = PacketBuffer::new();
    packet.write_i32(reactor.id()).write_i32(0).write_i16(0).write_i32(0);
    field
        .dispatch(&a, RecvOperation::ReactorHit, &mut packet)
        .await
        .unwrap();

    assert_eq!(reactor.state(), 1);
    assert_eq!(drain(&mut rx_a), vec![SendOperation::ReactorChangeState.as_u16()]);
    assert_eq!(drain(&mut rx_b), vec![SendOperation::ReactorChangeState.as_u16()]);

    let mut packet = PacketBuffer::new();
    packet.write_i32(reactor.id());
    let outcome = field
        .dispatch(&b, RecvOperation::ReactorTouch, &mut packet)
        .await
        .unwrap();
    assert_eq!(outcome, Dispatch::Handled);
    assert_eq!(reactor.state(), 1);
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());
}

/// Chat goes to everyone, the speaker included
#[tokio::test]
async fn test_chat_includes_sender() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    field.enter(FieldObject::User(b.clone())).await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let mut packet = PacketBuffer::new();
    packet.write_i32(0).write_string("hello").write_bool(false);
    field
        .dispatch(&a, RecvOperation::UserChat, &mut packet)
        .await
        .unwrap();

    let mut expected = OutPacket::builder(SendOperation::UserChat);
    expected
        .write_i32(1)
        .write_bool(false)
        .write_string("hello")
        .write_bool(false);
    let expected = expected.build();

    for rx in [&mut rx_a, &mut rx_b] {
        let received = recv_all(rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].as_ref(), expected.as_bytes());
    }
}

/// Character info is answered to the requester only, and only for present users
#[tokio::test]
async fn test_character_info_is_unicast() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let (a, mut rx_a) = user(1);
    let (b, mut rx_b) = user(2);
    field.enter(FieldObject::User(a.clone())).await.unwrap();
    field.enter(FieldObject::User(b.clone())).await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let info_request = |target: i32| {
        let mut packet = PacketBuffer::new();
        packet.write_i32(0).write_i32(target);
        packet
    };

    let mut packet = info_request(2);
    field
        .dispatch(&a, RecvOperation::UserCharacterInfoRequest, &mut packet)
        .await
        .unwrap();
    assert_eq!(drain(&mut rx_a), vec![SendOperation::CharacterInfo.as_u16()]);
    assert!(drain(&mut rx_b).is_empty());

    let mut packet = info_request(99);
    let outcome = field
        .dispatch(&a, RecvOperation::UserCharacterInfoRequest, &mut packet)
        .await
        .unwrap();
    assert_eq!(outcome, Dispatch::Handled);
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());
}

/// A broadcast reaches every present user exactly once; an excluded source gets nothing
#[tokio::test]
async fn test_broadcast_delivers_once_per_user() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let mut receivers = Vec::new();
    for id in 1..=3 {
        let (u, rx) = user(id);
        field.enter(FieldObject::User(u)).await.unwrap();
        receivers.push(rx);
    }
    for rx in &mut receivers {
        drain(rx);
    }

    let packet = OutPacket::builder(SendOperation::UserChat).build();
    let report = field.broadcast(&packet).await;
    assert_eq!(report.recipients, 3);
    for rx in &mut receivers {
        assert_eq!(drain(rx), vec![SendOperation::UserChat.as_u16()]);
    }

    field.broadcast_except(2, &packet).await;
    let counts: Vec<usize> = receivers.iter_mut().map(|rx| drain(rx).len()).collect();
    assert_eq!(counts, vec![1, 0, 1]);
}

/// Membership and control stay consistent through a mixed enter/leave sequence
#[tokio::test]
async fn test_enter_leave_sequence_keeps_membership_consistent() {
    let field = Field::new(HENESYS, templates().field(HENESYS).unwrap(), Weak::new());
    let (u1, _rx1) = user(1);
    let (u2, _rx2) = user(2);
    let (u3, _rx3) = user(3);
    let objects = [
        FieldObject::User(u1),
        FieldObject::User(u2),
        FieldObject::User(u3),
        FieldObject::Mob(snail()),
        FieldObject::Mob(snail()),
        FieldObject::Npc(npc()),
    ];

    // (enter?, object index)
    let steps = [
        (true, 3),
        (true, 0),
        (true, 5),
        (true, 1),
        (false, 0),
        (true, 4),
        (false, 0),
        (true, 2),
        (true, 1),
        (false, 1),
        (false, 3),
        (false, 2),
        (true, 0),
        (false, 0),
    ];

    let mut present: Vec<usize> = Vec::new();
    for (enter, index) in steps {
        let object = &objects[index];
        if enter {
            field.enter(object.clone()).await.unwrap();
            if !present.contains(&index) {
                present.push(index);
            }
        } else {
            let was_member = field.leave(object).await;
            assert_eq!(was_member, present.contains(&index));
            present.retain(|i| *i != index);
        }

        assert_eq!(field.member_count(), present.len());
        for (i, candidate) in objects.iter().enumerate() {
            assert_eq!(field.contains(candidate), present.contains(&i));
        }
        assert_controllers_present(&field);
    }

    let ids: Vec<i32> = field
        .members()
        .iter()
        .filter(|m| !m.is_user())
        .map(FieldObject::id)
        .collect();
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
}

/// A connection that stays silent past the idle timeout is dropped and cleaned up
#[tokio::test]
async fn test_idle_connection_is_dropped() {
    let characters = CharacterStore::new();
    characters.save(Character::new(8, "Sleeper", HENESYS));
    let (shutdown_tx, _) = broadcast::channel(1);
    let config = ServerConfig {
        idle_timeout_secs: 1,
        ..Default::default()
    };
    let state = Arc::new(AppState::with_stores(
        config,
        shutdown_tx,
        templates(),
        characters,
    ));

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let handler = ConnectionHandler::new(state.clone());
    let address: SocketAddr = "127.0.0.1:9002".parse().unwrap();
    let connection = tokio::spawn(async move {
        handler
            .handle_connection(server_read, server_write, address)
            .await
    });

    let (_client_read, mut client_write) = tokio::io::split(client);
    let mut migrate = PacketBuffer::new();
    migrate
        .write_u16(RecvOperation::MigrateIn.as_u16())
        .write_i32(8);
    write_frame(&mut client_write, migrate.as_bytes()).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), connection)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    let field = state.fields.get(HENESYS).await.unwrap();
    assert!(field.lookup_user(8).is_none());
    assert!(!state.session_manager.is_online(8));
    assert_eq!(state.session_manager.count(), 0);
}
