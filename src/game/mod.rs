//! Game module
//!
//! This module contains the field simulation engine:
//! - Static templates (maps, portals, footholds, life, reactors)
//! - Character profiles and their store
//! - Temporary stats
//! - Fields, the objects inside them and the field factory
//! - World tick driving field updates

pub mod character;
pub mod field;
pub mod stats;
pub mod template;
pub mod world;
