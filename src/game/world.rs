//! World module
//!
//! Drives the simulation clock of one channel. Every tick hands the current
//! time to each loaded field, which expires drops and temporary stats.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::game::field::FieldManager;

/// Default field update interval in milliseconds
pub const TICK_RATE_MS: u64 = 1000;

/// Ticks between periodic status lines
const STATUS_INTERVAL_TICKS: u64 = 600;

/// Channel identity and clock settings
#[derive(Debug, Clone)]
pub struct WorldSettings {
    pub world_id: u8,
    pub channel_id: u8,
    /// World name
    pub name: String,
    pub dev_mode: bool,
    /// Interval between field updates
    pub tick_rate_ms: u64,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            world_id: 0,
            channel_id: 0,
            name: "Scania".to_string(),
            dev_mode: true,
            tick_rate_ms: TICK_RATE_MS,
        }
    }
}

impl WorldSettings {
    pub fn new(world_id: u8) -> Self {
        Self {
            world_id,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_channel(mut self, channel_id: u8) -> Self {
        self.channel_id = channel_id;
        self
    }

    pub fn with_tick_rate(mut self, tick_rate_ms: u64) -> Self {
        self.tick_rate_ms = tick_rate_ms;
        self
    }

    fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_rate_ms.max(1))
    }
}

/// Lifecycle of the tick loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldState {
    /// Created, loop not started
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Tick driver for every field of a channel
pub struct GameWorld {
    pub settings: WorldSettings,
    state: RwLock<WorldState>,
    ticks: AtomicU64,
    /// Ticks whose field updates overran the tick interval
    slow_ticks: AtomicU64,
    started_at: RwLock<Option<Instant>>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
    fields: Arc<FieldManager>,
}

impl GameWorld {
    pub fn new(settings: WorldSettings, fields: Arc<FieldManager>) -> Self {
        info!(
            world_id = settings.world_id,
            channel_id = settings.channel_id,
            name = %settings.name,
            "Creating game world"
        );

        Self {
            settings,
            state: RwLock::new(WorldState::Initializing),
            ticks: AtomicU64::new(0),
            slow_ticks: AtomicU64::new(0),
            started_at: RwLock::new(None),
            last_tick_at: RwLock::new(None),
            fields,
        }
    }

    pub fn state(&self) -> WorldState {
        *self.state.read()
    }

    fn transition(&self, next: WorldState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        debug!(from = ?previous, to = ?next, "World state changed");
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorldState::Running
    }

    /// Ticks processed so far
    pub fn tick(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn slow_ticks(&self) -> u64 {
        self.slow_ticks.load(Ordering::Relaxed)
    }

    /// Time handed to fields on the most recent tick
    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        *self.last_tick_at.read()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .read()
            .map_or(Duration::ZERO, |started| started.elapsed())
    }

    /// Tick until a shutdown signal arrives or [`GameWorld::stop`] is called
    pub async fn run(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        let period = self.settings.tick_duration();
        info!(
            world_id = self.settings.world_id,
            channel_id = self.settings.channel_id,
            tick_rate_ms = period.as_millis() as u64,
            "Starting field clock"
        );

        *self.started_at.write() = Some(Instant::now());
        self.transition(WorldState::Running);

        let mut clock = interval(period);
        clock.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.is_running() {
            tokio::select! {
                _ = clock.tick() => {
                    if self.is_running() {
                        self.process_tick().await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Field clock received shutdown signal");
                    self.transition(WorldState::ShuttingDown);
                }
            }
        }

        self.transition(WorldState::Stopped);
        info!(
            ticks = self.tick(),
            slow_ticks = self.slow_ticks(),
            uptime_secs = self.uptime().as_secs(),
            "Field clock stopped"
        );
    }

    /// Ask the loop to stop after the current tick
    pub fn stop(&self) {
        if self.is_running() {
            self.transition(WorldState::ShuttingDown);
        }
    }

    /// Update every loaded field once
    pub async fn process_tick(&self) {
        let now = Utc::now();
        let started = Instant::now();

        self.fields.update_all(now).await;
        *self.last_tick_at.write() = Some(now);
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        let elapsed = started.elapsed();
        if elapsed > self.settings.tick_duration() {
            self.slow_ticks.fetch_add(1, Ordering::Relaxed);
            warn!(
                tick = tick,
                elapsed_ms = elapsed.as_millis() as u64,
                "Field update overran the tick interval"
            );
        }

        if tick % STATUS_INTERVAL_TICKS == 0 {
            let fields = self.fields.count().await;
            debug!(tick = tick, fields = fields, "Field clock status");
        }
    }
}

impl std::fmt::Display for GameWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (world {}, channel {}) tick {} up {}s",
            self.settings.name,
            self.settings.world_id,
            self.settings.channel_id,
            self.tick(),
            self.uptime().as_secs()
        )
    }
}

impl std::fmt::Debug for GameWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameWorld")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("ticks", &self.tick())
            .field("fields", &self.fields)
            .finish()
    }
}
