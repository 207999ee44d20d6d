//! Time utilities for game simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Tick rate configuration
pub const SIMULATION_TPS: u32 = 50; // fixed physics step, 20 ms
pub const SNAPSHOT_TPS: u32 = 25;
pub const TICK_DURATION_MICROS: u64 = 1_000_000 / SIMULATION_TPS as u64;

/// Fixed simulation step as a `Duration`, used by every tick-advanced timer
pub fn tick_step() -> Duration {
    Duration::from_micros(TICK_DURATION_MICROS)
}

/// Number of whole ticks needed to cover `duration`
pub fn ticks_for(duration: Duration) -> u64 {
    let micros = duration.as_micros() as u64;
    micros.div_ceil(TICK_DURATION_MICROS)
}
