//! Logging initialization and utilities

use std::sync::atomic::{AtomicBool, Ordering};

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable.
///
/// # Example
/// ```
/// deepfield::core::logging::init();
/// log::info!("Terrain started");
/// ```
pub fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format_timestamp_millis()
    .try_init();
}

/// Latch for warnings that should be emitted once per owner
///
/// ```
/// use deepfield::core::logging::WarnOnce;
///
/// let latch = WarnOnce::new();
/// assert!(latch.first());
/// assert!(!latch.first());
/// ```
#[derive(Debug, Default)]
pub struct WarnOnce(AtomicBool);

impl WarnOnce {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns true exactly once, on the first call
    pub fn first(&self) -> bool {
        !self.0.swap(true, Ordering::Relaxed)
    }
}

/// Log a warning the first time a latch is hit
#[macro_export]
macro_rules! warn_once {
    ($latch:expr, $($arg:tt)+) => {
        if $latch.first() {
            log::warn!($($arg)+);
        }
    };
}
