//! Core environment context trait for Chorus components.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for time.
///
/// This trait abstracts the clock so that rate limiting, retry backoff and
/// progress estimation run identically in production (tokio) and in the
/// deterministic simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Simulation**: `SimContext` - a virtual clock advanced by the harness
#[async_trait]
pub trait ChorusContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for latency measurement and progress estimation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Token buckets persist `last_update` as wall-clock seconds so that
    /// several processes sharing one store agree on elapsed time.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Wall-clock time as fractional seconds since the Unix epoch.
    fn unix_secs(&self) -> f64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
    }
}
