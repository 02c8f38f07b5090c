//! Manually advanced clock for unit tests.

use async_trait::async_trait;
use chorus_env::ChorusContext;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock anchored at a whole second so float arithmetic stays exact.
const EPOCH_OFFSET: Duration = Duration::from_secs(1_700_000_000);

#[derive(Clone, Default)]
pub struct ManualClock {
    elapsed: Arc<Mutex<Duration>>,
    /// Sleeps return without moving time
    frozen: bool,
}

impl ManualClock {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frozen() -> Arc<Self> {
        Arc::new(Self {
            frozen: true,
            ..Default::default()
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock().unwrap() += by;
    }
}

#[async_trait]
impl ChorusContext for ManualClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + EPOCH_OFFSET + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        if !self.frozen {
            self.advance(duration);
        }
        tokio::task::yield_now().await;
    }
}
