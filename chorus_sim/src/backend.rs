//! Scripted provider backends with seeded faults.

use crate::context::SimContext;
use async_trait::async_trait;
use chorus_core::provider::{BackendError, Completion, ProviderBackend, ProviderKind, QueryRequest};
use chorus_core::registry::BackendFactory;
use chorus_core::{DispatchError, Result};
use chorus_env::ChorusContext;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Current and peak number of calls inside a backend.
#[derive(Debug, Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Fault profile of one scripted provider.
#[derive(Debug, Clone, Copy)]
pub struct BackendProfile {
    /// Mean virtual latency per call
    pub mean_latency: Duration,
    /// Probability that an attempt fails with a retryable 503
    pub failure_rate: f64,
    /// Probability that an attempt never answers within real time
    pub hang_rate: f64,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            mean_latency: Duration::from_millis(800),
            failure_rate: 0.0,
            hang_rate: 0.0,
        }
    }
}

enum Fate {
    Answer(Duration),
    Fail(Duration),
    Hang,
}

/// Provider backend whose answers, latencies and failures come from a
/// seeded RNG.
pub struct ScriptedBackend {
    provider: ProviderKind,
    profile: BackendProfile,
    context: Arc<SimContext>,
    rng: Mutex<ChaCha8Rng>,
    gauge: Arc<InFlightGauge>,
    shared_gauge: Option<Arc<InFlightGauge>>,
    calls: AtomicU64,
}

impl ScriptedBackend {
    pub fn new(provider: ProviderKind, profile: BackendProfile, context: Arc<SimContext>) -> Self {
        let rng = context.fork_rng();
        Self {
            provider,
            profile,
            context,
            rng: Mutex::new(rng),
            gauge: InFlightGauge::shared(),
            shared_gauge: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Also reports in-flight calls to a gauge shared with other backends.
    pub fn with_shared_gauge(mut self, gauge: Arc<InFlightGauge>) -> Self {
        self.shared_gauge = Some(gauge);
        self
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn gauge(&self) -> &Arc<InFlightGauge> {
        &self.gauge
    }

    /// Attempts received, retries included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn draw(&self) -> Fate {
        let mut rng = self.rng.lock().unwrap();
        let mean_ms = self.profile.mean_latency.as_millis().max(1) as f64;
        let latency = Exp::new(1.0 / mean_ms)
            .map(|d| Duration::from_millis(d.sample(&mut *rng).ceil() as u64))
            .unwrap_or(self.profile.mean_latency);

        let roll: f64 = rng.gen();
        if roll < self.profile.hang_rate {
            Fate::Hang
        } else if roll < self.profile.hang_rate + self.profile.failure_rate {
            Fate::Fail(latency)
        } else {
            Fate::Answer(latency)
        }
    }

    async fn stay(&self, latency: Duration) {
        // Two virtual sleeps so concurrent calls get to overlap
        self.context.sleep(latency / 2).await;
        self.context.sleep(latency - latency / 2).await;
    }
}

#[async_trait]
impl ProviderBackend for ScriptedBackend {
    async fn complete(
        &self,
        request: &QueryRequest,
        model: &str,
        _system_prompt: &str,
    ) -> std::result::Result<Completion, BackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let fate = self.draw();

        self.gauge.enter();
        if let Some(shared) = &self.shared_gauge {
            shared.enter();
        }
        let outcome = match fate {
            Fate::Answer(latency) => {
                self.stay(latency).await;
                let text = format!("[{}] {}", self.provider, request.text);
                Ok(Completion {
                    tokens_used: (request.text.len() + text.len()) as u64 / 4 + 1,
                    text,
                    model: model.to_string(),
                })
            }
            Fate::Fail(latency) => {
                self.stay(latency).await;
                Err(BackendError::Http {
                    status: 503,
                    body: "scripted outage".into(),
                })
            }
            Fate::Hang => {
                // Real time, so the orchestrator's call timeout fires
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BackendError::Transport("hung call released".into()))
            }
        };
        self.gauge.leave();
        if let Some(shared) = &self.shared_gauge {
            shared.leave();
        }
        outcome
    }
}

/// Hands out the scripted backend registered for each provider.
#[derive(Default)]
pub struct ScriptedFactory {
    backends: HashMap<ProviderKind, Arc<ScriptedBackend>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: ScriptedBackend) -> Self {
        self.backends.insert(backend.provider(), Arc::new(backend));
        self
    }

    pub fn backend_for(&self, provider: ProviderKind) -> Option<&Arc<ScriptedBackend>> {
        self.backends.get(&provider)
    }
}

impl BackendFactory for ScriptedFactory {
    fn backend(&self, provider: ProviderKind, _model: &str) -> Result<Arc<dyn ProviderBackend>> {
        self.backends
            .get(&provider)
            .map(|b| b.clone() as Arc<dyn ProviderBackend>)
            .ok_or_else(|| DispatchError::Config(format!("no scripted backend for {}", provider)))
    }
}
