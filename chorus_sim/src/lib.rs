//! Chorus Deterministic Simulation Harness
//!
//! Runs the dispatch core against a virtual clock, a fault-injecting store
//! and scripted providers, so every queue, limiter and orchestrator
//! property can be checked end to end and replayed from a seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: `SimContext` advances a virtual clock on every `sleep()`
//! - **Store**: `FlakyStore` can drop out or slow down on command
//! - **Providers**: `ScriptedBackend` draws latency and failures from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                       │
//! │                                                          │
//! │   SimContext ──► DispatchService ──► Orchestrator        │
//! │   (virtual clock)     │   │               │              │
//! │                       │   └─ RateLimiter  └─ PromptQueue │
//! │                       │          │              │        │
//! │                       ▼          ▼              ▼        │
//! │               ScriptedBackend   FlakyStore (outages)     │
//! │               (seeded faults)                            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use chorus_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::ProviderCap).await;
//! assert!(result.passed);
//! ```

mod backend;
mod context;
mod exporter;
mod runner;
mod store;
pub mod scenarios;

pub use backend::{BackendProfile, InFlightGauge, ScriptedBackend, ScriptedFactory};
pub use context::SimContext;
pub use exporter::{ExportError, RunRecord, SimExport};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use store::FlakyStore;
