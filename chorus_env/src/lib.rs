//! Chorus Environment Abstraction Layer
//!
//! This crate provides the seams that let the dispatch core run unchanged
//! in **Production** (tokio, real stores) and **Simulation** (virtual clock,
//! fault-injecting stores).
//!
//! Two things are intercepted:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - The shared key/value store (`KvStore`)
//!
//! # Example
//!
//! ```ignore
//! use chorus_env::{ChorusContext, KvStore};
//!
//! async fn refill<Ctx: ChorusContext>(ctx: &Ctx, store: &dyn KvStore) {
//!     let now = ctx.unix_secs();
//!     store.hset("ratelimit:demo", "last_update", &now.to_string()).await.ok();
//! }
//! ```

mod context;
mod store;
mod memory_store;
mod types;
mod error;
mod tokio_impl;

pub use context::ChorusContext;
pub use store::{KvStore, StoreController};
pub use memory_store::MemoryStore;
pub use types::{ItemId, OrgId, RunId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
