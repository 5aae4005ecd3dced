//! Presence registry and offline message pipeline for an IM gateway fleet.
//!
//! Two independent halves:
//!
//! - [`registry`]: which gateway node holds each user's device connections,
//!   kept as leased keys in a [`store::LeaseStore`] so crashed gateways age
//!   out on their own. Nodes keep local views current through watches.
//! - [`offline`]: a consumer-group worker that moves messages for offline
//!   users from a partitioned [`log`] into durable storage, deduplicated and
//!   committed only once persisted.
//!
//! Backends are traits; in-memory implementations are provided for every
//! one of them, plus PostgreSQL for message storage (feature `postgres`).

pub mod cli;
pub mod config;
pub mod error;
pub mod log;
pub mod offline;
pub mod registry;
mod shutdown;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use offline::{OfflineWorker, WorkerStats};
pub use registry::{GatewayLocation, PresenceRegistry, WatchEvent, WatchEventType};
