//! slawatch-core: SLA tracking for recurring batch runs
//!
//! Records run starts and completions, detects deadline breaches while runs
//! are still in flight, keeps a read cache in step with the run store, and
//! delivers one alert per breach.
//!
//! # Architecture
//!
//! ```text
//! start/complete ─► Ingestion ─► Store (SQLite) ◄─ Queries ◄─ Cache
//!                       │                               ▲
//!                       ├─► Deadline Index ─► Detection │
//!                       ▼                        ▼      │
//!                    Event Bus ◄─────────────────┘      │
//!                       ├─► Cache invalidation ─────────┘
//!                       └─► Alert pipeline ─► Alert sink
//! ```
//!
//! # Modules
//!
//! - `model`: runs, breach events, definitions and status DTOs
//! - `store`: canonical store contracts and the SQLite store
//! - `cache`: cache backends and the run/status cache
//! - `deadline_index`: in-flight deadlines ordered by time
//! - `evaluation` / `sla_time`: SLA rules and CET deadline arithmetic
//! - `ingestion`: start/complete triggers
//! - `detection`: live breach detection and early warnings
//! - `alerting` / `alert_sink`: idempotent breach alerts with retries
//! - `query`: cached status reads
//! - `events`: domain events and the in-process bus
//! - `tasks` / `watchdog`: background loops and their health
//! - `config`, `logging`, `metrics`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod alert_sink;
pub mod alerting;
pub mod bloom_filter;
pub mod cache;
pub mod cache_sync;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod deadline_index;
pub mod detection;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod ingestion;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod query;
pub mod retry;
pub mod services;
pub mod sla_time;
pub mod store;
pub mod tasks;
pub mod watchdog;

pub use config::Config;
pub use error::{AlertError, CacheError, ConfigError, Error, Result, StoreError};
pub use services::Services;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
