//! Staleness-aware performance metric snapshots for Group Scholar cohorts.

pub mod aggregate;
pub mod db;
pub mod hooks;
pub mod memory;
pub mod models;
pub mod policy;
pub mod queue;
pub mod report;
pub mod service;
pub mod store;
pub mod worker;

pub use hooks::{InvalidationHooks, SourceChange};
pub use memory::MemoryStore;
pub use policy::{FreshnessMeta, FreshnessPolicy, SNAPSHOT_POLICY};
pub use service::MetricsService;
pub use worker::{RefreshWorker, WorkerSettings};
