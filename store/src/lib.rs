//! Durable SQLite stores for the supervisor (spec.md §4.3, §6).
//!
//! Two independent single-file WAL-mode databases: [`InstanceStore`] (orchestrator: instance
//! records + port allocations) and [`TopicStore`] (registry: topic mappings, stats, event log).
//! Both are blocking `rusqlite` connections behind a mutex, driven via
//! `tokio::task::block_in_place` from the async control task that owns them (spec.md §5).

mod error;
mod instance_store;
mod models;
mod topic_store;

pub use error::{Result, StoreError};
pub use instance_store::InstanceStore;
pub use models::{
    now_ms, InstanceRecord, InstanceState, PortAllocation, TopicEvent, TopicEventType,
    TopicMapping, TopicStats, TopicStatus,
};
pub use topic_store::TopicStore;
