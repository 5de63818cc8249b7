//! Instance lifecycle: port allocation, subprocess supervision, crash/restart, recovery
//! (spec.md §4.1, §4.2).

mod error;
mod events;
mod instance;
mod manager;
mod port_pool;
mod supervisor;

pub use error::{OrchestratorError, Result};
pub use events::{EventBus, InstanceEvent};
pub use instance::{instance_id_for_topic, is_legal_transition, InstanceConfig};
pub use manager::{GetOrCreateOptions, InstanceInfo, OrchestratorManager, RecoveryReport};
pub use port_pool::{PortPool, PortPoolStatus};
pub use supervisor::SupervisorOptions;
