//! Services layer - orchestration logic
//!
//! This module coordinates between domain logic and infrastructure.
//! Services use infrastructure adapters to perform I/O operations.

pub mod bootstrap_service;
pub mod project_builder;
pub mod provisioning_service;
pub mod retry;
pub mod staging;
pub mod unseal_service;

// Re-export commonly used types
pub use bootstrap_service::{ApplyOptions, ApplyOutcome, ApplyReport, Orchestrator};
pub use project_builder::{default_manifests, Components, ProjectBuilder};
pub use retry::RetryPolicy;
pub use unseal_service::{MemoryShares, SharePersistence, UnsealReport, UnsealState};
