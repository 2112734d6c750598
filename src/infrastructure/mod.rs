//! Infrastructure layer - external I/O adapters
//!
//! This module contains all code that interacts with external systems:
//! - Container engine (docker compose CLI)
//! - Secret store (OpenBao CLI in-container, or HTTP API)
//! - PostgreSQL admin statements via exec

pub mod compose;
pub mod engine;
pub mod postgres;
pub mod secret_store;

// Re-export commonly used types
pub use compose::ComposeEngine;
pub use engine::{Engine, EngineInfo, ExecOutput, Instance, InstanceState};
pub use postgres::PgAdmin;
pub use secret_store::{ExecSecretStore, HttpSecretStore, SecretStore};
