//! Domain layer - pure business logic
//!
//! This module contains business logic with no external I/O.
//! Types and functions here can be unit tested without mocking.

pub mod bootstrap;
pub mod helpers;
pub mod kind;
pub mod naming;
pub mod topology;

// Re-export commonly used types
pub use bootstrap::{BootstrapPlan, Phase};
pub use helpers::{Helper, Pipeline};
pub use kind::ManagedKind;
pub use topology::{Condition, Dependency, Project, Service};
