//! Container engine collaborator
//!
//! The orchestrator treats the engine as a remote state-change API. It never
//! reimplements container lifecycle semantics; it only asks for topologies to
//! be created, started, removed and inspected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::topology::Project;
use crate::error::EngineError;

/// Engine major version from which secret mounts may carry a group
pub const SECRET_GID_MIN_VERSION: u32 = 28;

/// Result of running a command inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container state as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Removing,
    Dead,
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "removing" => Self::Removing,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Removing => "removing",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

/// One container known to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub project: String,
    pub service: String,
    pub state: InstanceState,
    pub health: Option<String>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    /// Running, and healthy if the container has a health check
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.health.as_deref().map_or(true, |h| h == "healthy")
    }
}

/// Host engine facts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineInfo {
    pub os: String,
    pub version: String,
}

impl EngineInfo {
    pub fn major_version(&self) -> Option<u32> {
        self.version
            .trim()
            .trim_start_matches('v')
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
    }

    /// Older engines reject a group on secret mounts and service users
    ///
    /// An engine whose version cannot be read is treated as old.
    pub fn strips_secret_gid(&self) -> bool {
        self.major_version()
            .map_or(true, |major| major < SECRET_GID_MIN_VERSION)
    }

    /// Podman-based hosts relabel bind mounts instead of chowning them
    pub fn is_podman_host(&self) -> bool {
        self.os.to_lowercase().contains("centos")
    }
}

/// Container runtime operations used by the orchestrator
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create containers, networks and volumes for every service without starting them
    async fn create(&self, project: &Project) -> Result<(), EngineError>;

    /// Create and start `services` (all when empty), waiting until they are up
    async fn up(&self, project: &Project, services: &[String]) -> Result<(), EngineError>;

    /// Start already created containers
    async fn start(&self, project: &str, services: &[String]) -> Result<(), EngineError>;

    /// Stop and remove the containers of `services`
    async fn remove(&self, project: &str, services: &[String]) -> Result<(), EngineError>;

    async fn down(&self, project: &str, remove_volumes: bool) -> Result<(), EngineError>;

    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput, EngineError>;

    async fn list(&self, all: bool) -> Result<Vec<Instance>, EngineError>;

    async fn info(&self) -> Result<EngineInfo, EngineError>;
}

/// Name of the container backing `service` in `project`
pub fn container_ref(project: &Project, service: &str) -> String {
    project
        .service(service)
        .and_then(|svc| svc.container_name.clone())
        .unwrap_or_else(|| format!("{}-{}-1", project.name, service))
}
