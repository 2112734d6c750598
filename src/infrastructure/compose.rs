//! Compose CLI engine adapter
//!
//! Implements `Engine` on top of the `docker compose` CLI. Topologies are
//! rendered to a temporary file per call; staged secret values are passed
//! to the child process environment only and never written to disk.

use std::collections::BTreeSet;
use std::io::Write;
use std::process::Output;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use super::engine::{Engine, EngineInfo, ExecOutput, Instance, InstanceState};
use crate::domain::topology::Project;
use crate::error::EngineError;
use crate::tools::{get_tool_path, DOCKER};

/// Label compose puts on containers naming their project
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label compose puts on containers naming their service
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Engine backed by the docker compose CLI
pub struct ComposeEngine {
    binary: String,
}

impl Default for ComposeEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of `docker ps --format '{{json .}}'`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    names: String,
    state: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    labels: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InfoDoc {
    #[serde(default)]
    operating_system: String,
    #[serde(default)]
    server_version: String,
}

/// Rendered compose file, with bookkeeping labels merged in
pub fn render(project: &Project) -> Result<String, EngineError> {
    let mut rendered = project.clone();
    for svc in rendered.services.values_mut() {
        let custom = std::mem::take(&mut svc.custom_labels);
        svc.labels.extend(custom);
    }
    rendered.to_yaml().map_err(|e| EngineError::Render {
        message: e.to_string(),
    })
}

fn profiles(project: &Project) -> BTreeSet<String> {
    project
        .services
        .values()
        .flat_map(|svc| svc.profiles.iter().cloned())
        .collect()
}

fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

fn parse_labels(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
}

fn parse_health(status: &str) -> Option<String> {
    if status.contains("(healthy)") {
        Some("healthy".to_string())
    } else if status.contains("(unhealthy)") {
        Some("unhealthy".to_string())
    } else if status.contains("(health: starting)") {
        Some("starting".to_string())
    } else {
        None
    }
}

/// Parse `docker ps` JSON lines into instances
pub fn parse_ps(stdout: &str) -> Result<Vec<Instance>, EngineError> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let ps: PsLine = serde_json::from_str(line).map_err(|e| EngineError::InvalidOutput {
                command: "docker ps".to_string(),
                message: e.to_string(),
            })?;
            let mut project = String::new();
            let mut service = String::new();
            for (key, value) in parse_labels(&ps.labels) {
                match key {
                    PROJECT_LABEL => project = value.to_string(),
                    SERVICE_LABEL => service = value.to_string(),
                    _ => {}
                }
            }
            Ok(Instance {
                name: ps.names.trim_start_matches('/').to_string(),
                project,
                service,
                state: InstanceState::parse(&ps.state),
                health: parse_health(&ps.status),
            })
        })
        .collect()
}

impl ComposeEngine {
    pub fn new() -> Self {
        Self {
            binary: get_tool_path(DOCKER),
        }
    }

    fn compose(&self, project: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["compose", "--project-name", project]);
        cmd
    }

    /// Compose command bound to a rendered copy of `project`
    ///
    /// The returned temp file must outlive the command.
    fn compose_file(&self, project: &Project) -> Result<(Command, NamedTempFile), EngineError> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", project.name))
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(render(project)?.as_bytes())?;
        file.flush()?;

        let mut cmd = self.compose(&project.name);
        cmd.arg("--file").arg(file.path());
        for profile in profiles(project) {
            cmd.args(["--profile", &profile]);
        }
        cmd.envs(&project.environment);
        Ok((cmd, file))
    }

    async fn run(&self, mut cmd: Command) -> Result<Output, EngineError> {
        let command = describe(&cmd);
        debug!("Running {}", command);

        let output = cmd.output().await.map_err(|source| EngineError::Spawn {
            command: command.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Engine for ComposeEngine {
    async fn create(&self, project: &Project) -> Result<(), EngineError> {
        let (mut cmd, _file) = self.compose_file(project)?;
        cmd.args(["create", "--remove-orphans"]);
        self.run(cmd).await.map(|_| ())
    }

    async fn up(&self, project: &Project, services: &[String]) -> Result<(), EngineError> {
        let (mut cmd, _file) = self.compose_file(project)?;
        cmd.args(["up", "--detach", "--wait"]);
        cmd.args(services);
        self.run(cmd).await.map(|_| ())
    }

    async fn start(&self, project: &str, services: &[String]) -> Result<(), EngineError> {
        let mut cmd = self.compose(project);
        cmd.arg("start");
        cmd.args(services);
        self.run(cmd).await.map(|_| ())
    }

    async fn remove(&self, project: &str, services: &[String]) -> Result<(), EngineError> {
        let mut cmd = self.compose(project);
        cmd.args(["rm", "--force", "--stop"]);
        cmd.args(services);
        self.run(cmd).await.map(|_| ())
    }

    async fn down(&self, project: &str, remove_volumes: bool) -> Result<(), EngineError> {
        let mut cmd = self.compose(project);
        cmd.arg("down");
        if remove_volumes {
            cmd.arg("--volumes");
        }
        self.run(cmd).await.map(|_| ())
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput, EngineError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["exec", container]);
        cmd.args(command);
        // only the program name: arguments may carry credentials
        let program = command.first().map(String::as_str).unwrap_or_default();

        // Non-zero exits are data for the caller, not engine failures
        let output = cmd.output().await.map_err(|source| EngineError::Spawn {
            command: format!("{} exec {} {}", self.binary, container, program),
            source,
        })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn list(&self, all: bool) -> Result<Vec<Instance>, EngineError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("ps");
        if all {
            cmd.arg("--all");
        }
        cmd.args(["--no-trunc", "--format", "{{json .}}"]);
        let output = self.run(cmd).await?;
        parse_ps(&String::from_utf8_lossy(&output.stdout))
    }

    async fn info(&self) -> Result<EngineInfo, EngineError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["info", "--format", "{{json .}}"]);
        let output = self.run(cmd).await?;
        let doc: InfoDoc =
            serde_json::from_slice(&output.stdout).map_err(|e| EngineError::InvalidOutput {
                command: "docker info".to_string(),
                message: e.to_string(),
            })?;
        Ok(EngineInfo {
            os: doc.operating_system,
            version: doc.server_version,
        })
    }
}
