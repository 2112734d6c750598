//! Mutation pipeline
//!
//! A `Helper` is one named, idempotent transform over the topology. Helpers
//! that set defaultable fields no-op when the field is already set, so a
//! specific helper always wins over a generic default regardless of order.
//! Collection helpers are additive and de-duplicate by key.
//!
//! `Pipeline::run` applies helpers in order and stops at the first error.
//! Mutations applied before the failure are kept.

use std::collections::BTreeMap;

use tracing::debug;

use super::kind::SECRETS_PATH;
use super::naming;
use super::topology::{
    Condition, Dependency, HealthCheck, NetworkSpec, PortMapping, Project, SecretDescriptor,
    Service, ServiceSecret, ServiceVolume, MountKind, VolumeSpec,
};
use crate::error::ConfigError;

/// A single named mutation of the topology
pub trait Helper: Send + Sync {
    /// Name used in error messages and logs
    fn name(&self) -> &'static str;

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError>;
}

fn service_mut<'a>(
    project: &'a mut Project,
    helper: &'static str,
    service: &str,
) -> Result<&'a mut Service, ConfigError> {
    project
        .service_mut(service)
        .ok_or_else(|| ConfigError::ServiceNotFound {
            helper,
            service: service.to_string(),
        })
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

fn push_missing(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Ordered list of helpers applied to a project
#[derive(Default)]
pub struct Pipeline {
    helpers: Vec<Box<dyn Helper>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: append a helper
    pub fn with(mut self, helper: impl Helper + 'static) -> Self {
        self.push(helper);
        self
    }

    pub fn push(&mut self, helper: impl Helper + 'static) {
        self.helpers.push(Box::new(helper));
    }

    pub fn append(&mut self, mut other: Pipeline) {
        self.helpers.append(&mut other.helpers);
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.helpers.iter().map(|h| h.name()).collect()
    }

    /// Apply every helper in order, returning the first error verbatim
    pub fn run(&self, project: &mut Project) -> Result<(), ConfigError> {
        for helper in &self.helpers {
            debug!("Applying helper {}", helper.name());
            helper.apply(project)?;
        }
        Ok(())
    }
}

// ============================================================================
// Service-level defaults (no-op when already set)
// ============================================================================

/// Add capabilities unless the service already declares some
pub struct CapAdd {
    service: String,
    caps: Vec<String>,
}

impl CapAdd {
    pub fn new<I, S>(service: impl Into<String>, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            caps: strings(caps),
        }
    }
}

impl Helper for CapAdd {
    fn name(&self) -> &'static str {
        "CapAdd"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.cap_add.is_empty() {
            svc.cap_add = self.caps.clone();
        }
        Ok(())
    }
}

/// Drop capabilities unless the service already declares some
pub struct CapDrop {
    service: String,
    caps: Vec<String>,
}

impl CapDrop {
    pub fn new<I, S>(service: impl Into<String>, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            caps: strings(caps),
        }
    }

    pub fn all(service: impl Into<String>) -> Self {
        Self::new(service, ["ALL"])
    }
}

impl Helper for CapDrop {
    fn name(&self) -> &'static str {
        "CapDrop"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.cap_drop.is_empty() {
            svc.cap_drop = self.caps.clone();
        }
        Ok(())
    }
}

/// Run the service as `uid[:gid]` unless a user is already set
pub struct User {
    service: String,
    uid: String,
    gid: Option<String>,
}

impl User {
    pub fn new(service: impl Into<String>, uid: impl Into<String>, gid: Option<&str>) -> Self {
        Self {
            service: service.into(),
            uid: uid.into(),
            gid: gid.filter(|g| !g.is_empty()).map(str::to_string),
        }
    }
}

impl Helper for User {
    fn name(&self) -> &'static str {
        "User"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.user.as_deref().is_some_and(|u| !u.is_empty()) || self.uid.is_empty() {
            return Ok(());
        }
        svc.user = Some(match &self.gid {
            Some(gid) => format!("{}:{}", self.uid, gid),
            None => self.uid.clone(),
        });
        Ok(())
    }
}

/// Set the container name, defaulting to `<project>-<service>`
pub struct ContainerName {
    service: String,
    name: Option<String>,
}

impl ContainerName {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Helper for ContainerName {
    fn name(&self) -> &'static str {
        "ContainerName"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let project_name = project.name.clone();
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.container_name.is_some() {
            return Ok(());
        }
        let name = match &self.name {
            Some(name) => name.clone(),
            None => naming::slug(&naming::concat([project_name.as_str(), svc.name.as_str()])),
        };
        svc.container_name = Some(name);
        Ok(())
    }
}

/// Set the hostname unless already set
pub struct Hostname {
    service: String,
    hostname: String,
}

impl Hostname {
    pub fn new(service: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            hostname: hostname.into(),
        }
    }
}

impl Helper for Hostname {
    fn name(&self) -> &'static str {
        "Hostname"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.hostname.is_none() {
            svc.hostname = Some(self.hostname.clone());
        }
        Ok(())
    }
}

/// Set the container platform unless already set
pub struct Platform {
    service: String,
    platform: String,
}

impl Platform {
    pub fn new(service: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            platform: platform.into(),
        }
    }
}

impl Helper for Platform {
    fn name(&self) -> &'static str {
        "Platform"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.platform.is_none() {
            svc.platform = Some(self.platform.clone());
        }
        Ok(())
    }
}

/// Set the restart policy unless already set
pub struct RestartPolicy {
    service: String,
    policy: String,
}

impl RestartPolicy {
    pub fn new(service: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            policy: policy.into(),
        }
    }

    pub fn unless_stopped(service: impl Into<String>) -> Self {
        Self::new(service, "unless-stopped")
    }
}

impl Helper for RestartPolicy {
    fn name(&self) -> &'static str {
        "RestartPolicy"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.restart.is_none() {
            svc.restart = Some(self.policy.clone());
        }
        Ok(())
    }
}

/// Attach a health probe unless one is already declared
pub struct HealthProbe {
    service: String,
    check: HealthCheck,
}

impl HealthProbe {
    pub fn new(service: impl Into<String>, check: HealthCheck) -> Self {
        Self {
            service: service.into(),
            check,
        }
    }
}

impl Helper for HealthProbe {
    fn name(&self) -> &'static str {
        "HealthCheck"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.healthcheck.is_none() {
            svc.healthcheck = Some(self.check.clone());
        }
        Ok(())
    }
}

// ============================================================================
// Service-level setters
// ============================================================================

/// Set the image reference
pub struct Image {
    service: String,
    image: String,
}

impl Image {
    pub fn new(service: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            image: image.into(),
        }
    }
}

impl Helper for Image {
    fn name(&self) -> &'static str {
        "Image"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        svc.image = self.image.clone();
        Ok(())
    }
}

/// Replace the command
pub struct Command {
    service: String,
    command: Vec<String>,
}

impl Command {
    pub fn new<I, S>(service: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            command: strings(command),
        }
    }
}

impl Helper for Command {
    fn name(&self) -> &'static str {
        "Command"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if !self.command.is_empty() {
            svc.command = self.command.clone();
        }
        Ok(())
    }
}

/// Replace the entrypoint
pub struct Entrypoint {
    service: String,
    entrypoint: Vec<String>,
}

impl Entrypoint {
    pub fn new<I, S>(service: impl Into<String>, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            entrypoint: strings(entrypoint),
        }
    }
}

impl Helper for Entrypoint {
    fn name(&self) -> &'static str {
        "Entrypoint"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if !self.entrypoint.is_empty() {
            svc.entrypoint = self.entrypoint.clone();
        }
        Ok(())
    }
}

// ============================================================================
// Service-level collections (additive)
// ============================================================================

/// Add environment variables; `None` declares a variable without a value
///
/// A variable the service already declares keeps its value.
pub struct Environment {
    service: String,
    vars: Vec<(String, Option<String>)>,
}

impl Environment {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            vars: Vec::new(),
        }
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((name.into(), Some(value.into())));
        self
    }

    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.vars.push((name.into(), None));
        self
    }
}

impl Helper for Environment {
    fn name(&self) -> &'static str {
        "Environment"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        for (name, value) in &self.vars {
            svc.environment
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(())
    }
}

/// Merge container labels
pub struct Labels {
    service: String,
    labels: BTreeMap<String, String>,
    custom: bool,
}

impl Labels {
    pub fn new<I, K, V>(service: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            service: service.into(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            custom: false,
        }
    }

    /// Target the installer bookkeeping labels instead of the rendered ones
    pub fn custom<I, K, V>(service: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            custom: true,
            ..Self::new(service, labels)
        }
    }
}

impl Helper for Labels {
    fn name(&self) -> &'static str {
        if self.custom {
            "CustomLabels"
        } else {
            "Labels"
        }
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let custom = self.custom;
        let svc = service_mut(project, self.name(), &self.service)?;
        let target = if custom {
            &mut svc.custom_labels
        } else {
            &mut svc.labels
        };
        for (k, v) in &self.labels {
            target.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

/// Add DependsOn edges; existing edges to the same service are kept
pub struct DependsOn {
    service: String,
    edges: Vec<(String, Dependency)>,
}

impl DependsOn {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            edges: Vec::new(),
        }
    }

    /// Depend on `target` becoming healthy
    pub fn on(self, target: impl Into<String>) -> Self {
        self.on_condition(target, Condition::Healthy)
    }

    pub fn on_condition(mut self, target: impl Into<String>, condition: Condition) -> Self {
        self.edges.push((target.into(), Dependency::new(condition)));
        self
    }
}

impl Helper for DependsOn {
    fn name(&self) -> &'static str {
        "DependsOn"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        for (target, dependency) in &self.edges {
            svc.depends_on
                .entry(target.clone())
                .or_insert(*dependency);
        }
        Ok(())
    }
}

/// Add profiles the service belongs to
pub struct Profiles {
    service: String,
    profiles: Vec<String>,
}

impl Profiles {
    pub fn new<I, S>(service: impl Into<String>, profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            profiles: strings(profiles),
        }
    }
}

impl Helper for Profiles {
    fn name(&self) -> &'static str {
        "Profiles"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        push_missing(&mut svc.profiles, &self.profiles);
        Ok(())
    }
}

/// Publish a container port on the host, one mapping per host port
pub struct PublishPort {
    service: String,
    published: u16,
    target: u16,
}

impl PublishPort {
    pub fn new(service: impl Into<String>, published: u16, target: u16) -> Self {
        Self {
            service: service.into(),
            published,
            target,
        }
    }
}

impl Helper for PublishPort {
    fn name(&self) -> &'static str {
        "PublishPort"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        if svc.ports.iter().any(|p| p.published == self.published) {
            return Ok(());
        }
        svc.ports.push(PortMapping {
            target: self.target,
            published: self.published,
            host_ip: None,
            protocol: None,
        });
        Ok(())
    }
}

/// Add security options
pub struct SecurityOpts {
    service: String,
    opts: Vec<String>,
}

impl SecurityOpts {
    pub fn new<I, S>(service: impl Into<String>, opts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            opts: strings(opts),
        }
    }

    pub fn no_new_privileges(service: impl Into<String>) -> Self {
        Self::new(service, ["no-new-privileges:true"])
    }
}

impl Helper for SecurityOpts {
    fn name(&self) -> &'static str {
        "SecurityOpts"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        push_missing(&mut svc.security_opt, &self.opts);
        Ok(())
    }
}

/// Mount the root filesystem read-only
pub struct ReadOnly {
    service: String,
}

impl ReadOnly {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Helper for ReadOnly {
    fn name(&self) -> &'static str {
        "ReadOnly"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        service_mut(project, self.name(), &self.service)?.read_only = true;
        Ok(())
    }
}

/// Mount a tmpfs, one per target path
pub struct TmpFs {
    service: String,
    target: String,
    options: Vec<(String, String)>,
}

impl TmpFs {
    pub fn new(service: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            target: target.into(),
            options: Vec::new(),
        }
    }

    /// Add a mount option; an empty value renders as a bare flag
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    fn render(&self) -> String {
        if self.options.is_empty() {
            return self.target.clone();
        }
        let opts: Vec<String> = self
            .options
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect();
        format!("{}:{}", self.target, opts.join(","))
    }
}

impl Helper for TmpFs {
    fn name(&self) -> &'static str {
        "TmpFs"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let rendered = self.render();
        let target = self.target.clone();
        let svc = service_mut(project, self.name(), &self.service)?;
        let mounted = svc
            .tmpfs
            .iter()
            .any(|m| m.split(':').next() == Some(target.as_str()));
        if !mounted {
            svc.tmpfs.push(rendered);
        }
        Ok(())
    }
}

/// Mount volumes given as `<source>:<target>[:ro]`
///
/// Named volumes are registered on the project. A target that is already
/// mounted is left alone.
pub struct Volumes {
    service: String,
    specs: Vec<String>,
}

impl Volumes {
    pub fn new<I, S>(service: impl Into<String>, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            specs: strings(specs),
        }
    }
}

impl Helper for Volumes {
    fn name(&self) -> &'static str {
        "Volumes"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let mounts = self
            .specs
            .iter()
            .map(|spec| ServiceVolume::parse(spec))
            .collect::<Result<Vec<_>, _>>()?;

        let svc = service_mut(project, self.name(), &self.service)?;
        let mut named = Vec::new();
        for mount in mounts {
            if svc.volumes.iter().any(|v| v.target == mount.target) {
                continue;
            }
            if mount.kind == MountKind::Volume {
                named.push(mount.source.clone());
            }
            svc.volumes.push(mount);
        }

        for volume in named {
            project.volumes.entry(volume).or_insert_with(VolumeSpec::default);
        }
        Ok(())
    }
}

/// Join the service to a project network
pub struct Network {
    service: String,
    network: String,
}

impl Network {
    pub fn new(service: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            network: network.into(),
        }
    }
}

impl Helper for Network {
    fn name(&self) -> &'static str {
        "Network"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        push_missing(&mut svc.networks, std::slice::from_ref(&self.network));
        Ok(())
    }
}

/// A secret file mounted into a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMount {
    pub source: String,
    pub target: Option<String>,
    pub env_file_key: Option<String>,
    pub mode: Option<u32>,
}

impl SecretMount {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
            env_file_key: None,
            mode: None,
        }
    }

    pub fn at(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Announce the mounted path through an environment variable
    pub fn announce_as(mut self, env: impl Into<String>) -> Self {
        self.env_file_key = Some(env.into());
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    fn resolved_target(&self) -> String {
        self.target
            .clone()
            .unwrap_or_else(|| format!("{}/{}", SECRETS_PATH, self.source))
    }
}

/// Reference secrets from a service, one reference per source
pub struct Secrets {
    service: String,
    secrets: Vec<SecretMount>,
}

impl Secrets {
    pub fn new(service: impl Into<String>, secrets: Vec<SecretMount>) -> Self {
        Self {
            service: service.into(),
            secrets,
        }
    }
}

impl Helper for Secrets {
    fn name(&self) -> &'static str {
        "Secrets"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        for secret in &self.secrets {
            if svc.secrets.iter().any(|s| s.source == secret.source) {
                continue;
            }
            let target = secret.resolved_target();
            if let Some(env) = &secret.env_file_key {
                svc.environment.insert(env.clone(), Some(target.clone()));
            }
            svc.secrets.push(ServiceSecret {
                source: secret.source.clone(),
                target,
                uid: None,
                gid: None,
                mode: secret.mode,
            });
        }
        Ok(())
    }
}

/// Own every secret mount of a service as `uid:gid`, clearing file modes
pub struct SecretsPermission {
    service: String,
    uid: Option<String>,
    gid: Option<String>,
}

impl SecretsPermission {
    pub fn new(service: impl Into<String>, uid: Option<&str>, gid: Option<&str>) -> Self {
        Self {
            service: service.into(),
            uid: uid.filter(|u| !u.is_empty()).map(str::to_string),
            gid: gid.filter(|g| !g.is_empty()).map(str::to_string),
        }
    }

    /// Derive ownership from a `uid[:gid]` user string
    pub fn from_user(service: impl Into<String>, user: Option<&str>) -> Self {
        let mut parts = user.unwrap_or_default().splitn(2, ':');
        let uid = parts.next();
        let gid = parts.next();
        Self::new(service, uid, gid)
    }
}

impl Helper for SecretsPermission {
    fn name(&self) -> &'static str {
        "SecretsPermission"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let svc = service_mut(project, self.name(), &self.service)?;
        for secret in svc.secrets.iter_mut() {
            secret.uid = self.uid.clone();
            secret.gid = self.gid.clone();
            secret.mode = None;
        }
        Ok(())
    }
}

/// Attach an extension block to the project, or to one service
pub struct Extension {
    service: Option<String>,
    key: String,
    value: serde_yaml::Value,
}

impl Extension {
    pub fn project(key: impl Into<String>, value: serde_yaml::Value) -> Self {
        Self {
            service: None,
            key: key.into(),
            value,
        }
    }

    pub fn service(
        service: impl Into<String>,
        key: impl Into<String>,
        value: serde_yaml::Value,
    ) -> Self {
        Self {
            service: Some(service.into()),
            key: key.into(),
            value,
        }
    }
}

impl Helper for Extension {
    fn name(&self) -> &'static str {
        "Extension"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let extensions = match &self.service {
            Some(service) => &mut service_mut(project, self.name(), service)?.extensions,
            None => &mut project.extensions,
        };
        extensions.insert(self.key.clone(), self.value.clone());
        Ok(())
    }
}

// ============================================================================
// Project-level helpers
// ============================================================================

/// Declare a service; existing services are left untouched
pub struct AddService {
    service: String,
}

impl AddService {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Helper for AddService {
    fn name(&self) -> &'static str {
        "AddService"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        project.ensure_service(&self.service);
        Ok(())
    }
}

/// Declare a project network named `<project>_<name>`
pub struct ProjectNetwork {
    name: String,
    driver: Option<String>,
}

impl ProjectNetwork {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: None,
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }
}

impl Helper for ProjectNetwork {
    fn name(&self) -> &'static str {
        "ProjectNetwork"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        let full_name = naming::network_name(&project.name, &self.name);
        project
            .networks
            .entry(self.name.clone())
            .or_insert_with(|| NetworkSpec {
                name: Some(full_name),
                driver: self.driver.clone(),
                external: false,
            });
        Ok(())
    }
}

/// Register a project-wide secret and stage its value
///
/// The value is staged into `Project::environment` under the secret's
/// source name; an existing staged value is kept unless `rewrite` is set.
pub struct ProjectSecret {
    source: String,
    value: String,
    rewrite: bool,
}

impl ProjectSecret {
    pub fn new(source: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            value: value.into(),
            rewrite: false,
        }
    }

    pub fn rewrite(mut self) -> Self {
        self.rewrite = true;
        self
    }
}

impl Helper for ProjectSecret {
    fn name(&self) -> &'static str {
        "ProjectSecrets"
    }

    fn apply(&self, project: &mut Project) -> Result<(), ConfigError> {
        project
            .secrets
            .entry(self.source.clone())
            .or_insert_with(|| SecretDescriptor {
                name: Some(self.source.clone()),
                environment: Some(self.source.clone()),
            });

        if self.rewrite || !project.environment.contains_key(&self.source) {
            project
                .environment
                .insert(self.source.clone(), self.value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with(services: &[&str]) -> Project {
        let mut project = Project::new("prod");
        for name in services {
            project.ensure_service(name);
        }
        project
    }

    #[test]
    fn test_missing_service_is_not_found() {
        let mut project = project_with(&[]);
        let err = CapAdd::new("adcm", ["CAP_CHOWN"])
            .apply(&mut project)
            .unwrap_err();
        assert_eq!(err.to_string(), "CapAdd: service \"adcm\" not found");
    }

    #[test]
    fn test_defaulting_helpers_are_idempotent() {
        let mut once = project_with(&["adcm"]);
        let pipeline = Pipeline::new()
            .with(User::new("adcm", "10001", Some("10001")))
            .with(CapAdd::new("adcm", ["CAP_CHOWN", "CAP_SETUID"]))
            .with(ContainerName::new("adcm"));
        pipeline.run(&mut once).unwrap();

        let mut twice = once.clone();
        pipeline.run(&mut twice).unwrap();
        assert_eq!(once, twice);

        let svc = once.service("adcm").unwrap();
        assert_eq!(svc.user.as_deref(), Some("10001:10001"));
        assert_eq!(svc.container_name.as_deref(), Some("prod-adcm"));
    }

    #[test]
    fn test_specific_helper_wins_regardless_of_order() {
        let mut project = project_with(&["postgres"]);
        Pipeline::new()
            .with(User::new("postgres", "999", None))
            .with(User::new("postgres", "10001", Some("10001")))
            .run(&mut project)
            .unwrap();
        assert_eq!(project.service("postgres").unwrap().user.as_deref(), Some("999"));

        let mut project = project_with(&["postgres"]);
        User::new("postgres", "", None).apply(&mut project).unwrap();
        assert_eq!(project.service("postgres").unwrap().user, None);
    }

    #[test]
    fn test_pipeline_stops_at_first_error_without_rollback() {
        let mut project = project_with(&["adcm"]);
        let pipeline = Pipeline::new()
            .with(Image::new("adcm", "adcm:2.6.0"))
            .with(Hostname::new("missing", "x"))
            .with(Image::new("adcm", "never-applied"));

        let err = pipeline.run(&mut project).unwrap_err();
        assert!(matches!(err, ConfigError::ServiceNotFound { helper: "Hostname", .. }));
        assert_eq!(project.service("adcm").unwrap().image, "adcm:2.6.0");
        assert_eq!(pipeline.names(), vec!["Image", "Hostname", "Image"]);
    }

    #[test]
    fn test_secrets_dedupe_and_announce() {
        let mut project = project_with(&["adcm"]);
        let secrets = || {
            Secrets::new(
                "adcm",
                vec![SecretMount::new("adcm-db-pass")
                    .at("/run/adi_secrets/db-pass")
                    .announce_as("DB_PASS_FILE")],
            )
        };
        secrets().apply(&mut project).unwrap();
        secrets().apply(&mut project).unwrap();

        let svc = project.service("adcm").unwrap();
        assert_eq!(svc.secrets.len(), 1);
        assert_eq!(
            svc.environment.get("DB_PASS_FILE"),
            Some(&Some("/run/adi_secrets/db-pass".to_string()))
        );

        let mut project = project_with(&["vault"]);
        Secrets::new("vault", vec![SecretMount::new("vault-config.json")])
            .apply(&mut project)
            .unwrap();
        assert_eq!(
            project.service("vault").unwrap().secrets[0].target,
            "/run/adi_secrets/vault-config.json"
        );
    }

    #[test]
    fn test_secrets_permission_sets_owner_and_clears_mode() {
        let mut project = project_with(&["postgres"]);
        Pipeline::new()
            .with(Secrets::new(
                "postgres",
                vec![SecretMount::new("postgres-password").mode(0o400)],
            ))
            .with(SecretsPermission::from_user("postgres", Some("10001:10002")))
            .run(&mut project)
            .unwrap();

        let secret = &project.service("postgres").unwrap().secrets[0];
        assert_eq!(secret.uid.as_deref(), Some("10001"));
        assert_eq!(secret.gid.as_deref(), Some("10002"));
        assert_eq!(secret.mode, None);
    }

    #[test]
    fn test_project_secret_stages_value() {
        let mut project = project_with(&[]);
        ProjectSecret::new("adcm-db-pass", "first").apply(&mut project).unwrap();
        ProjectSecret::new("adcm-db-pass", "second").apply(&mut project).unwrap();
        assert_eq!(project.environment["adcm-db-pass"], "first");

        ProjectSecret::new("adcm-db-pass", "third")
            .rewrite()
            .apply(&mut project)
            .unwrap();
        assert_eq!(project.environment["adcm-db-pass"], "third");

        let descriptor = &project.secrets["adcm-db-pass"];
        assert_eq!(descriptor.environment.as_deref(), Some("adcm-db-pass"));
    }

    #[test]
    fn test_volumes_register_named_volumes() {
        let mut project = project_with(&["postgres"]);
        let volumes = Volumes::new("postgres", ["prod-postgres:/data", "/srv/backup:/backup"]);
        volumes.apply(&mut project).unwrap();
        volumes.apply(&mut project).unwrap();

        assert_eq!(project.service("postgres").unwrap().volumes.len(), 2);
        assert!(project.volumes.contains_key("prod-postgres"));
        assert!(!project.volumes.contains_key("/srv/backup"));

        let err = Volumes::new("postgres", ["broken"]).apply(&mut project).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVolume { .. }));
    }

    #[test]
    fn test_publish_port_dedupes_by_host_port() {
        let mut project = project_with(&["adcm"]);
        PublishPort::new("adcm", 8000, 8000).apply(&mut project).unwrap();
        PublishPort::new("adcm", 8000, 9000).apply(&mut project).unwrap();
        PublishPort::new("adcm", 8443, 8443).apply(&mut project).unwrap();
        assert_eq!(project.service("adcm").unwrap().ports.len(), 2);
    }

    #[test]
    fn test_environment_keeps_existing_values() {
        let mut project = project_with(&["adcm"]);
        Environment::new("adcm")
            .var("DB_HOST", "db.internal")
            .unset("DEBUG")
            .apply(&mut project)
            .unwrap();
        Environment::new("adcm")
            .var("DB_HOST", "postgres")
            .var("DB_PORT", "5432")
            .var("DEBUG", "1")
            .apply(&mut project)
            .unwrap();

        let env = &project.service("adcm").unwrap().environment;
        assert_eq!(env.len(), 3);
        assert_eq!(env["DB_HOST"].as_deref(), Some("db.internal"));
        assert_eq!(env["DB_PORT"].as_deref(), Some("5432"));
        assert_eq!(env["DEBUG"], None);
    }

    #[test]
    fn test_depends_on_defaults_to_healthy_and_keeps_existing() {
        let mut project = project_with(&["adcm", "postgres"]);
        DependsOn::new("adcm").on("postgres").apply(&mut project).unwrap();
        DependsOn::new("adcm")
            .on_condition("postgres", Condition::Started)
            .apply(&mut project)
            .unwrap();

        let edge = project.service("adcm").unwrap().depends_on["postgres"];
        assert_eq!(edge.condition, Condition::Healthy);
        assert!(edge.required);
    }

    #[test]
    fn test_project_network_and_tmpfs() {
        let mut project = project_with(&["postgres"]);
        Pipeline::new()
            .with(ProjectNetwork::new("default"))
            .with(Network::new("postgres", "default"))
            .with(
                TmpFs::new("postgres", "/var/run/postgresql")
                    .option("size", "65536")
                    .option("U", ""),
            )
            .with(TmpFs::new("postgres", "/var/run/postgresql"))
            .run(&mut project)
            .unwrap();

        assert_eq!(
            project.networks["default"].name.as_deref(),
            Some("prod_default")
        );
        let svc = project.service("postgres").unwrap();
        assert_eq!(svc.networks, vec!["default"]);
        assert_eq!(svc.tmpfs, vec!["/var/run/postgresql:size=65536,U"]);
    }

    #[test]
    fn test_labels_and_extensions() {
        let mut project = project_with(&["consul"]);
        Pipeline::new()
            .with(Labels::new("consul", [("app.adi.io/type", "consul")]))
            .with(Labels::custom("consul", [("app.adi.io", "")]))
            .with(Extension::service(
                "consul",
                "x-note",
                serde_yaml::Value::String("hi".to_string()),
            ))
            .with(Extension::project("x-owner", serde_yaml::Value::Bool(true)))
            .run(&mut project)
            .unwrap();

        let svc = project.service("consul").unwrap();
        assert_eq!(svc.labels["app.adi.io/type"], "consul");
        assert!(svc.custom_labels.contains_key("app.adi.io"));
        assert!(svc.extensions.contains_key("x-note"));
        assert!(project.extensions.contains_key("x-owner"));
    }
}
