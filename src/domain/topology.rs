//! Deployment topology model
//!
//! The in-memory graph of services, volumes, networks and secrets built by
//! the mutation pipeline and consumed by the bootstrap orchestrator. It
//! serializes to the compose-style rendered topology document.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Key of the extension block holding encrypted secret material
pub const SECRETS_EXTENSION: &str = "x-secrets";

fn is_false(value: &bool) -> bool {
    !*value
}

fn default_true() -> bool {
    true
}

/// A whole deployment: one compose project per namespace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretDescriptor>,

    /// Plaintext secret values staged for container creation. Never rendered.
    #[serde(skip)]
    pub environment: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_yaml::Value>,
}

/// A single container definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(skip)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// `None` means declared but intentionally unset
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, Option<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Installer bookkeeping labels, applied by the engine adapter only
    #[serde(skip)]
    pub custom_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ServiceVolume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<ServiceSecret>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub depends_on: BTreeMap<String, Dependency>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tmpfs: Vec<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,

    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_yaml::Value>,
}

/// Whether a mount source is a host path or a named volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
}

/// A mount in compose long syntax
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVolume {
    #[serde(rename = "type")]
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

impl ServiceVolume {
    /// Parse `<source>:<target>[:ro|rw]`
    ///
    /// Sources that look like filesystem paths become bind mounts,
    /// anything else is a named volume.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidVolume {
            spec: spec.to_string(),
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [source, target] => (*source, *target, None),
            [source, target, mode] => (*source, *target, Some(*mode)),
            _ => return Err(invalid()),
        };

        if source.is_empty() || target.is_empty() || !target.starts_with('/') {
            return Err(invalid());
        }

        let read_only = match mode {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(_) => return Err(invalid()),
        };

        Ok(Self {
            kind: if looks_like_path(source) {
                MountKind::Bind
            } else {
                MountKind::Volume
            },
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}

fn looks_like_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

/// A secret reference mounted as a file inside a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSecret {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Condition a dependent waits for before starting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "service_started")]
    Started,
    #[serde(rename = "service_healthy")]
    Healthy,
    #[serde(rename = "service_completed_successfully")]
    CompletedSuccessfully,
}

impl Condition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Healthy => "healthy",
            Self::CompletedSuccessfully => "completed-successfully",
        }
    }
}

/// A DependsOn edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub condition: Condition,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub restart: bool,
}

impl Dependency {
    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            required: true,
            restart: false,
        }
    }
}

/// Container health probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: Vec<String>,
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub start_period: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl HealthCheck {
    /// A `CMD-SHELL` probe
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            test: vec!["CMD-SHELL".to_string(), command.into()],
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Durations rendered in the compact `1m30s` form the engine accepts
mod duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&compact(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }

    pub fn compact(d: Duration) -> String {
        let secs = d.as_secs();
        let millis = d.subsec_millis();
        if secs == 0 {
            return format!("{millis}ms");
        }

        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        let mut out = String::new();
        if h > 0 {
            out.push_str(&format!("{h}h"));
        }
        if m > 0 {
            out.push_str(&format!("{m}m"));
        }
        if s > 0 || out.is_empty() {
            out.push_str(&format!("{s}s"));
        }
        if millis > 0 {
            out.push_str(&format!("{millis}ms"));
        }
        out
    }
}

/// A published port in compose long syntax
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub target: u16,
    pub published: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Project-level named volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

/// Project-level network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub external: bool,
}

/// Project-level secret; the value is read from the staged environment key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn has_profile(&self, profile: &str) -> bool {
        self.profiles.iter().any(|p| p == profile)
    }

    /// Uid part of `User`, if the service runs as someone other than root
    pub fn non_root_user(&self) -> Option<&str> {
        let user = self.user.as_deref()?;
        let uid = user.split(':').next().unwrap_or_default();
        if uid.is_empty() || uid == "0" || uid == "root" {
            None
        } else {
            Some(user)
        }
    }

    pub fn extension<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        decode_extension(&self.extensions, key)
    }

    pub fn set_extension<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), ConfigError> {
        encode_extension(&mut self.extensions, key, value)
    }
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.get_mut(name)
    }

    /// Get or create an empty service
    pub fn ensure_service(&mut self, name: &str) -> &mut Service {
        self.services
            .entry(name.to_string())
            .or_insert_with(|| Service::new(name))
    }

    /// Remove a service along with every DependsOn edge pointing at it
    pub fn remove_service(&mut self, name: &str) -> Option<Service> {
        let removed = self.services.remove(name)?;
        for svc in self.services.values_mut() {
            svc.depends_on.remove(name);
        }
        Some(removed)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn names_with_profile(&self, profile: &str) -> Vec<String> {
        self.services
            .values()
            .filter(|svc| svc.has_profile(profile))
            .map(|svc| svc.name.clone())
            .collect()
    }

    /// Clone of the project restricted to services carrying `profile`
    pub fn with_profile(&self, profile: &str) -> Project {
        let mut subset = self.clone();
        subset.services.retain(|_, svc| svc.has_profile(profile));
        subset
    }

    /// Check that every DependsOn edge resolves and the graph is acyclic
    pub fn validate(&self) -> Result<(), ConfigError> {
        for svc in self.services.values() {
            for dependency in svc.depends_on.keys() {
                if !self.services.contains_key(dependency) {
                    return Err(ConfigError::UnresolvedDependency {
                        service: svc.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        self.dependency_order().map(|_| ())
    }

    /// Services ordered so that every dependency precedes its dependents
    ///
    /// Ties are broken by name to keep the order deterministic. Edges to
    /// services outside the project are ignored here; `validate` reports them.
    pub fn dependency_order(&self) -> Result<Vec<String>, ConfigError> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (name, svc) in &self.services {
            let deps = svc
                .depends_on
                .keys()
                .filter(|d| self.services.contains_key(*d))
                .count();
            indegree.insert(name, deps);
            for dep in svc.depends_on.keys() {
                dependents.entry(dep).or_default().push(name);
            }
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.services.len());

        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            let mut unlocked = BTreeSet::new();
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        unlocked.insert(*dependent);
                    }
                }
            }
            ready.extend(unlocked);
        }

        if order.len() != self.services.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(ConfigError::DependencyCycle {
                services: stuck.join(", "),
            });
        }

        Ok(order)
    }

    pub fn extension<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        decode_extension(&self.extensions, key)
    }

    pub fn set_extension<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), ConfigError> {
        encode_extension(&mut self.extensions, key, value)
    }

    /// Render the project as a YAML document
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Load a rendered project, restoring service names from map keys
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut project: Project = serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        for (name, svc) in project.services.iter_mut() {
            svc.name = name.clone();
        }
        Ok(project)
    }
}

fn decode_extension<T: DeserializeOwned>(
    extensions: &BTreeMap<String, serde_yaml::Value>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    extensions
        .get(key)
        .map(|value| {
            serde_yaml::from_value(value.clone()).map_err(|e| ConfigError::Parse {
                message: format!("{key}: {e}"),
            })
        })
        .transpose()
}

fn encode_extension<T: Serialize>(
    extensions: &mut BTreeMap<String, serde_yaml::Value>,
    key: &str,
    value: &T,
) -> Result<(), ConfigError> {
    let value = serde_yaml::to_value(value).map_err(|e| ConfigError::Parse {
        message: format!("{key}: {e}"),
    })?;
    extensions.insert(key.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depends(project: &mut Project, svc: &str, on: &str) {
        project
            .ensure_service(svc)
            .depends_on
            .insert(on.to_string(), Dependency::new(Condition::Healthy));
    }

    #[test]
    fn test_volume_parse_named_and_bind() {
        let named = ServiceVolume::parse("pgdata:/data").unwrap();
        assert_eq!(named.kind, MountKind::Volume);
        assert!(!named.read_only);

        let bind = ServiceVolume::parse("/srv/adcm:/adcm/data:ro").unwrap();
        assert_eq!(bind.kind, MountKind::Bind);
        assert!(bind.read_only);

        let relative = ServiceVolume::parse("./conf:/etc/conf").unwrap();
        assert_eq!(relative.kind, MountKind::Bind);
    }

    #[test]
    fn test_volume_parse_rejects_garbage() {
        assert!(ServiceVolume::parse("no-target").is_err());
        assert!(ServiceVolume::parse("a:relative").is_err());
        assert!(ServiceVolume::parse("a:/b:bogus").is_err());
        assert!(ServiceVolume::parse("a:/b:ro:x").is_err());
    }

    #[test]
    fn test_non_root_user() {
        let mut svc = Service::new("pg");
        assert_eq!(svc.non_root_user(), None);
        svc.user = Some("0:0".to_string());
        assert_eq!(svc.non_root_user(), None);
        svc.user = Some("root".to_string());
        assert_eq!(svc.non_root_user(), None);
        svc.user = Some("10001:10001".to_string());
        assert_eq!(svc.non_root_user(), Some("10001:10001"));
    }

    #[test]
    fn test_validate_reports_unresolved_edge() {
        let mut project = Project::new("ns");
        depends(&mut project, "adcm", "postgres");

        let err = project.validate().unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnresolvedDependency {
                service: "adcm".to_string(),
                dependency: "postgres".to_string(),
            }
        );

        project.ensure_service("postgres");
        assert!(project.validate().is_ok());
    }

    #[test]
    fn test_dependency_order() {
        let mut project = Project::new("ns");
        depends(&mut project, "adcm", "postgres");
        depends(&mut project, "vault", "postgres");
        depends(&mut project, "adcm", "vault");
        project.ensure_service("postgres");
        project.ensure_service("consul");

        let order = project.dependency_order().unwrap();
        assert_eq!(order, vec!["consul", "postgres", "vault", "adcm"]);
    }

    #[test]
    fn test_dependency_cycle_detected() {
        let mut project = Project::new("ns");
        depends(&mut project, "a", "b");
        depends(&mut project, "b", "a");
        assert!(matches!(
            project.validate(),
            Err(ConfigError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_remove_service_drops_edges() {
        let mut project = Project::new("ns");
        depends(&mut project, "pause", "init-postgres");
        depends(&mut project, "pause", "chown-postgres");
        project.ensure_service("init-postgres");
        project.ensure_service("chown-postgres");

        assert!(project.remove_service("init-postgres").is_some());
        let pause = project.service("pause").unwrap();
        assert!(!pause.depends_on.contains_key("init-postgres"));
        assert!(pause.depends_on.contains_key("chown-postgres"));
    }

    #[test]
    fn test_with_profile_subset() {
        let mut project = Project::new("ns");
        project.ensure_service("adcm").profiles = vec!["primary".to_string()];
        project.ensure_service("init-postgres").profiles = vec!["init".to_string()];

        let init = project.with_profile("init");
        assert_eq!(init.service_names(), vec!["init-postgres"]);
        assert_eq!(project.names_with_profile("primary"), vec!["adcm"]);
    }

    #[test]
    fn test_yaml_round_trip_keeps_null_env_and_extensions() {
        let mut project = Project::new("ns");
        {
            let svc = project.ensure_service("adcm");
            svc.image = "adcm:2.6.0".to_string();
            svc.environment.insert("DB_HOST".to_string(), Some("postgres".to_string()));
            svc.environment.insert("DEBUG".to_string(), None);
            svc.healthcheck = Some(
                HealthCheck::shell("true")
                    .with_interval(Duration::from_secs(90))
                    .with_retries(3),
            );
        }
        project
            .set_extension(SECRETS_EXTENSION, &BTreeMap::from([("key", "value")]))
            .unwrap();
        project.environment.insert("adcm-db-pass".to_string(), "secret".to_string());

        let raw = project.to_yaml().unwrap();
        assert!(raw.contains("x-secrets"));
        assert!(raw.contains("1m30s"));
        assert!(!raw.contains("adcm-db-pass"));

        let loaded = Project::from_yaml(&raw).unwrap();
        let svc = loaded.service("adcm").unwrap();
        assert_eq!(svc.name, "adcm");
        assert_eq!(svc.environment.get("DEBUG"), Some(&None));
        assert_eq!(
            svc.healthcheck.as_ref().unwrap().interval,
            Some(Duration::from_secs(90))
        );
        assert!(loaded.environment.is_empty());

        let ext: BTreeMap<String, String> = loaded.extension(SECRETS_EXTENSION).unwrap().unwrap();
        assert_eq!(ext.get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_compact_duration() {
        assert_eq!(duration_opt::compact(Duration::from_secs(3)), "3s");
        assert_eq!(duration_opt::compact(Duration::from_secs(3600)), "1h");
        assert_eq!(duration_opt::compact(Duration::from_millis(1500)), "1s500ms");
    }
}
