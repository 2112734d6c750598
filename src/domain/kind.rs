//! Managed service kinds
//!
//! The closed set of service types the installer knows how to deploy.
//! Per-kind behavior (init phase, health probe, secret wiring) hangs off
//! this enum instead of label lookups spread through orchestration code.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::topology::{HealthCheck, Project, Service};
use crate::error::ConfigError;

/// Label prefix for installer-managed objects
pub const APP_LABEL: &str = "app.adi.io";

/// Label carrying the managed kind of a service
pub const TYPE_LABEL: &str = "app.adi.io/type";

/// Deploy mode of a secret store; anything but `dev` runs from a config file
pub const VAULT_MODE_LABEL: &str = "app.adi.io/vault-mode";

pub const VAULT_DEV_MODE: &str = "dev";

/// Default container platform
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// Directory secrets are mounted into
pub const SECRETS_PATH: &str = "/run/adi_secrets";

/// Image used for synthetic helper containers
pub const BUSYBOX_IMAGE: &str = "busybox:stable-uclibc";

/// Secret keys holding database credentials
pub const DB_NAME_KEY: &str = "db-name";
pub const DB_USER_KEY: &str = "db-user";
pub const DB_PASS_KEY: &str = "db-pass";

/// Superuser password of a managed database
pub const PASSWORD_KEY: &str = "password";

/// Secret-store server configuration document
pub const CONFIG_JSON_KEY: &str = "config.json";

/// Persisted unseal shares inside the un-mapped secrets block
pub const UNSEAL_DATA_KEY: &str = "unseal-data";

/// A fully qualified image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(registry: Option<&str>, name: &str, tag: &str) -> Self {
        Self {
            registry: registry.map(str::to_string),
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        // digests are pinned with '@'
        let sep = if self.tag.starts_with("sha") { '@' } else { ':' };
        write!(f, "{}{}{}", self.name, sep, self.tag)
    }
}

/// Kinds of services the installer manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManagedKind {
    /// Cluster manager application server
    Adcm,
    /// PostgreSQL database
    Postgres,
    /// OpenBao secret store
    Vault,
    /// Consul service-discovery agent
    Consul,
}

impl ManagedKind {
    pub const ALL: [ManagedKind; 4] = [Self::Adcm, Self::Postgres, Self::Vault, Self::Consul];

    /// Kind of a service, read from its type label
    pub fn of(service: &Service) -> Option<Self> {
        service
            .labels
            .get(TYPE_LABEL)
            .and_then(|label| label.parse().ok())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Adcm => "adcm",
            Self::Postgres => "postgres",
            Self::Vault => "vault",
            Self::Consul => "consul",
        }
    }

    pub fn default_image(&self) -> ImageRef {
        match self {
            Self::Adcm => ImageRef::new(Some("hub.arenadata.io"), "adcm/adcm", "2.6.0"),
            Self::Postgres => ImageRef::new(Some("hub.arenadata.io"), "adcm/postgres", "v16.3.1"),
            Self::Vault => ImageRef::new(None, "openbao/openbao", "2.2.0"),
            Self::Consul => ImageRef::new(Some("hub.arenadata.io"), "adcm/consul", "v0.0.0"),
        }
    }

    /// Port the service listens on inside the container
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Adcm => 8000,
            Self::Postgres => 5432,
            Self::Vault => 8200,
            Self::Consul => 8500,
        }
    }

    /// Where persistent data is mounted, if the kind keeps any
    pub fn data_mount_path(&self) -> Option<&'static str> {
        match self {
            Self::Adcm => Some("/adcm/data"),
            Self::Postgres => Some("/data"),
            Self::Vault => None,
            Self::Consul => Some("/consul/data"),
        }
    }

    /// Whether a first-run `init-<service>` companion is required
    pub fn needs_init_phase(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    pub fn init_command(&self) -> Vec<String> {
        match self {
            Self::Postgres => vec!["initdb".to_string()],
            _ => Vec::new(),
        }
    }

    /// Extra environment for the init companion
    pub fn init_environment(&self, debug: bool) -> Vec<(String, String)> {
        match self {
            Self::Postgres => {
                let mut env = vec![("POSTGRES_SHUTDOWN_MODE".to_string(), "smart".to_string())];
                if debug {
                    env.push(("PG_ENTRYPOINT_LOG_DEBUG".to_string(), "true".to_string()));
                }
                env
            }
            _ => Vec::new(),
        }
    }

    pub fn health_check(&self) -> Option<HealthCheck> {
        match self {
            Self::Postgres => Some(
                HealthCheck::shell("pg_isready --quiet")
                    .with_interval(Duration::from_secs(10))
                    .with_timeout(Duration::from_secs(3))
                    .with_retries(3),
            ),
            Self::Vault => Some(
                HealthCheck::shell("wget -q -O - http://127.0.0.1:8200/v1/sys/health")
                    .with_interval(Duration::from_secs(3))
                    .with_timeout(Duration::from_secs(5))
                    .with_retries(5),
            ),
            Self::Adcm | Self::Consul => None,
        }
    }

    /// Databases get roles and databases created for their dependents
    pub fn is_database(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Secret stores go through the unseal workflow
    pub fn is_secret_store(&self) -> bool {
        matches!(self, Self::Vault)
    }

    /// Environment variable a mounted secret file is announced through
    pub fn secret_file_env(&self, key: &str) -> Option<&'static str> {
        match (self, key) {
            (Self::Adcm, DB_NAME_KEY) => Some("DB_NAME_FILE"),
            (Self::Adcm, DB_USER_KEY) => Some("DB_USER_FILE"),
            (Self::Adcm, DB_PASS_KEY) => Some("DB_PASS_FILE"),
            (Self::Postgres, PASSWORD_KEY) => Some("POSTGRES_PASSWORD_FILE"),
            _ => None,
        }
    }

    /// Whether secrets under `key` are mounted into the service itself
    ///
    /// Everything else is only staged for post-start provisioning.
    pub fn mounts_secret(&self, key: &str) -> bool {
        match self {
            Self::Adcm => matches!(key, DB_NAME_KEY | DB_USER_KEY | DB_PASS_KEY),
            Self::Postgres => key == PASSWORD_KEY,
            Self::Vault => key == CONFIG_JSON_KEY,
            Self::Consul => false,
        }
    }
}

/// First service of the project that goes through the unseal workflow
pub fn secret_store_service(project: &Project) -> Option<&str> {
    project
        .services
        .values()
        .find(|svc| ManagedKind::of(svc).is_some_and(|k| k.is_secret_store()))
        .map(|svc| svc.name.as_str())
}

impl FromStr for ManagedKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adcm" => Ok(Self::Adcm),
            "postgres" | "adpg" => Ok(Self::Postgres),
            "vault" | "openbao" => Ok(Self::Vault),
            "consul" => Ok(Self::Consul),
            _ => Err(ConfigError::InvalidValue {
                field: "kind".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str() {
        assert_eq!("ADCM".parse::<ManagedKind>(), Ok(ManagedKind::Adcm));
        assert_eq!("adpg".parse::<ManagedKind>(), Ok(ManagedKind::Postgres));
        assert_eq!("openbao".parse::<ManagedKind>(), Ok(ManagedKind::Vault));
        assert_eq!(
            "redis".parse::<ManagedKind>(),
            Err(ConfigError::InvalidValue {
                field: "kind".to_string(),
                value: "redis".to_string()
            })
        );
    }

    #[test]
    fn test_kind_of_service() {
        let mut svc = Service::new("db");
        assert_eq!(ManagedKind::of(&svc), None);
        svc.labels
            .insert(TYPE_LABEL.to_string(), "postgres".to_string());
        assert_eq!(ManagedKind::of(&svc), Some(ManagedKind::Postgres));
    }

    #[test]
    fn test_secret_store_lookup() {
        let mut project = Project::new("prod");
        project.ensure_service("adcm");
        assert_eq!(secret_store_service(&project), None);

        project
            .ensure_service("vault-main")
            .labels
            .insert(TYPE_LABEL.to_string(), "vault".to_string());
        assert_eq!(secret_store_service(&project), Some("vault-main"));
    }

    #[test]
    fn test_only_database_needs_init() {
        for kind in ManagedKind::ALL {
            assert_eq!(kind.needs_init_phase(), kind == ManagedKind::Postgres);
            assert_eq!(kind.needs_init_phase(), !kind.init_command().is_empty());
        }
    }

    #[test]
    fn test_postgres_health_check() {
        let hc = ManagedKind::Postgres.health_check().unwrap();
        assert_eq!(hc.test, vec!["CMD-SHELL", "pg_isready --quiet"]);
        assert_eq!(hc.interval, Some(Duration::from_secs(10)));
        assert_eq!(hc.retries, Some(3));
        assert!(ManagedKind::Adcm.health_check().is_none());
    }

    #[test]
    fn test_init_environment_debug() {
        let quiet = ManagedKind::Postgres.init_environment(false);
        let debug = ManagedKind::Postgres.init_environment(true);
        assert_eq!(quiet.len(), 1);
        assert!(debug.iter().any(|(k, v)| k == "PG_ENTRYPOINT_LOG_DEBUG" && v == "true"));
    }

    #[test]
    fn test_image_ref_display() {
        assert_eq!(
            ManagedKind::Adcm.default_image().to_string(),
            "hub.arenadata.io/adcm/adcm:2.6.0"
        );
        let pinned = ImageRef::new(None, "busybox", "sha256:abcd");
        assert_eq!(pinned.to_string(), "busybox@sha256:abcd");
    }
}
