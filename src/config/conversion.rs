//! Manifest to topology conversion
//!
//! Every converter turns one manifest into helpers for the target project,
//! plus the plaintext secrets its services need. Nothing is applied here.

use serde_json::json;

use super::manifest::{
    AdcmSpec, ApplicationSpec, ConsulSpec, DatabaseSpec, Manifest, ObjectMeta, ObjectRef,
    PostgresSpec, VaultSpec, DATABASE_ANNOTATION, DEPENDS_ON_ANNOTATION, NETWORK_ANNOTATION,
};
use crate::domain::helpers::{
    AddService, CapAdd, CapDrop, Command, ContainerName, DependsOn, Environment, HealthProbe,
    Hostname, Image, Labels, Network, Pipeline, ProjectNetwork, PublishPort, ReadOnly,
    RestartPolicy, User, Volumes,
};
use crate::domain::kind::{
    ManagedKind, CONFIG_JSON_KEY, DB_NAME_KEY, DB_PASS_KEY, DB_USER_KEY, PASSWORD_KEY,
    TYPE_LABEL, VAULT_DEV_MODE, VAULT_MODE_LABEL,
};
use crate::domain::naming;
use crate::domain::topology::Condition;
use crate::error::ConfigError;
use crate::secrets::{generate_password, ServiceSecrets, PASSWORD_LENGTH};

/// Network every managed service joins
pub const DEFAULT_NETWORK: &str = "default";

const VAULT_MODES: [&str; 3] = ["non-ha", "ha", VAULT_DEV_MODE];

/// Helpers and plaintext secrets produced by one manifest
#[derive(Default)]
pub struct Converted {
    pub services: Vec<String>,
    pub pipeline: Pipeline,
    pub secrets: Vec<(String, ServiceSecrets)>,
}

impl Converted {
    fn merge(&mut self, other: Converted) {
        self.services.extend(other.services);
        self.pipeline.append(other.pipeline);
        self.secrets.extend(other.secrets);
    }
}

fn image(kind: ManagedKind, image: Option<&str>, tag: Option<&str>) -> String {
    let default = kind.default_image();
    match image {
        Some(image) => format!("{}:{}", image, tag.unwrap_or(&default.tag)),
        None => match tag {
            Some(tag) => {
                let mut pinned = default;
                pinned.tag = tag.to_string();
                pinned.to_string()
            }
            None => default.to_string(),
        },
    }
}

/// Service declaration shared by every kind
///
/// Returns the service key, its container name and the base helpers.
fn component(
    kind: ManagedKind,
    meta: &ObjectMeta,
    namespace: &str,
    image_ref: String,
) -> Result<(String, String, Pipeline), ConfigError> {
    let service = naming::service_name(kind.name(), &meta.name);
    let container = naming::container_name(namespace, kind.name(), &meta.name);

    let mut pipeline = Pipeline::new()
        .with(AddService::new(service.clone()))
        .with(Image::new(service.clone(), image_ref))
        .with(Labels::new(service.clone(), [(TYPE_LABEL, kind.name())]))
        .with(ContainerName::new(service.clone()).with_name(container.clone()))
        .with(Hostname::new(service.clone(), container.clone()))
        .with(CapDrop::all(service.clone()))
        .with(RestartPolicy::unless_stopped(service.clone()))
        .with(ProjectNetwork::new(DEFAULT_NETWORK))
        .with(Network::new(service.clone(), DEFAULT_NETWORK));

    if let Some(network) = meta.annotation(NETWORK_ANNOTATION) {
        pipeline.push(ProjectNetwork::new(network));
        pipeline.push(Network::new(service.clone(), network));
    }
    if let Some(check) = kind.health_check() {
        pipeline.push(HealthProbe::new(service.clone(), check));
    }

    let dependencies = meta.dependencies()?;
    if !dependencies.is_empty() {
        let mut depends = DependsOn::new(service.clone());
        for dep in &dependencies {
            let condition = if dep.kind.health_check().is_some() {
                Condition::Healthy
            } else {
                Condition::Started
            };
            depends = depends.on_condition(dep.service_name(), condition);
        }
        pipeline.push(depends);
    }

    Ok((service, container, pipeline))
}

fn managed_database(meta: &ObjectMeta) -> Result<Option<ObjectRef>, ConfigError> {
    Ok(meta
        .dependencies()?
        .into_iter()
        .find(|dep| dep.kind.is_database()))
}

fn required_host(db: &DatabaseSpec, kind: ManagedKind, meta: &ObjectMeta) -> Result<String, ConfigError> {
    db.host.clone().ok_or_else(|| ConfigError::MissingField {
        field: format!("{} {}: spec.database.host", kind, meta.name),
    })
}

/// Database credentials of a dependent, falling back to generated ones
fn database_secrets(
    db: &DatabaseSpec,
    meta: &ObjectMeta,
    default_name: String,
    default_user: String,
) -> ServiceSecrets {
    let mut secrets = ServiceSecrets::default();
    let name = meta
        .annotation(DATABASE_ANNOTATION)
        .map(str::to_string)
        .or_else(|| db.name.clone())
        .unwrap_or(default_name);
    secrets.data.insert(DB_NAME_KEY.to_string(), name);
    secrets.data.insert(
        DB_USER_KEY.to_string(),
        db.user.clone().unwrap_or(default_user),
    );
    secrets.data.insert(
        DB_PASS_KEY.to_string(),
        db.password
            .clone()
            .unwrap_or_else(|| generate_password(PASSWORD_LENGTH)),
    );
    secrets
}

pub fn convert_adcm(
    meta: &ObjectMeta,
    spec: &AdcmSpec,
    namespace: &str,
) -> Result<Converted, ConfigError> {
    let kind = ManagedKind::Adcm;
    let (service, container, mut pipeline) = component(
        kind,
        meta,
        namespace,
        image(kind, spec.image.as_deref(), spec.tag.as_deref()),
    )?;

    let data_path = kind.data_mount_path().unwrap_or("/adcm/data");
    let volume = spec.volume.clone().unwrap_or_else(|| container.clone());
    pipeline.push(CapAdd::new(
        service.clone(),
        ["CAP_CHOWN", "CAP_SETUID", "CAP_SETGID"],
    ));
    pipeline.push(Volumes::new(service.clone(), [format!("{volume}:{data_path}")]));
    pipeline.push(PublishPort::new(
        service.clone(),
        spec.publish_port.unwrap_or(kind.default_port()),
        kind.default_port(),
    ));
    if let Some(url) = &spec.url {
        pipeline.push(Environment::new(service.clone()).var("DEFAULT_ADCM_URL", url.clone()));
    }

    if managed_database(meta)?.is_none() {
        let host = required_host(&spec.database, kind, meta)?;
        let port = spec
            .database
            .port
            .unwrap_or(ManagedKind::Postgres.default_port());
        pipeline.push(
            Environment::new(service.clone())
                .var("DB_HOST", host)
                .var("DB_PORT", port.to_string()),
        );
    }

    let secrets = database_secrets(
        &spec.database,
        meta,
        format!("{}_{}", namespace, meta.name).replace('-', "_"),
        meta.name.clone(),
    );
    Ok(Converted {
        services: vec![service.clone()],
        pipeline,
        secrets: vec![(service, secrets)],
    })
}

pub fn convert_postgres(
    meta: &ObjectMeta,
    spec: &PostgresSpec,
    namespace: &str,
) -> Result<Converted, ConfigError> {
    let kind = ManagedKind::Postgres;
    let (service, container, mut pipeline) = component(
        kind,
        meta,
        namespace,
        image(kind, spec.image.as_deref(), spec.tag.as_deref()),
    )?;

    let data_path = kind.data_mount_path().unwrap_or("/data");
    let volume = spec.volume.clone().unwrap_or(container);
    pipeline.push(Volumes::new(service.clone(), [format!("{volume}:{data_path}")]));
    if let Some(port) = spec.publish_port {
        pipeline.push(PublishPort::new(service.clone(), port, kind.default_port()));
    }
    if let Some(user) = &spec.user {
        let (uid, gid) = match user.split_once(':') {
            Some((uid, gid)) => (uid, Some(gid)),
            None => (user.as_str(), None),
        };
        pipeline.push(User::new(service.clone(), uid, gid));
    }
    if spec.read_only {
        pipeline.push(ReadOnly::new(service.clone()));
    }

    let mut secrets = ServiceSecrets::default();
    secrets.data.insert(
        PASSWORD_KEY.to_string(),
        spec.password
            .clone()
            .unwrap_or_else(|| generate_password(PASSWORD_LENGTH)),
    );
    Ok(Converted {
        services: vec![service.clone()],
        pipeline,
        secrets: vec![(service, secrets)],
    })
}

/// Server configuration for a config-file deployment with postgres storage
///
/// Credentials are filled in when the project is applied.
fn vault_config(host: &str, port: u16, ha: bool) -> String {
    let mut storage = json!({
        "connection_url": format!("postgres://{host}:{port}?sslmode=disable"),
    });
    if ha {
        storage["ha_enabled"] = json!(true);
    }
    json!({
        "listener": [{"tcp": {"address": "0.0.0.0:8200", "tls_disable": true}}],
        "storage": {"postgresql": storage},
    })
    .to_string()
}

pub fn convert_vault(
    meta: &ObjectMeta,
    spec: &VaultSpec,
    namespace: &str,
) -> Result<Converted, ConfigError> {
    let kind = ManagedKind::Vault;
    if !VAULT_MODES.contains(&spec.mode.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: format!("{} {}: spec.mode", kind, meta.name),
            value: spec.mode.clone(),
        });
    }

    let (service, _, mut pipeline) = component(
        kind,
        meta,
        namespace,
        image(kind, spec.image.as_deref(), spec.tag.as_deref()),
    )?;
    pipeline.push(Labels::new(
        service.clone(),
        [(VAULT_MODE_LABEL, spec.mode.as_str())],
    ));
    pipeline.push(PublishPort::new(
        service.clone(),
        spec.publish_port.unwrap_or(kind.default_port()),
        kind.default_port(),
    ));
    if spec.ui {
        pipeline.push(Environment::new(service.clone()).var("BAO_UI", "true"));
    }

    let mut converted = Converted {
        services: vec![service.clone()],
        ..Converted::default()
    };

    if spec.mode == VAULT_DEV_MODE {
        pipeline.push(
            Environment::new(service.clone())
                .var("BAO_DEV_ROOT_TOKEN_ID", generate_password(PASSWORD_LENGTH))
                .var("BAO_DEV_LISTEN_ADDRESS", "0.0.0.0:8200"),
        );
        converted.pipeline = pipeline;
        return Ok(converted);
    }

    pipeline.push(Environment::new(service.clone()).var("BAO_ADDR", "http://127.0.0.1:8200/"));

    let (host, port) = match managed_database(meta)? {
        Some(db) => (db.service_name(), ManagedKind::Postgres.default_port()),
        None => (
            required_host(&spec.database, kind, meta)?,
            spec.database
                .port
                .unwrap_or(ManagedKind::Postgres.default_port()),
        ),
    };

    let credentials = database_secrets(&spec.database, meta, "vault".to_string(), "vault".to_string());
    let mut secrets = ServiceSecrets::default();
    secrets.un_mapped = credentials.data;
    secrets.data.insert(
        CONFIG_JSON_KEY.to_string(),
        vault_config(&host, port, spec.mode == "ha"),
    );

    converted.pipeline = pipeline;
    converted.secrets.push((service, secrets));
    Ok(converted)
}

pub fn convert_consul(
    meta: &ObjectMeta,
    spec: &ConsulSpec,
    namespace: &str,
) -> Result<Converted, ConfigError> {
    let kind = ManagedKind::Consul;
    let (service, container, mut pipeline) = component(
        kind,
        meta,
        namespace,
        image(kind, spec.image.as_deref(), spec.tag.as_deref()),
    )?;

    let data_path = kind.data_mount_path().unwrap_or("/consul/data");
    let volume = spec.volume.clone().unwrap_or(container);
    pipeline.push(Command::new(
        service.clone(),
        ["agent", "-dev", "-bind=0.0.0.0"],
    ));
    pipeline.push(Volumes::new(service.clone(), [format!("{volume}:{data_path}")]));
    pipeline.push(PublishPort::new(
        service.clone(),
        spec.publish_port.unwrap_or(kind.default_port()),
        kind.default_port(),
    ));

    Ok(Converted {
        services: vec![service],
        pipeline,
        secrets: Vec::new(),
    })
}

/// Component metadata inside an application: same name, wired to the
/// application's database
fn component_meta(app: &ObjectMeta, database: Option<&str>) -> ObjectMeta {
    let mut meta = app.clone();
    meta.annotations.remove(DEPENDS_ON_ANNOTATION);
    if let Some(database) = database {
        meta.annotations
            .insert(DEPENDS_ON_ANNOTATION.to_string(), database.to_string());
    }
    meta
}

pub fn convert_application(
    meta: &ObjectMeta,
    spec: &ApplicationSpec,
    namespace: &str,
) -> Result<Converted, ConfigError> {
    let database = spec
        .postgres
        .as_ref()
        .map(|_| format!("{}.{}", ManagedKind::Postgres.name(), meta.name));
    let wired = component_meta(meta, database.as_deref());

    let mut converted = convert_adcm(&wired, &spec.adcm, namespace)?;
    if let Some(postgres) = &spec.postgres {
        let mut pg_meta = component_meta(meta, None);
        pg_meta.annotations.remove(DATABASE_ANNOTATION);
        converted.merge(convert_postgres(&pg_meta, postgres, namespace)?);
    }
    if let Some(vault) = &spec.vault {
        let mut vault_meta = wired.clone();
        vault_meta.annotations.remove(DATABASE_ANNOTATION);
        converted.merge(convert_vault(&vault_meta, vault, namespace)?);
    }
    if let Some(consul) = &spec.consul {
        converted.merge(convert_consul(&component_meta(meta, None), consul, namespace)?);
    }
    Ok(converted)
}

// Registry entry points: decode the spec, then convert

pub fn application(manifest: &Manifest, namespace: &str) -> Result<Converted, ConfigError> {
    convert_application(&manifest.metadata, &manifest.decode_spec()?, namespace)
}

pub fn adcm(manifest: &Manifest, namespace: &str) -> Result<Converted, ConfigError> {
    convert_adcm(&manifest.metadata, &manifest.decode_spec()?, namespace)
}

pub fn postgres(manifest: &Manifest, namespace: &str) -> Result<Converted, ConfigError> {
    convert_postgres(&manifest.metadata, &manifest.decode_spec()?, namespace)
}

pub fn vault(manifest: &Manifest, namespace: &str) -> Result<Converted, ConfigError> {
    convert_vault(&manifest.metadata, &manifest.decode_spec()?, namespace)
}

pub fn consul(manifest: &Manifest, namespace: &str) -> Result<Converted, ConfigError> {
    convert_consul(&manifest.metadata, &manifest.decode_spec()?, namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::Project;

    fn apply(converted: &Converted) -> Project {
        let mut project = Project::new("prod");
        converted.pipeline.run(&mut project).unwrap();
        project
    }

    #[test]
    fn test_application_wires_database() {
        let converted =
            convert_application(&ObjectMeta::named("adcm"), &ApplicationSpec::default(), "prod")
                .unwrap();
        assert_eq!(converted.services, vec!["adcm", "postgres-adcm"]);

        let project = apply(&converted);
        let adcm = project.service("adcm").unwrap();
        assert_eq!(adcm.container_name.as_deref(), Some("prod-adcm"));
        assert_eq!(
            adcm.depends_on["postgres-adcm"].condition,
            Condition::Healthy
        );
        assert!(!adcm.environment.contains_key("DB_HOST"));
        assert_eq!(adcm.image, "hub.arenadata.io/adcm/adcm:2.6.0");
        assert_eq!(adcm.cap_drop, vec!["ALL"]);
        assert_eq!(adcm.volumes[0].target, "/adcm/data");
        assert!(project.volumes.contains_key("prod-adcm"));

        let pg = project.service("postgres-adcm").unwrap();
        assert_eq!(pg.container_name.as_deref(), Some("prod-postgres-adcm"));
        assert!(pg.healthcheck.is_some());
        assert!(project.networks.contains_key(DEFAULT_NETWORK));

        let (_, adcm_secrets) = &converted.secrets[0];
        assert_eq!(adcm_secrets.data[DB_NAME_KEY], "prod_adcm");
        assert_eq!(adcm_secrets.data[DB_USER_KEY], "adcm");
        assert_eq!(adcm_secrets.data[DB_PASS_KEY].len(), PASSWORD_LENGTH);
        let (_, pg_secrets) = &converted.secrets[1];
        assert_eq!(pg_secrets.data[PASSWORD_KEY].len(), PASSWORD_LENGTH);
    }

    #[test]
    fn test_default_database_name_is_namespaced() {
        let converted = convert_application(
            &ObjectMeta::named("adcm-main"),
            &ApplicationSpec::default(),
            "dev-1",
        )
        .unwrap();
        let name = &converted.secrets[0].1.data[DB_NAME_KEY];
        assert_eq!(name, "dev_1_adcm_main");
        assert!(crate::infrastructure::postgres::validate_pg_identifier(name, "db-name").is_ok());
    }

    #[test]
    fn test_standalone_adcm_requires_database_host() {
        let err = convert_adcm(&ObjectMeta::named("main"), &AdcmSpec::default(), "prod")
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingField { .. }));

        let spec = AdcmSpec {
            database: DatabaseSpec {
                host: Some("db.example.com".to_string()),
                port: Some(6432),
                name: Some("adcm".to_string()),
                ..DatabaseSpec::default()
            },
            ..AdcmSpec::default()
        };
        let converted = convert_adcm(&ObjectMeta::named("main"), &spec, "prod").unwrap();
        let project = apply(&converted);
        let adcm = project.service("adcm-main").unwrap();
        assert_eq!(adcm.environment["DB_HOST"].as_deref(), Some("db.example.com"));
        assert_eq!(adcm.environment["DB_PORT"].as_deref(), Some("6432"));
    }

    #[test]
    fn test_database_annotation_overrides_name() {
        let mut meta = ObjectMeta::named("main");
        meta.annotations
            .insert(DEPENDS_ON_ANNOTATION.to_string(), "postgres.main".to_string());
        meta.annotations
            .insert(DATABASE_ANNOTATION.to_string(), "adcm_prod".to_string());
        let converted = convert_adcm(&meta, &AdcmSpec::default(), "prod").unwrap();
        assert_eq!(converted.secrets[0].1.data[DB_NAME_KEY], "adcm_prod");
    }

    #[test]
    fn test_vault_config_mode() {
        let mut meta = ObjectMeta::named("adcm");
        meta.annotations
            .insert(DEPENDS_ON_ANNOTATION.to_string(), "postgres.adcm".to_string());
        let spec = VaultSpec {
            mode: "ha".to_string(),
            ..VaultSpec::default()
        };
        let converted = convert_vault(&meta, &spec, "prod").unwrap();
        let (service, secrets) = &converted.secrets[0];
        assert_eq!(service, "vault-adcm");
        assert_eq!(secrets.un_mapped[DB_NAME_KEY], "vault");

        let config: serde_json::Value =
            serde_json::from_str(&secrets.data[CONFIG_JSON_KEY]).unwrap();
        assert_eq!(
            config["storage"]["postgresql"]["connection_url"],
            "postgres://postgres-adcm:5432?sslmode=disable"
        );
        assert_eq!(config["storage"]["postgresql"]["ha_enabled"], true);

        let mut project = Project::new("prod");
        project.ensure_service("postgres-adcm");
        converted.pipeline.run(&mut project).unwrap();
        let vault = project.service("vault-adcm").unwrap();
        assert_eq!(vault.labels[VAULT_MODE_LABEL], "ha");
        assert_eq!(
            vault.environment["BAO_ADDR"].as_deref(),
            Some("http://127.0.0.1:8200/")
        );
    }

    #[test]
    fn test_vault_dev_mode_has_no_secrets() {
        let spec = VaultSpec {
            mode: "dev".to_string(),
            ..VaultSpec::default()
        };
        let converted = convert_vault(&ObjectMeta::named("dev"), &spec, "prod").unwrap();
        assert!(converted.secrets.is_empty());

        let bad = VaultSpec {
            mode: "cluster".to_string(),
            ..VaultSpec::default()
        };
        assert!(matches!(
            convert_vault(&ObjectMeta::named("dev"), &bad, "prod"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_image_override() {
        assert_eq!(
            image(ManagedKind::Postgres, None, Some("v17.0.0")),
            "hub.arenadata.io/adcm/postgres:v17.0.0"
        );
        assert_eq!(
            image(ManagedKind::Consul, Some("consul"), Some("1.20")),
            "consul:1.20"
        );
    }
}
