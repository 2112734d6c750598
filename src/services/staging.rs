//! Apply-time staging
//!
//! Turns the stored topology into the one handed to the engine: secret
//! values are decrypted and staged into the project environment, mounted
//! where the service kind expects them, and every service is decorated with
//! the host-dependent settings (platform, container name, secret ownership,
//! tmpfs options) that are not kept in the stored file.

use std::collections::BTreeMap;

use reqwest::Url;
use tracing::debug;

use super::provisioning_service::{credentials_for, staged_key, DatabaseCredentials};
use crate::domain::helpers::{
    ContainerName, Entrypoint, Environment, Pipeline, Platform, ProjectSecret, SecretMount,
    Secrets, SecretsPermission, TmpFs,
};
use crate::domain::kind::{
    ManagedKind, CONFIG_JSON_KEY, DEFAULT_PLATFORM, SECRETS_PATH, UNSEAL_DATA_KEY,
    VAULT_DEV_MODE, VAULT_MODE_LABEL,
};
use crate::domain::topology::{Project, SECRETS_EXTENSION};
use crate::error::{ConfigError, InstallerError};
use crate::infrastructure::engine::EngineInfo;
use crate::secrets::{sealed_service_block, SealedKey, ServiceSecrets, ValueCipher};

/// Socket directory of a read-only database container
pub const PG_SOCKET_DIR: &str = "/var/run/postgresql";

/// Pointer to the database URL inside a secret-store config document
const STORAGE_URL_POINTER: &str = "/storage/postgresql/connection_url";

/// Stage secrets and host settings into `project`
///
/// Without a cipher the encrypted tokens of a sealed project are staged as-is,
/// which is what a dry run renders; a project kept in plaintext is staged
/// unchanged. Without engine facts no host-specific adjustment is made.
pub fn stage(
    project: &mut Project,
    cipher: Option<&ValueCipher>,
    engine: Option<&EngineInfo>,
) -> Result<(), InstallerError> {
    if engine.is_some_and(EngineInfo::strips_secret_gid) {
        for svc in project.services.values_mut() {
            if let Some(user) = svc.user.as_mut() {
                if let Some((uid, _)) = user.split_once(':') {
                    *user = uid.to_string();
                }
            }
        }
    }

    let plaintext = cipher.is_some()
        || project
            .extension::<SealedKey>(SECRETS_EXTENSION)?
            .is_none();

    let mut pipeline = Pipeline::new();
    for name in project.service_names() {
        let block = sealed_service_block(project, &name)?;
        let plain = match cipher {
            Some(cipher) => block.open(cipher)?,
            None => block,
        };

        // un-mapped values are only needed after start, never mounted
        for (key, value) in &plain.un_mapped {
            if key != UNSEAL_DATA_KEY {
                project
                    .environment
                    .insert(staged_key(&name, key), value.clone());
            }
        }

        let Some(svc) = project.service(&name).cloned() else {
            continue;
        };
        let kind = ManagedKind::of(&svc);

        let data = match kind {
            Some(ManagedKind::Vault) if plaintext => {
                with_storage_credentials(project, &name, plain.data)?
            }
            _ => plain.data,
        };
        pipeline.append(mount_secrets(&name, kind, &data));

        pipeline.push(ContainerName::new(name.clone()));
        pipeline.push(Platform::new(name.clone(), DEFAULT_PLATFORM));

        match kind {
            Some(ManagedKind::Adcm) => {
                let database = svc.depends_on.keys().find(|dep| {
                    project
                        .service(dep)
                        .and_then(ManagedKind::of)
                        .is_some_and(|k| k.is_database())
                });
                if let Some(database) = database {
                    pipeline.push(
                        Environment::new(name.clone())
                            .var("DB_HOST", database.clone())
                            .var("DB_PORT", ManagedKind::Postgres.default_port().to_string()),
                    );
                }
            }
            Some(ManagedKind::Postgres) if svc.read_only => {
                let mut tmpfs = TmpFs::new(name.clone(), PG_SOCKET_DIR);
                for (key, value) in mount_options(engine, svc.user.as_deref()) {
                    tmpfs = tmpfs.option(key, value);
                }
                pipeline.push(tmpfs.option("size", "65536").option("mode", "1750"));
            }
            Some(ManagedKind::Vault) => {
                let mode = svc.labels.get(VAULT_MODE_LABEL).map(String::as_str);
                if mode.is_some_and(|m| m != VAULT_DEV_MODE) && data.contains_key(CONFIG_JSON_KEY)
                {
                    pipeline.push(Entrypoint::new(
                        name.clone(),
                        [
                            "bao".to_string(),
                            "server".to_string(),
                            format!("-config={}/{}", SECRETS_PATH, CONFIG_JSON_KEY),
                        ],
                    ));
                }
            }
            _ => {}
        }

        pipeline.push(SecretsPermission::from_user(name.clone(), svc.user.as_deref()));
        debug!(
            "Staged {} mounted and {} unmounted secret(s) for {}",
            data.len(),
            plain.un_mapped.len(),
            name
        );
    }

    pipeline.run(project)?;
    Ok(())
}

/// Mount and stage the `data` secrets of one service
fn mount_secrets(
    service: &str,
    kind: Option<ManagedKind>,
    data: &BTreeMap<String, String>,
) -> Pipeline {
    let mut pipeline = Pipeline::new();
    let mut mounts = Vec::new();

    for (key, value) in data {
        let source = staged_key(service, key);
        pipeline.push(ProjectSecret::new(source.clone(), value.clone()).rewrite());

        if !kind.map_or(true, |k| k.mounts_secret(key)) {
            continue;
        }
        let mut mount = SecretMount::new(source).at(format!("{SECRETS_PATH}/{key}"));
        if let Some(env) = kind.and_then(|k| k.secret_file_env(key)) {
            mount = mount.announce_as(env);
        }
        mounts.push(mount);
    }

    if !mounts.is_empty() {
        pipeline.push(Secrets::new(service, mounts));
    }
    pipeline
}

/// Ownership options of a tmpfs mount for `user`
fn mount_options(engine: Option<&EngineInfo>, user: Option<&str>) -> Vec<(String, String)> {
    if engine.is_some_and(EngineInfo::is_podman_host) {
        return vec![("U".to_string(), String::new())];
    }

    let Some(user) = user.filter(|u| !u.is_empty()) else {
        return Vec::new();
    };
    let mut parts = user.splitn(2, ':');
    let mut options = Vec::new();
    if let Some(uid) = parts.next() {
        options.push(("uid".to_string(), uid.to_string()));
    }
    if let Some(gid) = parts.next().filter(|g| !g.is_empty()) {
        options.push(("gid".to_string(), gid.to_string()));
    }
    options
}

/// Rewrite the storage URL of a secret-store config with the store's own
/// database credentials, read from its staged un-mapped values
fn with_storage_credentials(
    project: &Project,
    service: &str,
    mut data: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, InstallerError> {
    let Some(creds) = credentials_for(project, service)? else {
        return Ok(data);
    };
    if let Some(config) = data.get_mut(CONFIG_JSON_KEY) {
        *config = rewrite_storage_url(config, &creds)?;
    }
    Ok(data)
}

/// Set path, user and password of the postgres storage URL in a config document
///
/// A document without a postgres storage section is returned unchanged.
pub fn rewrite_storage_url(
    config: &str,
    creds: &DatabaseCredentials,
) -> Result<String, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        field: CONFIG_JSON_KEY.to_string(),
        value: message,
    };

    let mut doc: serde_json::Value = serde_json::from_str(config).map_err(|e| ConfigError::Parse {
        message: format!("{CONFIG_JSON_KEY}: {e}"),
    })?;
    let Some(slot) = doc.pointer_mut(STORAGE_URL_POINTER) else {
        return Ok(config.to_string());
    };

    let raw = slot
        .as_str()
        .ok_or_else(|| invalid("connection_url is not a string".to_string()))?;
    let mut url = Url::parse(raw).map_err(|e| invalid(format!("connection_url: {e}")))?;
    url.set_path(&creds.name);
    url.set_username(&creds.user)
        .map_err(|_| invalid("connection_url cannot carry a user".to_string()))?;
    url.set_password(Some(&creds.password))
        .map_err(|_| invalid("connection_url cannot carry a password".to_string()))?;
    *slot = serde_json::Value::String(url.to_string());

    serde_json::to_string(&doc).map_err(|e| ConfigError::Parse {
        message: format!("{CONFIG_JSON_KEY}: {e}"),
    })
}

/// Plaintext secrets of every service, keyed by service name
///
/// Services without a secrets block are left out.
pub fn reveal(
    project: &Project,
    cipher: &ValueCipher,
) -> Result<BTreeMap<String, ServiceSecrets>, InstallerError> {
    let mut out = BTreeMap::new();
    for name in project.service_names() {
        let block = sealed_service_block(project, &name)?;
        if block.is_empty() {
            continue;
        }
        out.insert(name, block.open(cipher)?);
    }
    Ok(out)
}
