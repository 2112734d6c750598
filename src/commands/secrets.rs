//! `adi secrets`: identities and project secrets

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use super::{load_or_create_identity, open_secrets};
use crate::config;
use crate::domain::topology::Project;
use crate::secrets::{sealed_service_block, store_plain, Identity, ServiceSecrets};
use crate::services::staging;
use crate::ui;

pub fn new_key(output: &Path, force: bool) -> Result<()> {
    let identity = Identity::generate();
    config::write_identity(output, &identity, force)?;
    ui::print_success(&format!("Wrote {}", output.display()));
    ui::print_rows(&[("Public key", identity.recipient().to_string())]);
    Ok(())
}

pub fn show(file: &Path, service: Option<&str>, identity_env: &str, key_file: &Path) -> Result<()> {
    let project = config::load_project(file)?;
    let revealed = reveal(&project, identity_env, key_file)?;

    let selected: Vec<(&String, &ServiceSecrets)> = match service {
        Some(name) => match revealed.get_key_value(name) {
            Some(entry) => vec![entry],
            None => bail!("{} has no secrets for service {}", file.display(), name),
        },
        None => revealed.iter().collect(),
    };

    for (name, secrets) in selected {
        ui::print_header(name);
        let rows: Vec<(String, String)> = secrets
            .data
            .iter()
            .chain(secrets.un_mapped.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ui::print_rows(&rows);
    }
    Ok(())
}

/// Plaintext secrets of every service in the project
fn reveal(
    project: &Project,
    identity_env: &str,
    key_file: &Path,
) -> Result<BTreeMap<String, ServiceSecrets>> {
    match open_secrets(project, identity_env, key_file)? {
        Some(secrets_box) => Ok(staging::reveal(project, secrets_box.cipher())?),
        None => {
            let mut out = BTreeMap::new();
            for name in project.service_names() {
                let block = sealed_service_block(project, &name)?;
                if !block.is_empty() {
                    out.insert(name, block);
                }
            }
            Ok(out)
        }
    }
}

/// Set one `data` secret of a service, encrypted when the project is sealed
pub fn set(
    file: &Path,
    target: &str,
    value: &str,
    identity_env: &str,
    key_file: &Path,
) -> Result<()> {
    let (service, key) = parse_target(target)?;
    let mut project = config::load_project(file)?;
    if project.service(service).is_none() {
        bail!("Service {} not found in {}", service, file.display());
    }

    let mut plain = ServiceSecrets::default();
    plain.data.insert(key.to_string(), value.to_string());
    match open_secrets(&project, identity_env, key_file)? {
        Some(secrets_box) => secrets_box.seal_service(&mut project, service, &plain)?,
        None => store_plain(&mut project, service, &plain)?,
    }
    config::save_project(file, &project)?;

    ui::print_success(&format!("Set {}.{} in {}", service, key, file.display()));
    Ok(())
}

/// Split `<service>.<key>`; the key itself may contain dots
fn parse_target(target: &str) -> Result<(&str, &str)> {
    match target.split_once('.') {
        Some((service, key)) if !service.is_empty() && !key.is_empty() => Ok((service, key)),
        _ => bail!("Invalid key format: {} (expected <service>.<key>)", target),
    }
}

/// Re-wrap the master key for the identity in `new_key_file`
///
/// Only the project's sealed block changes; service tokens stay valid.
pub fn rotate_key(file: &Path, new_key_file: &Path, identity_env: &str, key_file: &Path) -> Result<()> {
    let mut project = config::load_project(file)?;
    let secrets_box = open_secrets(&project, identity_env, key_file)?
        .with_context(|| format!("{} was initialized without encryption", file.display()))?;

    let (new_identity, created) = load_or_create_identity(new_key_file)?;
    if created {
        info!("🔑 Generated identity {}", new_key_file.display());
    }
    let rotated = secrets_box.rewrap(&new_identity.recipient())?;
    rotated.install(&mut project)?;
    config::save_project(file, &project)?;

    ui::print_success(&format!("Rotated master key of {}", project.name));
    ui::print_rows(&[("Recipient", new_identity.recipient().to_string())]);
    Ok(())
}
