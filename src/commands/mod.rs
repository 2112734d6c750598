//! CLI command handlers

pub mod apply;
pub mod down;
pub mod init;
pub mod list;
pub mod secrets;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::config;
use crate::domain::topology::{Project, SECRETS_EXTENSION};
use crate::error::CryptoError;
use crate::secrets::{Identity, SealedKey, SecretsBox};

/// Open the project's secrets with the resolved identity
///
/// `None` when the project was initialized without encryption. A sealed
/// project without an identity is an error, never a plaintext fallback.
pub(crate) fn open_secrets(
    project: &Project,
    identity_env: &str,
    key_file: &Path,
) -> Result<Option<SecretsBox>> {
    if project
        .extension::<SealedKey>(SECRETS_EXTENSION)?
        .is_none()
    {
        warn!("⚠️  {} has no sealed secrets, values are plaintext", project.name);
        return Ok(None);
    }

    let identity = config::resolve_identity(identity_env, key_file)?
        .ok_or(CryptoError::MissingIdentity)
        .with_context(|| {
            format!(
                "Set ${} or provide {}",
                identity_env,
                key_file.display()
            )
        })?;
    let secrets_box = SecretsBox::open(project, &identity)?;
    Ok(secrets_box)
}

/// Identity from `path`, generated and written there when missing
pub(crate) fn load_or_create_identity(path: &Path) -> Result<(Identity, bool)> {
    if path.exists() {
        return Ok((config::read_identity_file(path)?, false));
    }
    let identity = Identity::generate();
    config::write_identity(path, &identity, false)?;
    Ok((identity, true))
}
