//! # Installer files
//!
//! ## Files
//!
//! 1. **Rendered topology** (`adi.yaml`)
//!    - Compose-style project, the durable artifact of `init`
//!    - Carries the sealed master key and per-service secret tokens under `x-secrets`
//!
//! 2. **Identity key** (`age.key`)
//!    - Comment lines, then the secret key line
//!    - Can be replaced by the `ADI_AGE_KEY` environment variable
//!
//! 3. **Manifests**
//!    - Multi-document YAML decoded through the kind registry

pub mod conversion;
pub mod manifest;
pub mod registry;

pub use manifest::{parse_manifests, Manifest, ObjectMeta};
pub use registry::{GroupVersionKind, KindRegistry};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::domain::kind::{self, UNSEAL_DATA_KEY};
use crate::domain::topology::{Project, SECRETS_EXTENSION};
use crate::error::{ConfigError, InstallerError};
use crate::secrets::{Identity, ServiceSecrets};
use crate::services::unseal_service::SharePersistence;

pub const DEFAULT_TOPOLOGY_FILE: &str = "adi.yaml";
pub const DEFAULT_KEY_FILE: &str = "age.key";

/// Environment variable holding the identity, checked before the key file
pub const IDENTITY_ENV: &str = "ADI_AGE_KEY";

const RENDERED_FILE_MODE: u32 = 0o600;
const KEY_FILE_MODE: u32 = 0o400;

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Load a rendered topology
pub fn load_project(path: &Path) -> Result<Project> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Project::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write a rendered topology, readable by the owner only
pub fn save_project(path: &Path, project: &Project) -> Result<()> {
    let content = project.to_yaml()?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    set_mode(path, RENDERED_FILE_MODE)
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// Load every manifest document from a file
pub fn load_manifests(path: &Path) -> Result<Vec<Manifest>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let manifests =
        parse_manifests(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    if manifests.is_empty() {
        bail!("{} contains no manifests", path.display());
    }
    Ok(manifests)
}

/// Write a fresh identity to `path`
///
/// Refuses to replace an existing key unless `force` is set, since a lost
/// identity makes every project sealed to it unreadable.
pub fn write_identity(path: &Path, identity: &Identity, force: bool) -> Result<()> {
    if path.exists() {
        if !force {
            bail!(
                "{} already exists; use --force to overwrite it",
                path.display()
            );
        }
        // the previous key was written read-only
        set_mode(path, RENDERED_FILE_MODE)
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    let content = format!(
        "# created: {}\n# public key: {}\n{}\n",
        chrono::Utc::now().to_rfc3339(),
        identity.recipient(),
        identity.to_secret_string()
    );
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    set_mode(path, KEY_FILE_MODE)
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Read the identity from a key file, skipping comments and blank lines
pub fn read_identity_file(path: &Path) -> Result<Identity> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| anyhow!("{} contains no identity", path.display()))?;
    Identity::parse(line).with_context(|| format!("Invalid identity in {}", path.display()))
}

/// Resolve the identity: environment variable first, then the key file
///
/// Returns `None` when neither is present.
pub fn resolve_identity(env_var: &str, key_file: &Path) -> Result<Option<Identity>> {
    if let Ok(raw) = std::env::var(env_var) {
        if !raw.trim().is_empty() {
            debug!("Using identity from ${}", env_var);
            let identity =
                Identity::parse(&raw).with_context(|| format!("Invalid identity in ${env_var}"))?;
            return Ok(Some(identity));
        }
    }
    if key_file.exists() {
        return read_identity_file(key_file).map(Some);
    }
    Ok(None)
}

/// Unseal shares persisted in the rendered topology file
///
/// Stored under `services.<service>.x-secrets.un-mapped.unseal-data`.
pub struct RenderedFileShares {
    path: PathBuf,
    service: String,
}

impl RenderedFileShares {
    pub fn new(path: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            service: service.into(),
        }
    }

    /// Shares for the project's secret store, if it has one
    pub fn for_project(path: impl Into<PathBuf>, project: &Project) -> Option<Self> {
        kind::secret_store_service(project).map(|service| Self::new(path, service))
    }

    fn io_error(&self, e: impl ToString) -> ConfigError {
        ConfigError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        }
    }

    fn read(&self) -> Result<Project, ConfigError> {
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        Project::from_yaml(&content)
    }

    fn block(&self, project: &Project) -> Result<ServiceSecrets, ConfigError> {
        let svc = project
            .service(&self.service)
            .ok_or_else(|| ConfigError::ServiceNotFound {
                helper: "UnsealShares",
                service: self.service.clone(),
            })?;
        Ok(svc
            .extension::<ServiceSecrets>(SECRETS_EXTENSION)?
            .unwrap_or_default())
    }
}

impl SharePersistence for RenderedFileShares {
    fn load(&self) -> Result<Option<String>, InstallerError> {
        let project = self.read()?;
        Ok(self.block(&project)?.un_mapped.get(UNSEAL_DATA_KEY).cloned())
    }

    fn save(&self, data: &str) -> Result<(), InstallerError> {
        let mut project = self.read()?;
        let mut block = self.block(&project)?;
        block
            .un_mapped
            .insert(UNSEAL_DATA_KEY.to_string(), data.to_string());
        if let Some(svc) = project.service_mut(&self.service) {
            svc.set_extension(SECRETS_EXTENSION, &block)?;
        }

        fs::write(&self.path, project.to_yaml()?).map_err(|e| self.io_error(e))?;
        set_mode(&self.path, RENDERED_FILE_MODE).map_err(|e| self.io_error(e))?;
        debug!("Persisted unseal data for {} to {}", self.service, self.path.display());
        Ok(())
    }
}
