//! Secrets subsystem
//!
//! Two layers: an asymmetric identity/recipient pair wraps a random
//! per-project master key, and every secret value is encrypted with that
//! master key. Decryption always goes through the wrapped key, so rotating
//! the identity only rewrites the project block.

pub mod identity;
pub mod sealed;
pub mod value;

use rand::distributions::Alphanumeric;
use rand::Rng;

pub use identity::{Identity, Recipient};
pub use sealed::{SealedKey, ServiceSecrets};
pub use value::ValueCipher;

use crate::domain::topology::{Project, SECRETS_EXTENSION};
use crate::error::{ConfigError, CryptoError, InstallerError};

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 16;

/// Random alphanumeric password
pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Unwrapped master key bound to a project's sealed block
#[derive(Debug, Clone)]
pub struct SecretsBox {
    sealed: SealedKey,
    cipher: ValueCipher,
}

impl SecretsBox {
    /// New master key sealed to `recipient`
    pub fn create(recipient: &Recipient) -> Result<Self, CryptoError> {
        let (sealed, cipher) = SealedKey::generate(recipient)?;
        Ok(Self { sealed, cipher })
    }

    /// Open the project's sealed block with `identity`
    ///
    /// Returns `None` when the project carries no secrets block.
    pub fn open(project: &Project, identity: &Identity) -> Result<Option<Self>, InstallerError> {
        let Some(sealed) = project.extension::<SealedKey>(SECRETS_EXTENSION)? else {
            return Ok(None);
        };
        let cipher = sealed.open(identity)?;
        Ok(Some(Self { sealed, cipher }))
    }

    pub fn sealed(&self) -> &SealedKey {
        &self.sealed
    }

    pub fn cipher(&self) -> &ValueCipher {
        &self.cipher
    }

    /// Write the sealed block into the project
    pub fn install(&self, project: &mut Project) -> Result<(), ConfigError> {
        project.set_extension(SECRETS_EXTENSION, &self.sealed)
    }

    /// Swap the sealed block for one wrapped to `recipient`
    ///
    /// Service tokens are untouched.
    pub fn rewrap(&self, recipient: &Recipient) -> Result<Self, CryptoError> {
        Ok(Self {
            sealed: SealedKey::wrap(&self.cipher, recipient)?,
            cipher: self.cipher.clone(),
        })
    }

    /// Encrypt plaintext secrets into a service's block, merging by key
    pub fn seal_service(
        &self,
        project: &mut Project,
        service: &str,
        plain: &ServiceSecrets,
    ) -> Result<(), InstallerError> {
        let sealed = plain.seal(&self.cipher)?;
        let svc = project
            .service_mut(service)
            .ok_or_else(|| ConfigError::ServiceNotFound {
                helper: "SealSecrets",
                service: service.to_string(),
            })?;

        let mut block = svc
            .extension::<ServiceSecrets>(SECRETS_EXTENSION)?
            .unwrap_or_default();
        block.data.extend(sealed.data);
        block.un_mapped.extend(sealed.un_mapped);
        svc.set_extension(SECRETS_EXTENSION, &block)?;
        Ok(())
    }

    /// Decrypt a service's block; empty if the service has none
    pub fn open_service(
        &self,
        project: &Project,
        service: &str,
    ) -> Result<ServiceSecrets, InstallerError> {
        let block = sealed_service_block(project, service)?;
        Ok(block.open(&self.cipher)?)
    }
}

/// Raw encrypted block of a service, without decrypting it
pub fn sealed_service_block(project: &Project, service: &str) -> Result<ServiceSecrets, ConfigError> {
    let svc = project
        .service(service)
        .ok_or_else(|| ConfigError::ServiceNotFound {
            helper: "SecretsBlock",
            service: service.to_string(),
        })?;
    Ok(svc
        .extension::<ServiceSecrets>(SECRETS_EXTENSION)?
        .unwrap_or_default())
}

/// Merge plaintext secrets into a service's block, for unencrypted projects
pub fn store_plain(
    project: &mut Project,
    service: &str,
    plain: &ServiceSecrets,
) -> Result<(), ConfigError> {
    let svc = project
        .service_mut(service)
        .ok_or_else(|| ConfigError::ServiceNotFound {
            helper: "PlainSecrets",
            service: service.to_string(),
        })?;
    let mut block = svc
        .extension::<ServiceSecrets>(SECRETS_EXTENSION)?
        .unwrap_or_default();
    block.data.extend(plain.data.clone());
    block.un_mapped.extend(plain.un_mapped.clone());
    svc.set_extension(SECRETS_EXTENSION, &block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(key: &str, value: &str) -> ServiceSecrets {
        let mut secrets = ServiceSecrets::default();
        secrets.data.insert(key.to_string(), value.to_string());
        secrets
    }

    #[test]
    fn test_generate_password() {
        let a = generate_password(PASSWORD_LENGTH);
        assert_eq!(a.len(), PASSWORD_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, generate_password(PASSWORD_LENGTH));
    }

    #[test]
    fn test_secret_survives_render_and_reload() {
        let identity = Identity::generate();
        let secrets = SecretsBox::create(&identity.recipient()).unwrap();

        let mut project = Project::new("prod");
        project.ensure_service("adcm");
        secrets.install(&mut project).unwrap();
        secrets
            .seal_service(&mut project, "adcm", &plain("db-pass", "s3cr3t"))
            .unwrap();

        let rendered = project.to_yaml().unwrap();
        assert!(!rendered.contains("s3cr3t"));
        let reloaded = Project::from_yaml(&rendered).unwrap();

        let reopened = SecretsBox::open(&reloaded, &identity).unwrap().unwrap();
        let opened = reopened.open_service(&reloaded, "adcm").unwrap();
        assert_eq!(opened.data["db-pass"], "s3cr3t");

        let stranger = Identity::generate();
        let err = SecretsBox::open(&reloaded, &stranger).unwrap_err();
        assert!(matches!(
            err,
            InstallerError::Crypto(CryptoError::RecipientMismatch { .. })
        ));
    }

    #[test]
    fn test_seal_service_merges_keys() {
        let identity = Identity::generate();
        let secrets = SecretsBox::create(&identity.recipient()).unwrap();
        let mut project = Project::new("prod");
        project.ensure_service("vault");

        secrets
            .seal_service(&mut project, "vault", &plain("config.json", "{}"))
            .unwrap();
        let mut shares = ServiceSecrets::default();
        shares
            .un_mapped
            .insert("unseal-data".to_string(), "[]".to_string());
        secrets.seal_service(&mut project, "vault", &shares).unwrap();

        let opened = secrets.open_service(&project, "vault").unwrap();
        assert_eq!(opened.data["config.json"], "{}");
        assert_eq!(opened.un_mapped["unseal-data"], "[]");
    }

    #[test]
    fn test_project_without_block() {
        let project = Project::new("prod");
        assert!(SecretsBox::open(&project, &Identity::generate())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rewrap_box() {
        let old = Identity::generate();
        let new = Identity::generate();
        let secrets = SecretsBox::create(&old.recipient()).unwrap();
        let mut project = Project::new("prod");
        project.ensure_service("adcm");
        secrets.install(&mut project).unwrap();
        secrets
            .seal_service(&mut project, "adcm", &plain("db-pass", "s3cr3t"))
            .unwrap();
        let before = sealed_service_block(&project, "adcm").unwrap();

        secrets
            .rewrap(&new.recipient())
            .unwrap()
            .install(&mut project)
            .unwrap();

        assert_eq!(sealed_service_block(&project, "adcm").unwrap(), before);
        let reopened = SecretsBox::open(&project, &new).unwrap().unwrap();
        assert_eq!(
            reopened.open_service(&project, "adcm").unwrap().data["db-pass"],
            "s3cr3t"
        );
    }
}
