//! Project assembly from manifests
//!
//! Converts every manifest through the kind registry, runs the combined
//! helper pipeline on an empty project and stores the generated secrets
//! in the services' `x-secrets` blocks.

use std::collections::BTreeSet;
use std::time::Instant;

use colored::Colorize;
use tracing::{debug, info};

use crate::config::conversion::Converted;
use crate::config::manifest::{
    ApplicationSpec, ConsulSpec, Manifest, ObjectMeta, PostgresSpec, VaultSpec,
};
use crate::config::registry::{KindRegistry, API_GROUP, API_VERSION};
use crate::domain::naming;
use crate::domain::topology::Project;
use crate::error::{ConfigError, InstallerError};
use crate::secrets::{store_plain, SecretsBox};

/// Name of the application object `init` creates without a manifest
pub const DEFAULT_APPLICATION: &str = "adcm";

/// Components requested on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Components {
    pub postgres: bool,
    pub vault: bool,
    pub consul: bool,
}

impl Default for Components {
    fn default() -> Self {
        Self {
            postgres: true,
            vault: false,
            consul: false,
        }
    }
}

/// Single `Application` manifest for the requested components
pub fn default_manifests(namespace: &str, components: Components) -> Result<Vec<Manifest>, ConfigError> {
    let spec = ApplicationSpec {
        postgres: components.postgres.then(PostgresSpec::default),
        vault: components.vault.then(VaultSpec::default),
        consul: components.consul.then(ConsulSpec::default),
        ..ApplicationSpec::default()
    };
    let value = serde_yaml::to_value(&spec).map_err(|e| ConfigError::Parse {
        message: e.to_string(),
    })?;

    let mut meta = ObjectMeta::named(DEFAULT_APPLICATION);
    meta.namespace = Some(namespace.to_string());
    Ok(vec![Manifest::new(
        &format!("{API_GROUP}/{API_VERSION}"),
        "Application",
        meta,
        value,
    )])
}

/// Builds a project for one namespace
pub struct ProjectBuilder<'a> {
    registry: &'a KindRegistry,
    namespace: String,
    secrets: Option<&'a SecretsBox>,
}

impl<'a> ProjectBuilder<'a> {
    pub fn new(registry: &'a KindRegistry, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
            secrets: None,
        }
    }

    /// Encrypt generated secrets with `secrets`; without it they are stored as plaintext
    pub fn with_secrets(mut self, secrets: &'a SecretsBox) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn build(&self, manifests: &[Manifest]) -> Result<Project, InstallerError> {
        let start = Instant::now();
        naming::validate_object_name("namespace", &self.namespace)?;
        info!(
            "🔧 Building project {} from {} manifest(s)",
            self.namespace,
            manifests.len()
        );

        let mut seen = BTreeSet::new();
        let mut combined = Converted::default();
        for manifest in manifests {
            let converted = self.registry.convert(manifest, &self.namespace)?;
            for service in &converted.services {
                if !seen.insert(service.clone()) {
                    return Err(ConfigError::DuplicateService {
                        service: service.clone(),
                    }
                    .into());
                }
            }
            debug!(
                "{} {} -> {}",
                manifest.kind,
                manifest.metadata.name,
                converted.services.join(", ")
            );
            combined.services.extend(converted.services);
            combined.pipeline.append(converted.pipeline);
            combined.secrets.extend(converted.secrets);
        }

        let mut project = Project::new(self.namespace.clone());
        debug!("Running {} helper(s)", combined.pipeline.len());
        combined.pipeline.run(&mut project)?;
        project.validate()?;

        match self.secrets {
            Some(secrets_box) => {
                secrets_box.install(&mut project)?;
                for (service, plain) in &combined.secrets {
                    secrets_box.seal_service(&mut project, service, plain)?;
                }
            }
            None => {
                for (service, plain) in &combined.secrets {
                    store_plain(&mut project, service, plain)?;
                }
            }
        }

        info!(
            "{} Built {} service(s) in {:.1}s",
            "✅".green(),
            project.services.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::kind::{DB_PASS_KEY, DB_USER_KEY};
    use crate::domain::topology::SECRETS_EXTENSION;
    use crate::secrets::{sealed_service_block, Identity, SealedKey};

    fn registry() -> KindRegistry {
        KindRegistry::builtin()
    }

    #[test]
    fn test_default_manifests() {
        let manifests = default_manifests(
            "prod",
            Components {
                vault: true,
                ..Components::default()
            },
        )
        .unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].api_version, "app.adi.io/v1alpha1");
        assert_eq!(manifests[0].metadata.namespace.as_deref(), Some("prod"));

        let spec: ApplicationSpec = manifests[0].decode_spec().unwrap();
        assert!(spec.postgres.is_some());
        assert!(spec.vault.is_some());
        assert!(spec.consul.is_none());
    }

    #[test]
    fn test_build_seals_secrets() {
        let identity = Identity::generate();
        let secrets_box = SecretsBox::create(&identity.recipient()).unwrap();
        let registry = registry();

        let manifests = default_manifests("prod", Components::default()).unwrap();
        let project = ProjectBuilder::new(&registry, "prod")
            .with_secrets(&secrets_box)
            .build(&manifests)
            .unwrap();

        assert_eq!(project.name, "prod");
        assert_eq!(project.service_names(), vec!["adcm", "postgres-adcm"]);

        let sealed: SealedKey = project.extension(SECRETS_EXTENSION).unwrap().unwrap();
        assert_eq!(sealed.recipient, identity.recipient().to_string());

        let raw = sealed_service_block(&project, "adcm").unwrap();
        assert_ne!(raw.data[DB_USER_KEY], "adcm");
        let opened = secrets_box.open_service(&project, "adcm").unwrap();
        assert_eq!(opened.data[DB_USER_KEY], "adcm");
        assert_eq!(opened.data[DB_PASS_KEY].len(), crate::secrets::PASSWORD_LENGTH);
    }

    #[test]
    fn test_build_without_crypt_keeps_plaintext() {
        let registry = registry();
        let manifests = default_manifests("prod", Components::default()).unwrap();
        let project = ProjectBuilder::new(&registry, "prod")
            .build(&manifests)
            .unwrap();

        assert!(project
            .extension::<SealedKey>(SECRETS_EXTENSION)
            .unwrap()
            .is_none());
        let block = sealed_service_block(&project, "adcm").unwrap();
        assert_eq!(block.data[DB_USER_KEY], "adcm");
    }

    #[test]
    fn test_duplicate_services_rejected() {
        let registry = registry();
        let mut manifests = default_manifests("prod", Components::default()).unwrap();
        manifests.push(manifests[0].clone());

        let err = ProjectBuilder::new(&registry, "prod")
            .build(&manifests)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            InstallerError::Config(ConfigError::DuplicateService { ref service }) if service == "adcm"
        ));
    }

    #[test]
    fn test_invalid_namespace() {
        let registry = registry();
        let err = ProjectBuilder::new(&registry, "P")
            .build(&[])
            .err()
            .unwrap();
        assert!(matches!(
            err,
            InstallerError::Config(ConfigError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_unresolved_dependency_is_fatal() {
        let registry = registry();
        let manifests = crate::config::parse_manifests(
            r#"
apiVersion: app.adi.io/v1alpha1
kind: ADCM
metadata:
  name: main
  annotations:
    app.adi.io/depends-on: postgres.missing
"#,
        )
        .unwrap();

        let err = ProjectBuilder::new(&registry, "prod")
            .build(&manifests)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            InstallerError::Config(ConfigError::UnresolvedDependency { .. })
        ));
    }
}
