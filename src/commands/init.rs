//! `adi init`: build a project and write the rendered topology

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Result};
use tracing::info;

use super::load_or_create_identity;
use crate::config::{self, KindRegistry};
use crate::secrets::SecretsBox;
use crate::services::{default_manifests, Components, ProjectBuilder};
use crate::ui;

pub struct InitArgs {
    pub namespace: String,
    pub output: PathBuf,
    pub age_key_file: PathBuf,
    pub no_crypt: bool,
    pub components: Components,
    pub from_manifest: Option<PathBuf>,
    pub force: bool,
}

pub fn execute(registry: &KindRegistry, args: InitArgs) -> Result<()> {
    let start = Instant::now();
    if args.output.exists() && !args.force {
        bail!(
            "{} already exists; use --force to overwrite it",
            args.output.display()
        );
    }

    let manifests = match &args.from_manifest {
        Some(path) => {
            info!("📄 Loading manifests from {}", path.display());
            config::load_manifests(path)?
        }
        None => default_manifests(&args.namespace, args.components)?,
    };

    let builder = ProjectBuilder::new(registry, args.namespace.clone());
    let (project, recipient) = if args.no_crypt {
        (builder.build(&manifests)?, None)
    } else {
        let (identity, created) = load_or_create_identity(&args.age_key_file)?;
        if created {
            info!("🔑 Generated identity {}", args.age_key_file.display());
        }
        let secrets_box = SecretsBox::create(&identity.recipient())?;
        let project = builder.with_secrets(&secrets_box).build(&manifests)?;
        (project, Some(identity.recipient().to_string()))
    };

    config::save_project(&args.output, &project)?;

    ui::print_success(&format!(
        "Initialized {} in {:.1}s",
        project.name,
        start.elapsed().as_secs_f64()
    ));
    let rows = vec![
        ("Topology", args.output.display().to_string()),
        ("Services", project.service_names().join(", ")),
        ("Recipient", recipient.unwrap_or_else(|| "none (plaintext)".to_string())),
    ];
    ui::print_rows(&rows);
    if args.no_crypt {
        ui::print_warning("Secrets are stored unencrypted");
    }
    print_next_step(&args.output);
    Ok(())
}

fn print_next_step(output: &Path) {
    ui::print_info(&format!("Next: adi apply -f {}", output.display()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::SECRETS_EXTENSION;
    use crate::secrets::SealedKey;
    use tempfile::TempDir;

    fn args(dir: &TempDir) -> InitArgs {
        InitArgs {
            namespace: "prod".to_string(),
            output: dir.path().join("adi.yaml"),
            age_key_file: dir.path().join("age.key"),
            no_crypt: false,
            components: Components::default(),
            from_manifest: None,
            force: false,
        }
    }

    #[test]
    fn test_init_writes_topology_and_key() {
        let dir = TempDir::new().unwrap();
        let registry = KindRegistry::builtin();
        execute(&registry, args(&dir)).unwrap();

        let identity = config::read_identity_file(&dir.path().join("age.key")).unwrap();
        let project = config::load_project(&dir.path().join("adi.yaml")).unwrap();
        let sealed: SealedKey = project.extension(SECRETS_EXTENSION).unwrap().unwrap();
        assert_eq!(sealed.recipient, identity.recipient().to_string());
        assert!(project.service("postgres-adcm").is_some());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let registry = KindRegistry::builtin();
        execute(&registry, args(&dir)).unwrap();
        assert!(execute(&registry, args(&dir)).is_err());

        let forced = InitArgs {
            force: true,
            ..args(&dir)
        };
        execute(&registry, forced).unwrap();
    }

    #[test]
    fn test_init_without_crypt_writes_no_key() {
        let dir = TempDir::new().unwrap();
        let registry = KindRegistry::builtin();
        let plain = InitArgs {
            no_crypt: true,
            ..args(&dir)
        };
        execute(&registry, plain).unwrap();
        assert!(!dir.path().join("age.key").exists());
    }
}
