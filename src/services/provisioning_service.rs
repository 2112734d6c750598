//! Dependent-database provisioning and primary-phase bring-up
//!
//! Services without any dependency are started first. Every other service is
//! started afterwards in dependency order; one that depends on a managed
//! database is held back until its role and database exist. A failure only
//! holds back that service and whatever depends on it; services already
//! started keep running.

use std::collections::BTreeSet;
use std::time::Instant;

use colored::Colorize;
use tracing::{debug, info, warn};

use super::retry::{poll, RetryPolicy};
use crate::domain::bootstrap::Phase;
use crate::domain::kind::{ManagedKind, DB_NAME_KEY, DB_PASS_KEY, DB_USER_KEY};
use crate::domain::topology::Project;
use crate::error::{ConfigError, InstallerError, WorkflowError};
use crate::infrastructure::engine::{container_ref, Engine};
use crate::infrastructure::postgres::PgAdmin;

/// Database credentials of one dependent service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub name: String,
    pub user: String,
    pub password: String,
}

/// Key under which a service's secret is staged in the project environment
pub fn staged_key(service: &str, key: &str) -> String {
    format!("{service}-{key}")
}

/// Read a service's database credentials from the staged environment
///
/// `None` when the service stages no database credentials at all; an error
/// when only some of them are present.
pub fn credentials_for(
    project: &Project,
    service: &str,
) -> Result<Option<DatabaseCredentials>, ConfigError> {
    let lookup = |key: &str| project.environment.get(&staged_key(service, key)).cloned();
    let (name, user, password) = (
        lookup(DB_NAME_KEY),
        lookup(DB_USER_KEY),
        lookup(DB_PASS_KEY),
    );

    match (name, user, password) {
        (None, None, None) => Ok(None),
        (Some(name), Some(user), Some(password)) => Ok(Some(DatabaseCredentials {
            name,
            user,
            password,
        })),
        (name, user, _) => {
            let missing = if name.is_none() {
                DB_NAME_KEY
            } else if user.is_none() {
                DB_USER_KEY
            } else {
                DB_PASS_KEY
            };
            Err(ConfigError::MissingField {
                field: staged_key(service, missing),
            })
        }
    }
}

/// Managed databases `service` depends on
fn database_dependencies(project: &Project, service: &str) -> Vec<String> {
    project
        .service(service)
        .map(|svc| {
            svc.depends_on
                .keys()
                .filter(|dep| {
                    project
                        .service(dep)
                        .and_then(ManagedKind::of)
                        .is_some_and(|kind| kind.is_database())
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Outcome of a bring-up run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BringUpReport {
    pub started: Vec<String>,
    pub provisioned: Vec<String>,
    pub skipped: Vec<String>,
}

/// Starts the primary phase, provisioning databases for dependents
pub struct Provisioner<'a> {
    engine: &'a dyn Engine,
    policy: RetryPolicy,
}

impl<'a> Provisioner<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self {
            engine,
            policy: RetryPolicy::DEPENDENCY,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start `services` of an already created project
    pub async fn bring_up(
        &self,
        project: &Project,
        services: &[String],
    ) -> Result<BringUpReport, InstallerError> {
        let wanted: BTreeSet<&str> = services.iter().map(String::as_str).collect();
        let order: Vec<String> = project
            .dependency_order()?
            .into_iter()
            .filter(|name| wanted.contains(name.as_str()))
            .collect();

        let (pending, independent): (Vec<String>, Vec<String>) = order
            .into_iter()
            .partition(|name| {
                project
                    .service(name)
                    .is_some_and(|svc| !svc.depends_on.is_empty())
            });

        let mut report = BringUpReport::default();
        if !independent.is_empty() {
            info!("{} Starting {}", Phase::Primary.emoji(), independent.join(", "));
            self.engine
                .start(&project.name, &independent)
                .await
                .map_err(|e| InstallerError::from(e).in_phase(Phase::Primary, &independent.join(",")))?;
            report.started.extend(independent);
        }

        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut errors = Vec::new();

        for name in pending {
            let blocked_by = project
                .service(&name)
                .and_then(|svc| svc.depends_on.keys().find(|dep| failed.contains(*dep)).cloned());
            if let Some(dep) = blocked_by {
                warn!("Skipping {}: dependency {} failed", name, dep);
                failed.insert(name.clone());
                report.skipped.push(name);
                continue;
            }

            let start = Instant::now();
            match self.provision_and_start(project, &name).await {
                Ok(provisioned) => {
                    info!(
                        "{} {} started in {:.1}s",
                        "✅".green(),
                        name,
                        start.elapsed().as_secs_f64()
                    );
                    if provisioned {
                        report.provisioned.push(name.clone());
                    }
                    report.started.push(name);
                }
                Err(e) => {
                    warn!("{} {} failed: {}", "❌".red(), name, e);
                    failed.insert(name.clone());
                    report.skipped.push(name);
                    errors.push(Err(e));
                }
            }
        }

        WorkflowError::combine(errors)?;
        Ok(report)
    }

    /// Create role and database on every database dependency, then start
    async fn provision_and_start(
        &self,
        project: &Project,
        service: &str,
    ) -> Result<bool, InstallerError> {
        let credentials = credentials_for(project, service)?;
        let databases = database_dependencies(project, service);

        for db in &databases {
            self.wait_ready(project, db).await?;

            let Some(creds) = &credentials else {
                debug!("{} stages no database credentials, nothing to provision", service);
                continue;
            };

            info!(
                "{} Provisioning role '{}' and database '{}' on {}",
                Phase::Provision.emoji(),
                creds.user,
                creds.name,
                db
            );
            let admin = PgAdmin::new(self.engine, container_ref(project, db));
            admin
                .ensure_role(&creds.user, &creds.password)
                .await
                .map_err(|e| e.in_phase(Phase::Provision, service))?;
            admin
                .ensure_database(&creds.name, &creds.user)
                .await
                .map_err(|e| e.in_phase(Phase::Provision, service))?;
        }

        self.engine
            .start(&project.name, &[service.to_string()])
            .await
            .map_err(|e| InstallerError::from(e).in_phase(Phase::Primary, service))?;
        Ok(credentials.is_some() && !databases.is_empty())
    }

    async fn wait_ready(&self, project: &Project, service: &str) -> Result<(), InstallerError> {
        let operation = format!("{service} to be ready");
        poll(
            self.policy,
            &operation,
            || async {
                let instances = self.engine.list(false).await?;
                Ok(instances
                    .into_iter()
                    .any(|i| i.project == project.name && i.service == service && i.is_ready()))
            },
            |ready| *ready,
        )
        .await
        .map(|_| ())
    }
}
