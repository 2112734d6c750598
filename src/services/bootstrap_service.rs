//! Bootstrap orchestration
//!
//! One apply run:
//!
//! 1. Stage secrets and host settings, then expand the bootstrap phases
//! 2. Dry run: render the expanded topology and stop, no engine call made
//! 3. Bring the init profile up through the `pause` barrier
//! 4. Create the primary profile
//! 5. Concurrently unseal the secret store and start the primary services,
//!    provisioning databases for their dependents
//! 6. Remove init-phase containers, unless debugging
//!
//! A failed init phase stops the run before anything primary is created.
//! Both branches of step 5 always run to completion and their errors are
//! reported together.

use std::time::Instant;

use colored::Colorize;
use tracing::{debug, info, warn};

use super::provisioning_service::{BringUpReport, Provisioner};
use super::retry::RetryPolicy;
use super::staging;
use super::unseal_service::{SharePersistence, UnsealReport, UnsealWorkflow};
use crate::domain::bootstrap::{self, BootstrapPlan, Phase, INIT_PROFILE, PRIMARY_PROFILE};
use crate::domain::kind;
use crate::domain::topology::Project;
use crate::error::{InstallerError, PhaseError, WorkflowError};
use crate::infrastructure::compose;
use crate::infrastructure::engine::{container_ref, Engine};
use crate::infrastructure::secret_store::{ExecSecretStore, SecretStore};
use crate::secrets::ValueCipher;

/// Flags of one apply run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Render the topology instead of applying it
    pub dry_run: bool,
    /// Keep init-phase containers and turn on init debug output
    pub debug: bool,
    /// Re-initialize the secret store even if shares are persisted
    pub force: bool,
}

/// What an apply run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub plan: BootstrapPlan,
    pub bring_up: BringUpReport,
    pub unseal: Option<UnsealReport>,
    pub torn_down: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Dry run: the expanded topology as the engine would receive it
    Rendered(String),
    Applied(ApplyReport),
}

/// Drives a project through the bootstrap phases
pub struct Orchestrator<'a> {
    engine: &'a dyn Engine,
    shares: &'a dyn SharePersistence,
    cipher: Option<&'a ValueCipher>,
    store: Option<&'a dyn SecretStore>,
    options: ApplyOptions,
    container_policy: RetryPolicy,
    dependency_policy: RetryPolicy,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        engine: &'a dyn Engine,
        shares: &'a dyn SharePersistence,
        cipher: Option<&'a ValueCipher>,
    ) -> Self {
        Self {
            engine,
            shares,
            cipher,
            store: None,
            options: ApplyOptions::default(),
            container_policy: RetryPolicy::CONTAINER,
            dependency_policy: RetryPolicy::DEPENDENCY,
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Talk to the secret store through `store` instead of exec'ing its CLI
    pub fn with_store(mut self, store: &'a dyn SecretStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_policies(mut self, container: RetryPolicy, dependency: RetryPolicy) -> Self {
        self.container_policy = container;
        self.dependency_policy = dependency;
        self
    }

    pub async fn apply(&self, mut project: Project) -> Result<ApplyOutcome, InstallerError> {
        let start = Instant::now();
        project.validate()?;

        let engine_info = if self.options.dry_run {
            None
        } else {
            Some(self.engine.info().await?)
        };
        if let Some(engine_info) = &engine_info {
            debug!("Engine {} on {}", engine_info.version, engine_info.os);
        }

        staging::stage(&mut project, self.cipher, engine_info.as_ref())?;
        let plan = bootstrap::expand(&mut project, self.options.debug)?;

        if self.options.dry_run {
            info!("🔍 Dry run: rendering {} service(s)", project.services.len());
            return Ok(ApplyOutcome::Rendered(compose::render(&project)?));
        }

        if let Some(barrier) = &plan.barrier {
            self.run_init_phase(&project, barrier).await?;
        }

        let result = self.run_primary_phase(&project, &plan).await;

        let torn_down = if !plan.has_init_phase() {
            false
        } else if self.options.debug {
            info!("🐛 Debug mode: keeping init containers");
            false
        } else {
            self.teardown(&project, &plan).await
        };

        let (unseal, bring_up) = result?;
        info!(
            "{} Applied {} in {:.1}s",
            "✅".green(),
            project.name,
            start.elapsed().as_secs_f64()
        );
        Ok(ApplyOutcome::Applied(ApplyReport {
            plan,
            bring_up,
            unseal,
            torn_down,
        }))
    }

    async fn run_init_phase(&self, project: &Project, barrier: &str) -> Result<(), InstallerError> {
        let start = Instant::now();
        info!("{} Running init phase", Phase::Init.emoji());
        let init = project.with_profile(INIT_PROFILE);

        match self.engine.up(&init, &[barrier.to_string()]).await {
            Ok(()) => {
                info!(
                    "{} Init phase finished in {:.1}s",
                    "✅".green(),
                    start.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                warn!("{} Init phase failed", "❌".red());
                Err(PhaseError::new(Phase::Init, e).with_service(barrier).into())
            }
        }
    }

    async fn run_primary_phase(
        &self,
        project: &Project,
        plan: &BootstrapPlan,
    ) -> Result<(Option<UnsealReport>, BringUpReport), InstallerError> {
        let primary = project.with_profile(PRIMARY_PROFILE);
        info!("{} Creating {} service(s)", Phase::Primary.emoji(), primary.services.len());
        self.engine
            .create(&primary)
            .await
            .map_err(|e| PhaseError::new(Phase::Primary, e))?;

        let provisioner = Provisioner::new(self.engine).with_policy(self.dependency_policy);
        let (unseal, bring_up) = tokio::join!(
            self.unseal(&primary),
            provisioner.bring_up(&primary, &plan.primary)
        );

        match (unseal, bring_up) {
            (Ok(unseal), Ok(bring_up)) => Ok((unseal, bring_up)),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(unseal), Err(bring_up)) => Err(WorkflowError {
                errors: vec![unseal, bring_up],
            }
            .into()),
        }
    }

    /// Unseal the project's secret store, if it has one
    async fn unseal(&self, primary: &Project) -> Result<Option<UnsealReport>, InstallerError> {
        let Some(service) = kind::secret_store_service(primary).map(str::to_string) else {
            return Ok(None);
        };

        let exec_store;
        let store: &dyn SecretStore = match self.store {
            Some(store) => store,
            None => {
                exec_store = ExecSecretStore::new(self.engine, container_ref(primary, &service));
                &exec_store
            }
        };

        let report = UnsealWorkflow::new(self.engine, store, self.shares, &primary.name, service)
            .with_cipher(self.cipher)
            .with_force(self.options.force)
            .with_policy(self.container_policy)
            .run()
            .await?;
        Ok(Some(report))
    }

    /// Remove init-phase containers; a failure here is only reported
    async fn teardown(&self, project: &Project, plan: &BootstrapPlan) -> bool {
        let services = plan.init_phase_services();
        info!("{} Removing {}", Phase::Teardown.emoji(), services.join(", "));
        match self.engine.remove(&project.name, &services).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", PhaseError::new(Phase::Teardown, e));
                false
            }
        }
    }
}
