//! Bootstrap phases
//!
//! Expands a topology with the synthetic services the orchestrator needs
//! before the user-declared stack can start:
//!
//! 1. `chown-<svc>` fixes volume ownership for services running as non-root
//! 2. `init-<svc>` runs first-run initialization for kinds that need it
//! 3. `pause` is a barrier depending on every init-phase service
//!
//! Everything here is pure topology manipulation; nothing talks to the engine.

use std::fmt;

use super::helpers::{Command, DependsOn, Environment, Labels, Pipeline, Profiles};
use super::kind::{ManagedKind, APP_LABEL, BUSYBOX_IMAGE};
use super::topology::{Condition, Dependency, Project, Service};
use crate::error::ConfigError;

pub const CHOWN_PROFILE: &str = "chown";
pub const INIT_PROFILE: &str = "init";
pub const PRIMARY_PROFILE: &str = "primary";

/// Name of the barrier service
pub const PAUSE_SERVICE: &str = "pause";

/// Bookkeeping label naming the phase a synthetic service belongs to
pub const PHASE_LABEL: &str = "app.adi.io/phase";

/// Phases of a bootstrap run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Volume ownership fix-up
    Chown,
    /// First-run initialization
    Init,
    /// Waiting on the init barrier
    Barrier,
    /// User-declared services
    Primary,
    /// Database roles for dependents
    Provision,
    /// Secret-store initialization and unseal
    Unseal,
    /// Removal of init-phase containers
    Teardown,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chown => "chown",
            Self::Init => "init",
            Self::Barrier => "barrier",
            Self::Primary => "primary",
            Self::Provision => "provision",
            Self::Unseal => "unseal",
            Self::Teardown => "teardown",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Chown => "🔑",
            Self::Init => "🧱",
            Self::Barrier => "⏸️",
            Self::Primary => "🚀",
            Self::Provision => "🗃️",
            Self::Unseal => "🔓",
            Self::Teardown => "🧹",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Services of each phase after expansion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapPlan {
    pub chown: Vec<String>,
    pub init: Vec<String>,
    pub barrier: Option<String>,
    pub primary: Vec<String>,
}

impl BootstrapPlan {
    pub fn has_init_phase(&self) -> bool {
        self.barrier.is_some()
    }

    /// Every synthetic service, in phase order
    pub fn init_phase_services(&self) -> Vec<String> {
        self.chown
            .iter()
            .chain(self.init.iter())
            .chain(self.barrier.iter())
            .cloned()
            .collect()
    }
}

pub fn chown_name(service: &str) -> String {
    format!("chown-{service}")
}

pub fn init_name(service: &str) -> String {
    format!("init-{service}")
}

/// Root companion that chowns the mount targets of `svc` to its user
///
/// Only services running as non-root with at least one volume get one.
pub fn chown_service(svc: &Service) -> Option<Service> {
    let user = svc.non_root_user()?;
    if svc.volumes.is_empty() {
        return None;
    }

    let targets: Vec<&str> = svc.volumes.iter().map(|v| v.target.as_str()).collect();
    let mut chown = Service::new(chown_name(&svc.name));
    chown.image = BUSYBOX_IMAGE.to_string();
    chown.user = Some("0:0".to_string());
    chown.entrypoint = vec!["/bin/sh".to_string()];
    chown.command = vec![
        "-cex".to_string(),
        format!("chown -v {} {}", user, targets.join(" ")),
    ];
    chown.volumes = svc.volumes.clone();
    chown.platform = svc.platform.clone();
    chown.profiles = vec![CHOWN_PROFILE.to_string(), INIT_PROFILE.to_string()];
    chown
        .custom_labels
        .insert(PHASE_LABEL.to_string(), Phase::Chown.name().to_string());
    Some(chown)
}

/// Init companion sharing image, user, volumes, secrets and environment
pub fn init_service(svc: &Service) -> Service {
    let mut init = Service::new(init_name(&svc.name));
    init.image = svc.image.clone();
    init.user = svc.user.clone();
    init.volumes = svc.volumes.clone();
    init.secrets = svc.secrets.clone();
    init.environment = svc.environment.clone();
    init.platform = svc.platform.clone();
    init.cap_add = svc.cap_add.clone();
    init.cap_drop = svc.cap_drop.clone();
    init.security_opt = svc.security_opt.clone();
    init.networks = svc.networks.clone();
    init.tmpfs = svc.tmpfs.clone();
    init.read_only = svc.read_only;
    init.profiles = vec![INIT_PROFILE.to_string()];
    init.custom_labels
        .insert(PHASE_LABEL.to_string(), Phase::Init.name().to_string());
    init
}

fn barrier_template() -> Service {
    let mut pause = Service::new(PAUSE_SERVICE);
    pause.image = BUSYBOX_IMAGE.to_string();
    pause.command = vec!["sleep".to_string(), "120".to_string()];
    pause.stop_signal = Some("SIGKILL".to_string());
    pause.profiles = vec![INIT_PROFILE.to_string()];
    pause
        .custom_labels
        .insert(PHASE_LABEL.to_string(), Phase::Barrier.name().to_string());
    pause
}

/// Point the barrier at every init-phase service
///
/// Creates `pause` when needed and removes it once no init-phase service
/// is left. Returns the barrier name if one exists afterwards.
pub fn rebuild_barrier(project: &mut Project) -> Option<String> {
    let waits_for: Vec<String> = project
        .services
        .values()
        .filter(|svc| svc.name != PAUSE_SERVICE && svc.has_profile(INIT_PROFILE))
        .map(|svc| svc.name.clone())
        .collect();

    if waits_for.is_empty() {
        project.remove_service(PAUSE_SERVICE);
        return None;
    }

    let pause = project
        .services
        .entry(PAUSE_SERVICE.to_string())
        .or_insert_with(barrier_template);
    pause.depends_on = waits_for
        .into_iter()
        .map(|name| (name, Dependency::new(Condition::CompletedSuccessfully)))
        .collect();
    Some(PAUSE_SERVICE.to_string())
}

/// Expand the project with chown, init and barrier services
///
/// Every service present before expansion becomes part of the primary
/// phase. Running the expansion twice yields the same topology.
pub fn expand(project: &mut Project, debug: bool) -> Result<BootstrapPlan, ConfigError> {
    let primary: Vec<String> = project
        .services
        .values()
        .filter(|svc| {
            svc.name != PAUSE_SERVICE
                && !svc.has_profile(INIT_PROFILE)
                && !svc.custom_labels.contains_key(PHASE_LABEL)
        })
        .map(|svc| svc.name.clone())
        .collect();

    let mut plan = BootstrapPlan {
        primary: primary.clone(),
        ..BootstrapPlan::default()
    };
    let mut pipeline = Pipeline::new();

    for name in &primary {
        pipeline.push(Profiles::new(name.clone(), [PRIMARY_PROFILE]));
        pipeline.push(Labels::custom(name.clone(), [(APP_LABEL, "")]));

        let Some(svc) = project.service(name).cloned() else {
            continue;
        };

        let chown = chown_service(&svc);
        if let Some(chown) = &chown {
            plan.chown.push(chown.name.clone());
            project
                .services
                .entry(chown.name.clone())
                .or_insert_with(|| chown.clone());
        }

        let Some(kind) = ManagedKind::of(&svc).filter(ManagedKind::needs_init_phase) else {
            continue;
        };

        let init_name = init_name(name);
        plan.init.push(init_name.clone());
        project
            .services
            .entry(init_name.clone())
            .or_insert_with(|| init_service(&svc));

        pipeline.push(Command::new(init_name.clone(), kind.init_command()));
        let mut env = Environment::new(init_name.clone());
        for (key, value) in kind.init_environment(debug) {
            env = env.var(key, value);
        }
        pipeline.push(env);
        if let Some(chown) = chown {
            pipeline.push(
                DependsOn::new(init_name).on_condition(chown.name, Condition::CompletedSuccessfully),
            );
        }
    }

    pipeline.run(project)?;
    plan.barrier = rebuild_barrier(project);
    project.validate()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::kind::TYPE_LABEL;
    use crate::domain::topology::ServiceVolume;

    fn managed<'a>(project: &'a mut Project, name: &str, kind: ManagedKind) -> &'a mut Service {
        let svc = project.ensure_service(name);
        svc.image = kind.default_image().to_string();
        svc.labels
            .insert(TYPE_LABEL.to_string(), kind.name().to_string());
        svc
    }

    fn stack(postgres_user: Option<&str>) -> Project {
        let mut project = Project::new("prod");
        managed(&mut project, "adcm", ManagedKind::Adcm)
            .depends_on
            .insert("postgres".to_string(), Dependency::new(Condition::Healthy));
        let pg = managed(&mut project, "postgres", ManagedKind::Postgres);
        pg.user = postgres_user.map(str::to_string);
        pg.volumes
            .push(ServiceVolume::parse("prod-postgres:/data").unwrap());
        project
    }

    #[test]
    fn test_chown_only_for_non_root_with_volumes() {
        let mut svc = Service::new("postgres");
        svc.user = Some("10001:10001".to_string());
        assert!(chown_service(&svc).is_none());

        svc.volumes.push(ServiceVolume::parse("pg:/data").unwrap());
        let chown = chown_service(&svc).unwrap();
        assert_eq!(chown.name, "chown-postgres");
        assert_eq!(chown.user.as_deref(), Some("0:0"));
        assert_eq!(chown.command, vec!["-cex", "chown -v 10001:10001 /data"]);
        assert!(chown.has_profile(CHOWN_PROFILE));

        svc.user = Some("0".to_string());
        assert!(chown_service(&svc).is_none());
    }

    #[test]
    fn test_expand_full_stack() {
        let mut project = stack(Some("10001:10001"));
        let plan = expand(&mut project, false).unwrap();

        assert_eq!(plan.chown, vec!["chown-postgres"]);
        assert_eq!(plan.init, vec!["init-postgres"]);
        assert_eq!(plan.barrier.as_deref(), Some(PAUSE_SERVICE));
        assert_eq!(plan.primary, vec!["adcm", "postgres"]);

        let init = project.service("init-postgres").unwrap();
        assert_eq!(init.command, vec!["initdb"]);
        assert_eq!(init.volumes, project.service("postgres").unwrap().volumes);
        let edge = init.depends_on["chown-postgres"];
        assert_eq!(edge.condition, Condition::CompletedSuccessfully);
        assert!(edge.required);
        assert_eq!(
            init.environment.get("POSTGRES_SHUTDOWN_MODE"),
            Some(&Some("smart".to_string()))
        );
        assert!(!init.environment.contains_key("PG_ENTRYPOINT_LOG_DEBUG"));

        let pause = project.service(PAUSE_SERVICE).unwrap();
        assert_eq!(pause.depends_on.len(), 2);
        assert!(pause
            .depends_on
            .values()
            .all(|d| d.condition == Condition::CompletedSuccessfully));
        assert!(!pause.has_profile(PRIMARY_PROFILE));

        assert!(project.service("adcm").unwrap().has_profile(PRIMARY_PROFILE));
        assert_eq!(project.names_with_profile(PRIMARY_PROFILE), vec!["adcm", "postgres"]);
    }

    #[test]
    fn test_expand_without_user_skips_chown() {
        let mut project = stack(None);
        let plan = expand(&mut project, true).unwrap();

        assert!(plan.chown.is_empty());
        let init = project.service("init-postgres").unwrap();
        assert!(init.depends_on.is_empty());
        assert!(init.environment.contains_key("PG_ENTRYPOINT_LOG_DEBUG"));
        assert_eq!(
            project.service("adcm").unwrap().depends_on["postgres"].condition,
            Condition::Healthy
        );
    }

    #[test]
    fn test_expand_is_idempotent() {
        let mut once = stack(Some("10001:10001"));
        let first = expand(&mut once, false).unwrap();
        let mut twice = once.clone();
        let second = expand(&mut twice, false).unwrap();
        assert_eq!(once, twice);
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_init_phase_means_no_barrier() {
        let mut project = Project::new("prod");
        managed(&mut project, "consul", ManagedKind::Consul);
        let plan = expand(&mut project, false).unwrap();
        assert!(!plan.has_init_phase());
        assert!(project.service(PAUSE_SERVICE).is_none());
        assert!(plan.init_phase_services().is_empty());
    }

    #[test]
    fn test_barrier_tracks_removed_services() {
        let mut project = stack(Some("10001:10001"));
        expand(&mut project, false).unwrap();

        project.remove_service("init-postgres");
        let pause = project.service(PAUSE_SERVICE).unwrap();
        assert!(!pause.depends_on.contains_key("init-postgres"));
        assert!(pause.depends_on.contains_key("chown-postgres"));

        project.remove_service("chown-postgres");
        assert_eq!(rebuild_barrier(&mut project), None);
        assert!(project.service(PAUSE_SERVICE).is_none());
    }
}
