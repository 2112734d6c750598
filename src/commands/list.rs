//! `adi list`: installed projects and their combined status

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use colored::Colorize;

use crate::infrastructure::{ComposeEngine, Engine, Instance};
use crate::ui;

pub async fn execute(all: bool) -> Result<()> {
    let engine = ComposeEngine::new();
    let projects = collect(&engine, all).await?;

    if projects.is_empty() {
        ui::print_info("No projects found");
        return Ok(());
    }

    ui::print_header("Projects");
    let rows: Vec<(String, String)> = projects
        .into_iter()
        .map(|(project, status)| {
            let status = if status.contains("running") {
                status.green().to_string()
            } else {
                status.yellow().to_string()
            };
            (project, status)
        })
        .collect();
    ui::print_rows(&rows);
    Ok(())
}

async fn collect(engine: &dyn Engine, all: bool) -> Result<BTreeMap<String, String>> {
    let instances = engine
        .list(all)
        .await
        .context("Failed to list containers")?;
    Ok(summarize(&instances))
}

/// Combined status per compose project, e.g. `exited(1), running(2)`
///
/// Containers outside a compose project are left out.
pub fn summarize(instances: &[Instance]) -> BTreeMap<String, String> {
    let mut counts: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
    for instance in instances.iter().filter(|i| !i.project.is_empty()) {
        *counts
            .entry(instance.project.as_str())
            .or_default()
            .entry(instance.state.name())
            .or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(project, states)| {
            let status = states
                .into_iter()
                .map(|(state, n)| format!("{}({})", state, n))
                .collect::<Vec<_>>()
                .join(", ");
            (project.to_string(), status)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::Project;
    use crate::infrastructure::engine::mock::RecordingEngine;
    use crate::infrastructure::InstanceState;

    fn instance(project: &str, service: &str, state: InstanceState) -> Instance {
        Instance {
            name: format!("{project}-{service}"),
            project: project.to_string(),
            service: service.to_string(),
            state,
            health: None,
        }
    }

    #[test]
    fn test_summarize_groups_and_sorts() {
        let instances = vec![
            instance("prod", "adcm", InstanceState::Running),
            instance("prod", "postgres", InstanceState::Running),
            instance("prod", "init-postgres", InstanceState::Exited),
            instance("dev", "adcm", InstanceState::Exited),
            instance("", "stray", InstanceState::Running),
        ];

        let summary = summarize(&instances);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary["prod"], "exited(1), running(2)");
        assert_eq!(summary["dev"], "exited(1)");
    }

    #[tokio::test]
    async fn test_collect_from_engine() {
        let engine = RecordingEngine::new();
        let mut project = Project::new("prod");
        project.ensure_service("adcm");
        project.ensure_service("postgres");
        engine.create(&project).await.unwrap();
        engine.start("prod", &["postgres".to_string()]).await.unwrap();

        let summary = tokio_test::assert_ok!(collect(&engine, true).await);
        assert_eq!(summary["prod"], "created(1), running(1)");
    }
}
