//! `adi apply`: bring a rendered project up

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::open_secrets;
use crate::config::{self, RenderedFileShares};
use crate::infrastructure::{ComposeEngine, HttpSecretStore};
use crate::services::{
    ApplyOptions, ApplyOutcome, ApplyReport, MemoryShares, Orchestrator, SharePersistence,
    UnsealState,
};
use crate::ui;

pub struct ApplyArgs {
    pub file: PathBuf,
    pub options: ApplyOptions,
    pub age_key: String,
    pub age_key_file: PathBuf,
    pub vault_addr: Option<String>,
}

pub async fn execute(args: ApplyArgs) -> Result<()> {
    let project = config::load_project(&args.file)?;
    info!(
        "🚀 Applying {} ({} service(s)) from {}",
        project.name,
        project.services.len(),
        args.file.display()
    );

    // dry runs render tokens as-is
    let secrets_box = if args.options.dry_run {
        None
    } else {
        open_secrets(&project, &args.age_key, &args.age_key_file)?
    };

    let shares: Box<dyn SharePersistence> = match RenderedFileShares::for_project(&args.file, &project) {
        Some(file_shares) if !args.options.dry_run => Box::new(file_shares),
        _ => Box::new(MemoryShares::default()),
    };

    let http_store = args
        .vault_addr
        .as_deref()
        .map(HttpSecretStore::new)
        .transpose()
        .context("Invalid --vault-addr")?;

    let engine = ComposeEngine::new();
    let mut orchestrator = Orchestrator::new(
        &engine,
        shares.as_ref(),
        secrets_box.as_ref().map(|b| b.cipher()),
    )
    .with_options(args.options);
    if let Some(store) = &http_store {
        orchestrator = orchestrator.with_store(store);
    }

    let spinner = (!args.options.dry_run).then(|| {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .expect("Invalid spinner template"),
        );
        spinner.set_message(format!("Applying {}...", project.name));
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    });

    let name = project.name.clone();
    let outcome = orchestrator.apply(project).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    match outcome.with_context(|| format!("Failed to apply {}", name))? {
        ApplyOutcome::Rendered(rendered) => print!("{}", rendered),
        ApplyOutcome::Applied(report) => print_report(&name, &report),
    }
    Ok(())
}

fn print_report(name: &str, report: &ApplyReport) {
    ui::print_header(&format!("Applied {}", name));

    let mut rows = Vec::new();
    if report.plan.has_init_phase() {
        let init = report.plan.init_phase_services().join(", ");
        let state = if report.torn_down {
            "removed"
        } else {
            "kept"
        };
        rows.push(("Init phase".to_string(), format!("{} ({})", init, state)));
    }
    rows.push(("Started".to_string(), report.bring_up.started.join(", ")));
    if !report.bring_up.provisioned.is_empty() {
        rows.push((
            "Databases".to_string(),
            report.bring_up.provisioned.join(", "),
        ));
    }
    if !report.bring_up.skipped.is_empty() {
        rows.push((
            "Skipped".to_string(),
            report.bring_up.skipped.join(", ").yellow().to_string(),
        ));
    }
    if let Some(unseal) = &report.unseal {
        let state = match unseal.final_state() {
            UnsealState::Unsealed if unseal.initialized => "initialized and unsealed".to_string(),
            UnsealState::Unsealed => format!("unsealed ({} share(s))", unseal.shares_submitted),
            other => format!("{:?}", other),
        };
        rows.push(("Secret store".to_string(), state));
    }
    ui::print_rows(&rows);

    if report.unseal.as_ref().is_some_and(|u| u.initialized) {
        ui::print_warning("Unseal data was written to the topology file; keep it and the key safe");
    }
}
