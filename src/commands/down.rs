//! `adi down`: stop and remove a project

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::domain::naming;
use crate::infrastructure::{ComposeEngine, Engine};
use crate::ui;

pub async fn execute(namespace: String, volumes: bool, yes: bool) -> Result<()> {
    naming::validate_object_name("namespace", &namespace)?;

    if !yes && !confirm(&namespace, volumes)? {
        println!("Cancelled");
        return Ok(());
    }

    let engine = ComposeEngine::new();
    teardown(&engine, &namespace, volumes).await?;
    ui::print_success(&format!("Removed {}", namespace));
    Ok(())
}

async fn teardown(engine: &dyn Engine, namespace: &str, volumes: bool) -> Result<()> {
    info!("🧹 Removing {}{}", namespace, if volumes { " and its volumes" } else { "" });
    engine
        .down(namespace, volumes)
        .await
        .with_context(|| format!("Failed to remove {}", namespace))
}

fn confirm(namespace: &str, volumes: bool) -> Result<bool> {
    if !console::user_attended() {
        bail!("Refusing to remove {} without a terminal; pass --yes", namespace);
    }

    let what = if volumes {
        "containers and volumes"
    } else {
        "containers"
    };
    print!("⚠️  This will remove all {} of {}. Continue? (y/N) ", what, namespace);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
