use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod config;
mod domain;
mod error;
mod infrastructure;
mod secrets;
mod services;
mod tools;
mod ui;

use cli::{Cli, Commands, SecretsCommands};
use commands::{apply, down, init, list};
use config::KindRegistry;
use services::{ApplyOptions, Components};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // LOGGING=debug,info,warn,error or just LOGGING=debug
    let log_level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if cli.verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false)
        .init();

    let registry = KindRegistry::builtin();

    let result = match cli.command {
        Commands::Init {
            namespace,
            output,
            age_key_file,
            no_crypt,
            postgres: _,
            no_postgres,
            vault,
            consul,
            from_manifest,
            force,
        } => init::execute(
            &registry,
            init::InitArgs {
                namespace,
                output,
                age_key_file,
                no_crypt,
                components: Components {
                    postgres: !no_postgres,
                    vault,
                    consul,
                },
                from_manifest,
                force,
            },
        ),
        Commands::Apply {
            file,
            dry_run,
            debug,
            force,
            age_key,
            age_key_file,
            vault_addr,
        } => {
            apply::execute(apply::ApplyArgs {
                file,
                options: ApplyOptions {
                    dry_run,
                    debug,
                    force,
                },
                age_key,
                age_key_file,
                vault_addr,
            })
            .await
        }
        Commands::Down {
            namespace,
            volumes,
            yes,
        } => down::execute(namespace, volumes, yes).await,
        Commands::List { all } => list::execute(all).await,
        Commands::Secrets { command } => match command {
            SecretsCommands::NewKey { output, force } => commands::secrets::new_key(&output, force),
            SecretsCommands::Show {
                file,
                service,
                age_key,
                age_key_file,
            } => commands::secrets::show(&file, service.as_deref(), &age_key, &age_key_file),
            SecretsCommands::Set {
                target,
                value,
                file,
                age_key,
                age_key_file,
            } => commands::secrets::set(&file, &target, &value, &age_key, &age_key_file),
            SecretsCommands::RotateKey {
                file,
                new_key_file,
                age_key,
                age_key_file,
            } => commands::secrets::rotate_key(&file, &new_key_file, &age_key, &age_key_file),
        },
    };

    if let Err(e) = result {
        ui::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
