//! CLI definitions for adi
//!
//! This module contains all CLI argument parsing structures using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{DEFAULT_KEY_FILE, DEFAULT_TOPOLOGY_FILE, IDENTITY_ENV};

#[derive(Parser)]
#[command(
    name = "adi",
    version,
    about = "Installer for ADCM application stacks",
    long_about = "Builds a container topology for ADCM and its database, secret store and\nservice-discovery agent, then bootstraps it through init, primary and\npost-provisioning phases."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate secrets and render the project topology
    Init {
        /// Project namespace
        #[arg(default_value = "adcm")]
        namespace: String,

        /// Rendered topology file
        #[arg(short, long, default_value = DEFAULT_TOPOLOGY_FILE)]
        output: PathBuf,

        /// Identity key file, created when missing
        #[arg(long, default_value = DEFAULT_KEY_FILE)]
        age_key_file: PathBuf,

        /// Store secrets as plaintext
        #[arg(long)]
        no_crypt: bool,

        /// Deploy a managed database (default)
        #[arg(long, overrides_with = "no_postgres")]
        postgres: bool,

        /// Use an external database instead of a managed one
        #[arg(long, overrides_with = "postgres")]
        no_postgres: bool,

        /// Deploy a secret store
        #[arg(long)]
        vault: bool,

        /// Deploy a service-discovery agent
        #[arg(long)]
        consul: bool,

        /// Build the project from a manifest file instead of flags
        #[arg(long, conflicts_with_all = ["vault", "consul", "no_postgres"])]
        from_manifest: Option<PathBuf>,

        /// Overwrite an existing topology or key file
        #[arg(long)]
        force: bool,
    },

    /// Bring a rendered project up
    Apply {
        /// Rendered topology file
        #[arg(short = 'f', long = "file", default_value = DEFAULT_TOPOLOGY_FILE)]
        file: PathBuf,

        /// Print the final topology instead of touching the engine
        #[arg(long)]
        dry_run: bool,

        /// Keep init containers and log database entrypoints verbosely
        #[arg(long)]
        debug: bool,

        /// Re-initialize the secret store even if unseal data exists
        #[arg(long)]
        force: bool,

        /// Environment variable holding the identity
        #[arg(long, default_value = IDENTITY_ENV)]
        age_key: String,

        /// Identity key file
        #[arg(long, default_value = DEFAULT_KEY_FILE)]
        age_key_file: PathBuf,

        /// Talk to the secret store over HTTP instead of its CLI
        #[arg(long, env = "BAO_ADDR")]
        vault_addr: Option<String>,
    },

    /// Stop and remove a project
    Down {
        /// Project namespace
        namespace: String,

        /// Remove named volumes too
        #[arg(long)]
        volumes: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List installed projects
    List {
        /// Include stopped containers
        #[arg(short, long)]
        all: bool,
    },

    /// Manage identities and project secrets
    Secrets {
        #[command(subcommand)]
        command: SecretsCommands,
    },
}

#[derive(Subcommand)]
pub enum SecretsCommands {
    /// Generate a new identity key file
    NewKey {
        #[arg(short, long, default_value = DEFAULT_KEY_FILE)]
        output: PathBuf,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Decrypt and print project secrets
    Show {
        #[arg(short = 'f', long = "file", default_value = DEFAULT_TOPOLOGY_FILE)]
        file: PathBuf,

        /// Only this service
        #[arg(long)]
        service: Option<String>,

        #[arg(long, default_value = IDENTITY_ENV)]
        age_key: String,

        #[arg(long, default_value = DEFAULT_KEY_FILE)]
        age_key_file: PathBuf,
    },

    /// Set or update one secret value of a service
    Set {
        /// Secret to set, as `<service>.<key>`
        target: String,

        value: String,

        #[arg(short = 'f', long = "file", default_value = DEFAULT_TOPOLOGY_FILE)]
        file: PathBuf,

        #[arg(long, default_value = IDENTITY_ENV)]
        age_key: String,

        #[arg(long, default_value = DEFAULT_KEY_FILE)]
        age_key_file: PathBuf,
    },

    /// Re-wrap the master key for a new identity
    RotateKey {
        #[arg(short = 'f', long = "file", default_value = DEFAULT_TOPOLOGY_FILE)]
        file: PathBuf,

        /// Key file of the new identity, created when missing
        #[arg(long)]
        new_key_file: PathBuf,

        #[arg(long, default_value = IDENTITY_ENV)]
        age_key: String,

        #[arg(long, default_value = DEFAULT_KEY_FILE)]
        age_key_file: PathBuf,
    },
}
